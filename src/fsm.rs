// Controller finite state machine for the MCTP session.
//
// One background worker owns the transport and performs all serial I/O.
// The foreground enqueues orders and reads observer events; the two sides
// meet on a condition variable guarding (state, order queue, running).

use crate::config::FsmConfig;
use crate::frame::{EOM, Frame, FrameKind, serialize_control};
use crate::observer::{EventSink, ObserverEvent, event_queue};
use crate::registry::DataRegistry;
use crate::timeout::{DeadlineTable, TimeoutKey};
use crate::transport::Transport;
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum State {
    Idle,
    Sync,
    Connected,
    Transfer,
}

/// External orders queued by the foreground. `OpenSync` is not an order;
/// it is a guarded state change performed directly under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Request,
    Stop,
    Drop,
}

struct Shared {
    state: State,
    orders: VecDeque<Order>,
    running: bool,
}

struct SharedState {
    inner: Mutex<Shared>,
    signal: Condvar,
}

/// Handle to the session worker. Dropping the handle shuts the worker
/// down.
pub struct CommTask {
    shared: Arc<SharedState>,
    registry: Arc<RwLock<DataRegistry>>,
    sink: EventSink,
    events: Receiver<ObserverEvent>,
    worker: Option<JoinHandle<()>>,
}

impl CommTask {
    /// Spawn the worker thread on an open transport. The transport is
    /// owned (but not opened or closed) by the worker from here on.
    pub fn start(
        transport: Box<dyn Transport>,
        registry: Arc<RwLock<DataRegistry>>,
        config: FsmConfig,
    ) -> Self {
        let shared = Arc::new(SharedState {
            inner: Mutex::new(Shared {
                state: State::Idle,
                orders: VecDeque::new(),
                running: true,
            }),
            signal: Condvar::new(),
        });
        let (sink, events) = event_queue();

        let mut worker = Worker {
            shared: Arc::clone(&shared),
            transport,
            registry: Arc::clone(&registry),
            sink: sink.clone(),
            config,
            deadlines: DeadlineTable::new(),
            frames_received: 0,
            bytes_received: 0,
        };
        let handle = std::thread::spawn(move || worker.run());

        Self {
            shared,
            registry,
            sink,
            events,
            worker: Some(handle),
        }
    }

    /// Advisory view of the current state; only the worker mutates it.
    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    /// Block until the session has left `Transfer`, or `timeout` elapses.
    /// Returns whether the transfer actually ended. Callers that want to
    /// touch the registry after a stop wait here first, so the worker's
    /// in-flight ingest is done.
    pub fn wait_transfer_end(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.inner.lock();
        while shared.state == State::Transfer {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.shared.signal.wait_for(&mut shared, deadline - now);
        }
        true
    }

    /// Queue the worker pops observer events from.
    pub fn events(&self) -> Receiver<ObserverEvent> {
        self.events.clone()
    }

    pub fn registry(&self) -> Arc<RwLock<DataRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Begin the sync handshake. Accepted only while idle.
    pub fn open_sync(&self) {
        let mut shared = self.shared.inner.lock();
        if shared.running && shared.state == State::Idle {
            info!("{} >> {}", State::Idle, State::Sync);
            shared.state = State::Sync;
            self.sink.status_syncing();
            self.shared.signal.notify_all();
        }
    }

    /// Ask for the data transfer to start. Serviced only in `Connected`.
    pub fn send_request(&self) {
        self.push_order(Order::Request);
    }

    /// Ask for the data transfer to stop. Serviced only in `Transfer`.
    pub fn send_stop(&self) {
        self.push_order(Order::Stop);
    }

    /// Tear the session down. Serviced in any state, ahead of anything
    /// else queued.
    pub fn send_drop(&self) {
        self.push_order(Order::Drop);
    }

    fn push_order(&self, order: Order) {
        let mut shared = self.shared.inner.lock();
        if shared.running {
            shared.orders.push_back(order);
            self.shared.signal.notify_all();
        }
    }

    /// Shut the worker down: let it drain pending orders for up to two
    /// seconds, then clear the running flag, force `Idle` and join.
    pub fn stop(&mut self) {
        let drain_deadline = Instant::now() + Duration::from_secs(2);
        {
            let mut shared = self.shared.inner.lock();
            while !shared.orders.is_empty() && Instant::now() < drain_deadline {
                self.shared.signal.notify_all();
                let _ = self
                    .shared
                    .signal
                    .wait_for(&mut shared, Duration::from_millis(50));
            }
            shared.running = false;
            shared.state = State::Idle;
            self.shared.signal.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CommTask {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    shared: Arc<SharedState>,
    transport: Box<dyn Transport>,
    registry: Arc<RwLock<DataRegistry>>,
    sink: EventSink,
    config: FsmConfig,
    deadlines: DeadlineTable,
    frames_received: u64,
    bytes_received: u64,
}

impl Worker {
    fn run(&mut self) {
        loop {
            let (state, order) = {
                let mut shared = self.shared.inner.lock();
                if !shared.running {
                    break;
                }
                if shared.orders.is_empty()
                    && matches!(shared.state, State::Idle | State::Connected)
                {
                    // Nothing to do until an order or state change lands.
                    self.shared.signal.wait(&mut shared);
                    if !shared.running {
                        break;
                    }
                }
                (shared.state, select_order(&mut shared.orders))
            };

            // Orders first, highest precedence only; the state body runs
            // on ticks without a serviceable order.
            match order {
                Some(Order::Drop) => {
                    self.drop_loop();
                    continue;
                }
                Some(Order::Request) if state == State::Connected => {
                    self.begin_transfer();
                    continue;
                }
                Some(Order::Stop) if state == State::Transfer => {
                    self.stop_loop();
                    continue;
                }
                Some(other) => {
                    debug!("order {other:?} ignored in state {state}");
                }
                None => {}
            }

            match state {
                State::Sync => self.sync_loop(),
                State::Transfer => self.transfer_tick(),
                State::Idle | State::Connected => {}
            }
        }
        debug!("session worker exiting");
    }

    fn running(&self) -> bool {
        self.shared.inner.lock().running
    }

    fn drop_pending(&self) -> bool {
        self.shared.inner.lock().orders.contains(&Order::Drop)
    }

    fn set_state(&self, new_state: State) {
        let mut shared = self.shared.inner.lock();
        info!("{} >> {}", shared.state, new_state);
        shared.state = new_state;
        self.shared.signal.notify_all();
    }

    /// Session-fatal transport failure: back to idle, tell the observer.
    fn fail_session(&mut self, context: &str) {
        warn!("session failed: {context}");
        self.registry.write().clear_channels();
        self.set_state(State::Idle);
        self.sink.status_failed();
    }

    fn send_frame(&mut self, kind: FrameKind) -> bool {
        match self.transport.write(&serialize_control(kind)) {
            Ok(()) => true,
            Err(e) => {
                self.fail_session(&format!("sending {kind}: {e}"));
                false
            }
        }
    }

    /// Repeatedly offer Sync until the performer answers with SyncResp or
    /// the handshake window closes.
    fn sync_loop(&mut self) {
        self.deadlines.arm(TimeoutKey::Sync, self.config.sync_deadline);
        loop {
            if !self.running() || self.drop_pending() {
                return;
            }
            if self.deadlines.expired(TimeoutKey::Sync) {
                warn!("sync handshake timed out");
                self.set_state(State::Idle);
                self.sink.status_failed();
                return;
            }
            if !self.send_frame(FrameKind::Sync) {
                return;
            }
            let raw = match self.transport.read_until(&EOM) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    self.fail_session(&format!("sync read: {e}"));
                    return;
                }
            };
            if !self.running() {
                return;
            }
            let frame = match Frame::parse(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("unparseable frame during sync: {e}");
                    continue;
                }
            };
            if frame.kind == FrameKind::SyncResp {
                let n_channels = frame.n_of_channels;
                {
                    let mut registry = self.registry.write();
                    registry.clear_channels();
                    for ch_id in 0..n_channels {
                        registry.add_channel(ch_id);
                    }
                }
                if !self.send_frame(FrameKind::Ack) {
                    return;
                }
                self.set_state(State::Connected);
                self.sink.status_connected(n_channels);
                return;
            }
            debug!("unexpected {} frame during sync", frame.kind);
        }
    }

    /// Connected + Request order: announce the transfer and reset the
    /// per-transfer bookkeeping.
    fn begin_transfer(&mut self) {
        if !self.send_frame(FrameKind::Request) {
            return;
        }
        {
            let mut registry = self.registry.write();
            registry.clear_data();
            registry.set_time_ref();
        }
        self.frames_received = 0;
        self.bytes_received = 0;
        self.set_state(State::Transfer);
    }

    /// One bounded read while streaming. Timeouts are just a quiet tick.
    fn transfer_tick(&mut self) {
        let raw = match self.transport.read_until(&EOM) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                self.fail_session(&format!("transfer read: {e}"));
                return;
            }
        };
        let frame = match Frame::parse(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("frame dropped: {e}");
                return;
            }
        };
        match frame.kind {
            FrameKind::Data => self.ingest(frame),
            FrameKind::Stop => {
                // Performer ended the stream on its own.
                self.log_transfer_tally();
                self.set_state(State::Connected);
            }
            other => debug!("unexpected {other} frame during transfer"),
        }
    }

    fn ingest(&mut self, frame: Frame) {
        self.frames_received += 1;
        self.bytes_received += u64::from(frame.data_size);

        let updated: Vec<u8> = frame.channels.keys().copied().collect();
        let texts: BTreeMap<u8, String> = frame
            .text_channels()
            .map(|(id, text)| (id, text.to_string()))
            .collect();
        {
            // Commit the whole frame before the observer hears about it.
            let mut registry = self.registry.write();
            registry.append_data(frame.numeric_channels());
            registry.append_text(frame.text_channels());
        }
        self.sink.channel_info_update(updated);
        self.sink.append_text(texts);
        self.sink.channel_info_draw();
    }

    fn log_transfer_tally(&mut self) {
        if self.frames_received > 0 {
            info!(
                "transfer ended: {} frames, {} payload bytes",
                self.frames_received, self.bytes_received
            );
        }
        self.frames_received = 0;
        self.bytes_received = 0;
    }

    /// Transfer + Stop order: keep offering Stop until the performer
    /// acknowledges. Expiry forces the session back to idle.
    fn stop_loop(&mut self) {
        self.deadlines.arm(TimeoutKey::Stop, self.config.stop_deadline);
        loop {
            if !self.running() || self.drop_pending() {
                return;
            }
            if self.deadlines.expired(TimeoutKey::Stop) {
                warn!("no stop acknowledgement; dropping session");
                self.log_transfer_tally();
                self.registry.write().clear_channels();
                self.set_state(State::Idle);
                return;
            }
            if !self.send_frame(FrameKind::Stop) {
                return;
            }
            let raw = match self.transport.read_until(&EOM) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    self.fail_session(&format!("stop read: {e}"));
                    return;
                }
            };
            match Frame::parse(&raw) {
                Ok(frame) if frame.kind == FrameKind::Stop => {
                    self.log_transfer_tally();
                    self.set_state(State::Connected);
                    return;
                }
                Ok(frame) => debug!("{} frame while stopping", frame.kind),
                Err(e) => debug!("unparseable frame while stopping: {e}"),
            }
        }
    }

    /// Best-effort teardown: offer Drop until echoed or the window
    /// closes, then go idle regardless.
    fn drop_loop(&mut self) {
        self.deadlines.arm(TimeoutKey::Drop, self.config.drop_deadline);
        loop {
            if !self.running() {
                break;
            }
            if self.deadlines.expired(TimeoutKey::Drop) {
                warn!("drop not acknowledged");
                break;
            }
            if let Err(e) = self.transport.write(&serialize_control(FrameKind::Drop)) {
                warn!("sending drop: {e}");
                break;
            }
            match self.transport.read_until(&EOM) {
                Ok(Some(raw)) => match Frame::parse(&raw) {
                    Ok(frame) if frame.kind == FrameKind::Drop => {
                        debug!("drop acknowledged");
                        break;
                    }
                    Ok(frame) => debug!("{} frame while dropping", frame.kind),
                    Err(e) => debug!("unparseable frame while dropping: {e}"),
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("drop read: {e}");
                    break;
                }
            }
        }
        self.log_transfer_tally();
        self.registry.write().clear_channels();
        self.set_state(State::Idle);
    }
}

/// Drain the queue and keep only the highest-precedence order of this
/// tick: Drop > Request > Stop.
fn select_order(orders: &mut VecDeque<Order>) -> Option<Order> {
    if orders.is_empty() {
        return None;
    }
    let drained: Vec<Order> = orders.drain(..).collect();
    let pick = if drained.contains(&Order::Drop) {
        Order::Drop
    } else if drained.contains(&Order::Request) {
        Order::Request
    } else {
        Order::Stop
    };
    if drained.len() > 1 {
        debug!("{} lower-precedence orders discarded", drained.len() - 1);
    }
    Some(pick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_wins_over_request_and_stop() {
        let mut orders = VecDeque::from(vec![Order::Stop, Order::Request, Order::Drop]);
        assert_eq!(select_order(&mut orders), Some(Order::Drop));
        assert!(orders.is_empty());
    }

    #[test]
    fn request_wins_over_stop() {
        let mut orders = VecDeque::from(vec![Order::Stop, Order::Request]);
        assert_eq!(select_order(&mut orders), Some(Order::Request));
        assert!(orders.is_empty());
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let mut orders = VecDeque::new();
        assert_eq!(select_order(&mut orders), None);
    }
}

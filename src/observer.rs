// Event surface between the session worker and a UI or CLI adapter.
//
// The worker pushes events into an unbounded queue; the adapter pops at
// its own pace and may coalesce. Events come out in production order.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::BTreeMap;

/// Notifications emitted by the session state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    /// Sync handshake failed or the session died.
    StatusFailed,
    /// Sync handshake started.
    StatusSyncing,
    /// Session established with this many enrolled channels.
    StatusConnected(u8),
    /// Text arrivals of one DATA frame, keyed by channel id.
    AppendText(BTreeMap<u8, String>),
    /// Channels touched by the latest DATA frame.
    ChannelInfoUpdate(Vec<u8>),
    /// The per-channel info shown to the user should be redrawn.
    ChannelInfoDraw,
}

/// Sending half held by the state machine.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: Sender<ObserverEvent>,
}

impl EventSink {
    pub(crate) fn status_failed(&self) {
        self.emit(ObserverEvent::StatusFailed);
    }

    pub(crate) fn status_syncing(&self) {
        self.emit(ObserverEvent::StatusSyncing);
    }

    pub(crate) fn status_connected(&self, n_channels: u8) {
        self.emit(ObserverEvent::StatusConnected(n_channels));
    }

    pub(crate) fn append_text(&self, texts: BTreeMap<u8, String>) {
        self.emit(ObserverEvent::AppendText(texts));
    }

    pub(crate) fn channel_info_update(&self, channels: Vec<u8>) {
        self.emit(ObserverEvent::ChannelInfoUpdate(channels));
    }

    pub(crate) fn channel_info_draw(&self) {
        self.emit(ObserverEvent::ChannelInfoDraw);
    }

    fn emit(&self, event: ObserverEvent) {
        // A vanished adapter is not the worker's problem.
        let _ = self.tx.send(event);
    }
}

pub(crate) fn event_queue() -> (EventSink, Receiver<ObserverEvent>) {
    let (tx, rx) = unbounded();
    (EventSink { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_come_out_in_production_order() {
        let (sink, rx) = event_queue();
        sink.status_syncing();
        sink.status_connected(3);
        sink.channel_info_draw();
        assert_eq!(rx.try_recv().unwrap(), ObserverEvent::StatusSyncing);
        assert_eq!(rx.try_recv().unwrap(), ObserverEvent::StatusConnected(3));
        assert_eq!(rx.try_recv().unwrap(), ObserverEvent::ChannelInfoDraw);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn emitting_without_a_listener_is_harmless() {
        let (sink, rx) = event_queue();
        drop(rx);
        sink.status_failed();
    }
}

//! Controller-side implementation of MCTP, a point-to-point binary
//! framing protocol for streaming sampled data from an embedded performer
//! over a serial UART link.
//!
//! The crate provides the protocol stack: the frame codec, the session
//! state machine with its order queue and retry loops, the per-channel
//! data registry with synthesized time axes, and the serial transport the
//! state machine drives. Frontends (GUI or CLI) sit on the observer event
//! queue and read-only registry snapshots; they are not part of this
//! crate.
//!
//! # Example
//! This example opens a performer port, starts the session worker and
//! runs the sync handshake.
//!
//! ```no_run
//! use mctp_ctrl::{CommTask, DataRegistry, FsmConfig, SerialLink};
//! use parking_lot::RwLock;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), mctp_ctrl::Error> {
//! let mut link = SerialLink::new();
//! link.open("/dev/ttyACM0", 115_200, Duration::from_secs(2))?;
//!
//! let registry = Arc::new(RwLock::new(DataRegistry::new()));
//! let task = CommTask::start(Box::new(link), Arc::clone(&registry), FsmConfig::default());
//! task.open_sync();
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod config;
pub mod frame;
pub mod fsm;
pub mod observer;
pub mod registry;
pub mod timeout;
pub mod transport;

pub use config::FsmConfig;
pub use frame::{ChannelPayload, DataType, Frame, FrameError, FrameKind};
pub use fsm::{CommTask, Order, State};
pub use observer::ObserverEvent;
pub use registry::{DataChannel, DataRegistry};
pub use transport::{SerialLink, Transport, TransportError};

/// Errors for the controller api
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

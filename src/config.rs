// Contains defaults and tunables for the controller session.

use std::time::Duration;

/// Default port used by command-line mode.
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUD: u32 = 115_200;
/// Serial read window; must stay at or below the shortest loop deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadlines for the retrying handshake loops. The defaults are the
/// protocol values; tests shrink them to keep wall time down.
#[derive(Debug, Clone)]
pub struct FsmConfig {
    /// Window for the whole sync handshake.
    pub sync_deadline: Duration,
    /// Window to wait for the performer's Stop acknowledgement.
    pub stop_deadline: Duration,
    /// Window to wait for the performer's Drop echo.
    pub drop_deadline: Duration,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            sync_deadline: Duration::from_secs(5),
            stop_deadline: Duration::from_secs(2),
            drop_deadline: Duration::from_secs(3),
        }
    }
}

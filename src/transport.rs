/* Abstraction for the serial transport semantics */

use bytes::{BufMut, BytesMut};
use log::{debug, warn};
use serial2::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use thiserror::Error;

const READ_CHUNK_SIZE: usize = 64;
/// Upper bound on buffered bytes while hunting for a delimiter. A stream
/// that produces this much without one is not speaking the protocol.
const MAX_PENDING_SIZE: usize = 64 * 1024;

/// Errors surfaced by the transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Port(String),
}

/// Byte-level contract the session state machine drives. Implemented by
/// the serial link in production and by scripted mocks in tests.
pub trait Transport: Send {
    /// Write a full buffer to the link.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read until `delimiter` arrives. Returns the bytes up to and
    /// including the delimiter, `None` if the read window closed without
    /// one, or an error on I/O failure.
    fn read_until(&mut self, delimiter: &[u8]) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Owns at most one open serial port and frames its byte stream on a
/// delimiter. Bytes past a delimiter are kept for the next call.
#[derive(Debug)]
pub struct SerialLink {
    port: Option<SerialPort>,
    pending: BytesMut,
    read_timeout: Duration,
}

impl SerialLink {
    pub fn new() -> Self {
        Self {
            port: None,
            pending: BytesMut::with_capacity(READ_CHUNK_SIZE * 4),
            read_timeout: Duration::from_secs(2),
        }
    }

    /// Open `port_name` at `baud_rate`. Opening while a port is already
    /// held is an error; the caller must close first.
    pub fn open(
        &mut self,
        port_name: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Err(TransportError::Port(
                "attempting to open a busy transport".to_string(),
            ));
        }
        let mut port = SerialPort::open(port_name, baud_rate)?;
        port.set_read_timeout(read_timeout)?;
        // Stale bytes from before our session would confuse the first parse.
        let _ = port.discard_input_buffer();
        debug!("opened {port_name} at {baud_rate} baud");
        self.port = Some(port);
        self.read_timeout = read_timeout;
        self.pending.clear();
        Ok(())
    }

    pub fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("serial port closed");
        }
        self.pending.clear();
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// List candidate performer ports. serial2 exposes device paths only,
    /// so the USB/UART/ACM filter matches on the path.
    pub fn list_ports() -> Result<Vec<String>, TransportError> {
        let ports = SerialPort::available_ports()?;
        Ok(ports
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|name| {
                let upper = name.to_uppercase();
                upper.contains("USB") || upper.contains("UART") || upper.contains("ACM")
            })
            .collect())
    }
}

impl Transport for SerialLink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Port("write on closed transport".to_string()))?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(msg) = take_delimited(&mut self.pending, delimiter) {
            return Ok(Some(msg));
        }
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Port("read on closed transport".to_string()))?;

        let timer = Instant::now();
        let mut chunk_buf = [0u8; READ_CHUNK_SIZE];

        // Canonical chunked read loop: accumulate until the delimiter
        // shows up or the read window closes.
        while timer.elapsed() < self.read_timeout {
            match port.read(&mut chunk_buf) {
                Ok(0) => break,
                Ok(n_read) => {
                    if self.pending.len() + n_read > MAX_PENDING_SIZE {
                        self.pending.clear();
                        let _ = port.discard_input_buffer();
                        return Err(TransportError::Port(format!(
                            "no delimiter within {MAX_PENDING_SIZE} buffered bytes"
                        )));
                    }
                    self.pending.put_slice(&chunk_buf[..n_read]);
                    if let Some(msg) = take_delimited(&mut self.pending, delimiter) {
                        return Ok(Some(msg));
                    }
                }
                // Port-level timeout with no data; keep trying until the
                // outer window closes.
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => {
                    warn!("serial read failed: {e}");
                    return Err(TransportError::Io(e));
                }
            }
        }
        Ok(None)
    }
}

/// Cut the first delimited message out of `pending`, delimiter included.
fn take_delimited(pending: &mut BytesMut, delimiter: &[u8]) -> Option<Vec<u8>> {
    if delimiter.is_empty() {
        return None;
    }
    let pos = pending
        .windows(delimiter.len())
        .position(|window| window == delimiter)?;
    Some(pending.split_to(pos + delimiter.len()).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuts_message_at_delimiter() {
        let mut pending = BytesMut::from(&b"abc$%&leftover"[..]);
        let msg = take_delimited(&mut pending, b"$%&").unwrap();
        assert_eq!(msg, b"abc$%&");
        assert_eq!(&pending[..], b"leftover");
    }

    #[test]
    fn keeps_bytes_without_delimiter() {
        let mut pending = BytesMut::from(&b"abc$%"[..]);
        assert!(take_delimited(&mut pending, b"$%&").is_none());
        assert_eq!(&pending[..], b"abc$%");
    }

    #[test]
    fn consecutive_messages_come_out_one_at_a_time() {
        let mut pending = BytesMut::from(&b"one$%&two$%&"[..]);
        assert_eq!(take_delimited(&mut pending, b"$%&").unwrap(), b"one$%&");
        assert_eq!(take_delimited(&mut pending, b"$%&").unwrap(), b"two$%&");
        assert!(take_delimited(&mut pending, b"$%&").is_none());
    }

    #[test]
    fn closed_link_reports_port_error() {
        let mut link = SerialLink::new();
        assert!(matches!(
            link.write(b"x"),
            Err(TransportError::Port(_))
        ));
        assert!(matches!(
            link.read_until(b"$%&"),
            Err(TransportError::Port(_))
        ));
        assert!(!link.is_open());
    }
}

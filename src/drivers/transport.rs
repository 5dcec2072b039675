use crate::utils::dyn_future::DynFuture;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Failure of the byte channel to the adapter. Fatal to the bus session;
/// nothing at this layer retries.
#[derive(Debug)]
pub enum ConnectionError {
    /// No adapter matching the descriptor is attached.
    NotFound,
    /// The channel was closed, locally or by unplugging the adapter.
    Closed,
    Io(std::io::Error),
    /// Backend-specific failure.
    Device(String),
}

impl Error for ConnectionError {}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::NotFound => write!(f, "Transceiver not found"),
            ConnectionError::Closed => write!(f, "Connection closed"),
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectionError::Device(msg) => write!(f, "Device error: {}", msg),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> ConnectionError {
        ConnectionError::Io(e)
    }
}

/// Duplex byte channel to one bus transceiver. Carries opaque adapter
/// packets; no knowledge of the DALI protocol. Owned exclusively by the
/// dispatcher task of one bus.
pub trait Transport: Send {
    /// Write one packet. Completes when the packet is handed to the
    /// adapter, not when it is on the bus.
    fn write(&mut self, data: &[u8]) -> DynFuture<'_, Result<(), ConnectionError>>;

    /// Read the next packet, waiting at most `wait`. `Ok(None)` is a
    /// timeout, which is not an error at this layer.
    fn read_timeout(
        &mut self,
        wait: Duration,
    ) -> DynFuture<'_, Result<Option<Vec<u8>>, ConnectionError>>;

    fn close(&mut self) -> DynFuture<'_, Result<(), ConnectionError>>;
}

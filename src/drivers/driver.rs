use super::transport::Transport;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

/// A forward frame as sent on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaliFrame {
    Frame16([u8; 2]),
    Frame24([u8; 3]),
}

/// Outcome of one send transaction.
#[derive(Debug)]
pub enum DaliSendResult {
    /// Sent, no answer expected or received.
    Ok,
    /// Backward frame received.
    Answer(u8),
    /// An answer was expected but none arrived in the response window.
    Timeout,
    /// Framing error on the backward channel, normally several devices
    /// answering at once.
    Framing,
    /// The bus is locked for addressing; retry after the scan finishes.
    Busy,
    /// The transport failed; the session is dead.
    Connection(super::transport::ConnectionError),
    DriverError(Box<dyn Error + Send + Sync>),
}

impl DaliSendResult {
    /// Accept any completed transmission, with or without an answer.
    pub fn check_send(self) -> Result<(), DaliSendResult> {
        match self {
            DaliSendResult::Ok | DaliSendResult::Answer(_) | DaliSendResult::Timeout => Ok(()),
            e => Err(e),
        }
    }

    /// Require an answer byte.
    pub fn check_answer(self) -> Result<u8, DaliSendResult> {
        match self {
            DaliSendResult::Answer(v) => Ok(v),
            e => Err(e),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DaliSendResult::Timeout)
    }

    pub fn is_framing_error(&self) -> bool {
        matches!(self, DaliSendResult::Framing)
    }
}

impl Error for DaliSendResult {}

impl fmt::Display for DaliSendResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaliSendResult::Ok => write!(f, "Sent"),
            DaliSendResult::Answer(v) => write!(f, "Answer: 0x{:02x}", v),
            DaliSendResult::Timeout => write!(f, "No response"),
            DaliSendResult::Framing => write!(f, "Framing error"),
            DaliSendResult::Busy => write!(f, "Bus busy"),
            DaliSendResult::Connection(e) => write!(f, "Connection error: {}", e),
            DaliSendResult::DriverError(e) => write!(f, "Driver error: {}", e),
        }
    }
}

/// Traffic observed on the bus that was not the answer to a command sent
/// by this master, typically another controller at work.
#[derive(Debug, Clone)]
pub enum DaliBusEventType {
    Frame8(u8),
    Frame16([u8; 2]),
    Frame24([u8; 3]),
    FramingError,
}

#[derive(Debug, Clone)]
pub struct DaliBusEvent {
    pub timestamp: Instant,
    pub event_type: DaliBusEventType,
}

#[derive(Debug)]
pub enum OpenError {
    NotFound,
    ParameterError(String),
    DriverError(Box<dyn Error + Send + Sync>),
}

impl Error for OpenError {}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenError::NotFound => write!(f, "No matching driver"),
            OpenError::ParameterError(msg) => write!(f, "Invalid driver parameter: {}", msg),
            OpenError::DriverError(e) => write!(f, "Failed to open driver: {}", e),
        }
    }
}

/// One registered transport backend.
pub struct DriverInfo {
    pub name: String,
    pub description: String,
    pub open: fn(HashMap<String, String>) -> Result<Box<dyn Transport>, OpenError>,
}

lazy_static! {
    static ref DRIVERS: Mutex<Vec<DriverInfo>> = Mutex::new(Vec::new());
}

pub fn add_driver(info: DriverInfo) {
    let mut drivers = DRIVERS.lock().unwrap();
    if !drivers.iter().any(|d| d.name == info.name) {
        drivers.push(info);
    }
}

pub fn driver_names() -> Vec<String> {
    DRIVERS.lock().unwrap().iter().map(|d| d.name.clone()).collect()
}

/// Open a transport by name. `target` is `"name"` or
/// `"name:key=value,key=value"`; `"default"` selects the first
/// registered driver.
pub fn open(target: &str) -> Result<Box<dyn Transport>, OpenError> {
    let (name, params) = match target.split_once(':') {
        Some((name, rest)) => {
            let mut params = HashMap::new();
            for item in rest.split(',').filter(|s| !s.is_empty()) {
                match item.split_once('=') {
                    Some((k, v)) => {
                        params.insert(k.to_string(), v.to_string());
                    }
                    None => {
                        return Err(OpenError::ParameterError(format!(
                            "expected key=value, got {:?}",
                            item
                        )))
                    }
                }
            }
            (name, params)
        }
        None => (target, HashMap::new()),
    };
    let open = {
        let drivers = DRIVERS.lock().unwrap();
        let driver = if name == "default" {
            drivers.first()
        } else {
            drivers.iter().find(|d| d.name == name)
        }
        .ok_or(OpenError::NotFound)?;
        driver.open
    };
    open(params)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn send_result_checks() {
        assert!(DaliSendResult::Ok.check_send().is_ok());
        assert!(DaliSendResult::Timeout.check_send().is_ok());
        assert!(DaliSendResult::Busy.check_send().is_err());
        assert_eq!(DaliSendResult::Answer(0x42).check_answer().unwrap(), 0x42);
        assert!(matches!(
            DaliSendResult::Timeout.check_answer(),
            Err(DaliSendResult::Timeout)
        ));
    }
}

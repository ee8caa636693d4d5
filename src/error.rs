//! # Modbus Engine Error Handling
//!
//! One error type covers every failure the engine can report, from socket
//! and serial failures up to malformed confirmations and exception replies.
//!
//! ## Error Categories
//!
//! | Category        | Variants                                             | Recovery        |
//! |-----------------|------------------------------------------------------|-----------------|
//! | Transport       | `Io`, `Connection`                                   | LINK            |
//! | Timeout         | `Timeout`                                            | LINK (flush)    |
//! | Framing         | `Frame`, `CrcMismatch`                               | PROTOCOL        |
//! | Protocol        | `Protocol`, `InvalidData`, `Exception`, `BadSlave`.. | PROTOCOL (some) |
//! | Addressing      | `InvalidAddress`                                     | never retried   |
//! | Validation      | `TooMuchData`, `InvalidArgument`                     | rejected pre-IO |
//! | Configuration   | `Configuration`                                      | none            |
//!
//! ## Numeric codes
//!
//! Every error also has a numeric code. Transport errors carry the OS errno
//! when one is known; protocol errors live above [`MODBUS_ENOBASE`], with
//! exception replies mapped to `MODBUS_ENOBASE + exception_code`.
//!
//! ```rust
//! use modbus_engine::error::{strerror, ModbusError, EMBBADCRC};
//!
//! let err = ModbusError::crc_mismatch(0xC40B, 0x0000);
//! assert_eq!(err.code(), EMBBADCRC);
//! assert_eq!(strerror(err.code()), "Invalid CRC");
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Base of the protocol error code space, above any OS errno.
pub const MODBUS_ENOBASE: i32 = 112_345_678;

pub const EMBXILFUN: i32 = MODBUS_ENOBASE + 1;
pub const EMBXILADD: i32 = MODBUS_ENOBASE + 2;
pub const EMBXILVAL: i32 = MODBUS_ENOBASE + 3;
pub const EMBXSFAIL: i32 = MODBUS_ENOBASE + 4;
pub const EMBXACK: i32 = MODBUS_ENOBASE + 5;
pub const EMBXSBUSY: i32 = MODBUS_ENOBASE + 6;
pub const EMBXNACK: i32 = MODBUS_ENOBASE + 7;
pub const EMBXMEMPAR: i32 = MODBUS_ENOBASE + 8;
pub const EMBXGPATH: i32 = MODBUS_ENOBASE + 10;
pub const EMBXGTAR: i32 = MODBUS_ENOBASE + 11;
pub const EMBBADCRC: i32 = EMBXGTAR + 1;
pub const EMBBADDATA: i32 = EMBXGTAR + 2;
pub const EMBBADEXC: i32 = EMBXGTAR + 3;
pub const EMBUNKEXC: i32 = EMBXGTAR + 4;
pub const EMBMDATA: i32 = EMBXGTAR + 5;
pub const EMBBADSLAVE: i32 = EMBXGTAR + 6;

const EIO: i32 = 5;
const EINVAL: i32 = 22;
const ECONNRESET: i32 = 104;
const ETIMEDOUT: i32 = 110;

/// Error taxonomy used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Timeout,
    Framing,
    Protocol,
    Addressing,
    Validation,
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Framing => "framing",
            Self::Protocol => "protocol",
            Self::Addressing => "addressing",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Modbus engine error.
///
/// Variants carry enough context to print a useful message and to map back
/// to a numeric code with [`ModbusError::code`].
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Socket or serial port failure, with the OS errno when one is known.
    #[error("I/O error: {message}")]
    Io { message: String, os_code: Option<i32> },

    /// Peer closed the connection, or no connection is open.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// A response, byte or indication deadline expired.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed envelope: bad MBAP header, length mismatch, oversized frame.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// RTU checksum failure.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Confirmation does not match its request (function, transaction id).
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Confirmation payload has the wrong length or echo fields.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Unsupported function code.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Address range outside the configured data mapping.
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// The remote device answered with a standard exception.
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Exception reply carrying a code outside the standard range.
    #[error("Invalid exception code 0x{code:02X} for function {function:02X}")]
    BadException { function: u8, code: u8 },

    /// Exception reply carrying the reserved "not defined" code.
    #[error("Unknown exception code 0x{code:02X} for function {function:02X}")]
    UnknownException { function: u8, code: u8 },

    /// Requested count exceeds the protocol ceiling.
    #[error("Too many data: requested {requested}, maximum {max}")]
    TooMuchData { requested: usize, max: usize },

    /// Confirmation came from another unit than the one addressed.
    #[error("Response not from requested slave: expected {expected}, got {actual}")]
    BadSlave { expected: u8, actual: u8 },

    /// Caller passed an argument the engine cannot act on.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into(), os_code: None }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), timeout_ms }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Build the error matching an exception reply.
    ///
    /// Codes 1..=11 other than 9 become [`ModbusError::Exception`]; the reserved
    /// code 9 becomes `UnknownException` and anything else `BadException`.
    pub fn exception(function: u8, code: u8) -> Self {
        match code {
            0x09 => Self::UnknownException { function, code },
            0x01..=0x0B => Self::Exception {
                function,
                code,
                message: strerror(MODBUS_ENOBASE + code as i32),
            },
            _ => Self::BadException { function, code },
        }
    }

    pub fn too_much_data(requested: usize, max: usize) -> Self {
        Self::TooMuchData { requested, max }
    }

    pub fn bad_slave(expected: u8, actual: u8) -> Self {
        Self::BadSlave { expected, actual }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Taxonomy bucket for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io { .. } | Self::Connection { .. } | Self::Internal { .. } => {
                ErrorCategory::Transport
            }
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Frame { .. } | Self::CrcMismatch { .. } => ErrorCategory::Framing,
            Self::Protocol { .. }
            | Self::InvalidData { .. }
            | Self::InvalidFunction { .. }
            | Self::Exception { .. }
            | Self::BadException { .. }
            | Self::UnknownException { .. }
            | Self::BadSlave { .. } => ErrorCategory::Protocol,
            Self::InvalidAddress { .. } => ErrorCategory::Addressing,
            Self::TooMuchData { .. } | Self::InvalidArgument { .. } => ErrorCategory::Validation,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }

    /// Numeric code: an OS errno or a value above [`MODBUS_ENOBASE`].
    pub fn code(&self) -> i32 {
        match self {
            Self::Io { os_code, .. } => os_code.unwrap_or(EIO),
            Self::Connection { .. } => ECONNRESET,
            Self::Timeout { .. } => ETIMEDOUT,
            Self::Frame { .. } | Self::Protocol { .. } | Self::InvalidData { .. } => EMBBADDATA,
            Self::CrcMismatch { .. } => EMBBADCRC,
            Self::InvalidFunction { .. } => EMBXILFUN,
            Self::InvalidAddress { .. } => EMBXILADD,
            Self::Exception { code, .. } => MODBUS_ENOBASE + *code as i32,
            Self::BadException { .. } => EMBBADEXC,
            Self::UnknownException { .. } => EMBUNKEXC,
            Self::TooMuchData { .. } => EMBMDATA,
            Self::BadSlave { .. } => EMBBADSLAVE,
            Self::InvalidArgument { .. } | Self::Configuration { .. } => EINVAL,
            Self::Internal { .. } => EIO,
        }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// ```rust
    /// use modbus_engine::ModbusError;
    ///
    /// assert!(ModbusError::timeout("read registers", 500).is_recoverable());
    /// assert!(!ModbusError::too_much_data(2001, 2000).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } => true,
            // Acknowledge, busy
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Timeout
        )
    }

    /// Check if the error is a framing or protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Framing | ErrorCategory::Protocol
        )
    }
}

/// Human-readable message for a numeric error code.
pub fn strerror(code: i32) -> String {
    let message = match code {
        EMBXILFUN => "Illegal function",
        EMBXILADD => "Illegal data address",
        EMBXILVAL => "Illegal data value",
        EMBXSFAIL => "Slave device or server failure",
        EMBXACK => "Acknowledge",
        EMBXSBUSY => "Slave device or server is busy",
        EMBXNACK => "Negative acknowledge",
        EMBXMEMPAR => "Memory parity error",
        EMBXGPATH => "Gateway path unavailable",
        EMBXGTAR => "Target device failed to respond",
        EMBBADCRC => "Invalid CRC",
        EMBBADDATA => "Invalid data",
        EMBBADEXC => "Invalid exception code",
        EMBUNKEXC => "Unknown exception code",
        EMBMDATA => "Too many data",
        EMBBADSLAVE => "Response not from requested slave",
        c if (0..MODBUS_ENOBASE).contains(&c) => {
            return io::Error::from_raw_os_error(c).to_string();
        }
        _ => "Unknown error",
    };
    message.to_string()
}

impl From<io::Error> for ModbusError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::timeout(err.to_string(), 0)
            }
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Self::connection(err.to_string()),
            _ => Self::Io { message: err.to_string(), os_code: err.raw_os_error() },
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("serial port: {}", err))
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

//! Frame tracing for debug mode.
//!
//! With the debug flag set, a Context reports every ADU it sends or
//! receives. Lines go to the installed [`CallbackLogger`]; without a
//! callback they become `tracing` events.

use std::fmt;
use std::sync::Arc;

use crate::protocol::FunctionCode;
use crate::transport::BackendKind;
use crate::utils::format::bytes_to_hex;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// How frames are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Spaced hex bytes
    Raw,
    /// Function name and decoded fields
    Interpreted,
    /// Interpreted line followed by a compact hex line
    Both,
}

/// Direction of a traced frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Tx => "TX",
            Direction::Rx => "RX",
        })
    }
}

/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("callback", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Raw)
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self { callback: callback.map(Arc::new), min_level, mode }
    }

    /// Timestamped lines on stdout/stderr
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// No callback: frames are traced through `tracing`
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if let Some(callback) = &self.callback {
            if level <= self.min_level {
                callback(level, message);
            }
        }
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Report one ADU. `header_length` locates the function code.
    pub fn log_frame(&self, direction: Direction, backend: BackendKind, header_length: usize, frame: &[u8]) {
        let unit = header_length
            .checked_sub(1)
            .and_then(|i| frame.get(i))
            .copied()
            .unwrap_or(0);
        let prefix = format!("[MODBUS-{}] {} slave:{}", backend, direction, unit);
        let lines = match self.mode {
            LoggingMode::Raw => vec![format!("{} {}", prefix, bytes_to_hex(frame))],
            LoggingMode::Interpreted => vec![format!("{} {}", prefix, interpret(&frame[header_length.min(frame.len())..]))],
            LoggingMode::Both => vec![
                format!("{} {}", prefix, interpret(&frame[header_length.min(frame.len())..])),
                format!("{} raw={}", prefix, hex::encode_upper(frame)),
            ],
        };

        for line in lines {
            if self.callback.is_some() {
                self.info(&line);
            } else {
                tracing::info!("{}", line);
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// One-line description of a PDU, request or response.
fn interpret(pdu: &[u8]) -> String {
    let Some(&code) = pdu.first() else {
        return "empty".to_string();
    };
    if code & 0x80 != 0 {
        let exception = pdu.get(1).copied().unwrap_or(0);
        return format!("exception 0x{:02X} for function 0x{:02X}", exception, code & 0x7F);
    }
    let name = FunctionCode::from_u8(code)
        .map(|f| f.name())
        .unwrap_or("Unknown Function");
    let word = |i: usize| pdu.get(i..i + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));
    match (word(1), word(3)) {
        (Some(a), Some(b)) if pdu.len() >= 5 => {
            format!("{} (0x{:02X}) {}/{} data={}", name, code, a, b, hex::encode_upper(&pdu[5..]))
        }
        _ => format!("{} (0x{:02X}) data={}", name, code, hex::encode_upper(&pdu[1..])),
    }
}

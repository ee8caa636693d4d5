//! # Modbus Engine - Modbus RTU/TCP Master and Slave
//!
//! One [`ModbusContext`] per link drives either side of a Modbus exchange
//! over a serial line (RTU), TCP/IPv4, or protocol-independent TCP
//! (IPv4/IPv6 with name resolution).
//!
//! ## Features
//!
//! - **Master**: every standard function through [`ModbusClient`], with
//!   protocol ceilings checked before I/O and confirmations checked against
//!   their request (transaction id, unit, function, length, echo)
//! - **Slave**: a [`ReplyEngine`] answering requests from a typed
//!   [`ModbusMapping`], with exact exception semantics and RTU broadcast
//!   handling, plus ready-made TCP and RTU servers
//! - **Timeouts**: response, inter-byte and indication timeouts
//! - **Error recovery**: optional link reconnection and protocol flushing
//! - **RS-485**: RTS flow control in hardware or through a callback
//! - **Debug tracing**: every frame dumped through a pluggable logger
//!
//! ## Supported Function Codes
//!
//! | Code | Function                  | Master | Slave |
//! |------|---------------------------|--------|-------|
//! | 0x01 | Read Coils                | ✅     | ✅    |
//! | 0x02 | Read Discrete Inputs      | ✅     | ✅    |
//! | 0x03 | Read Holding Registers    | ✅     | ✅    |
//! | 0x04 | Read Input Registers      | ✅     | ✅    |
//! | 0x05 | Write Single Coil         | ✅     | ✅    |
//! | 0x06 | Write Single Register     | ✅     | ✅    |
//! | 0x07 | Read Exception Status     | ✅     | exception |
//! | 0x0F | Write Multiple Coils      | ✅     | ✅    |
//! | 0x10 | Write Multiple Registers  | ✅     | ✅    |
//! | 0x11 | Report Slave ID           | ✅     | ✅    |
//! | 0x16 | Mask Write Register       | ✅     | ✅    |
//! | 0x17 | Write/Read Registers      | ✅     | ✅    |
//!
//! ## Quick Start
//!
//! ### Master
//!
//! ```rust,no_run
//! use modbus_engine::{ModbusClient, ModbusContext, ModbusResult};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut ctx = ModbusContext::new_tcp(Some("127.0.0.1"), 502)?;
//!     ctx.connect().await?;
//!
//!     let values = ctx.read_registers(0, 10).await?;
//!     println!("Read registers: {:?}", values);
//!     ctx.write_register(100, 0x1234).await?;
//!
//!     ctx.close().await
//! }
//! ```
//!
//! ### Slave
//!
//! ```rust,no_run
//! use modbus_engine::{ModbusContext, ModbusMapping, ModbusResult};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut mapping = ModbusMapping::new(100, 100, 100, 100)?;
//!     let mut ctx = ModbusContext::new_tcp(Some("127.0.0.1"), 1502)?;
//!     let listener = ctx.listen(1).await?;
//!     ctx.accept(&listener).await?;
//!
//!     loop {
//!         let request = ctx.receive().await?;
//!         ctx.reply(&request, &mut mapping).await?;
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │  ModbusClient   │    │  Reply Engine   │◄── ModbusMapping
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌───────────────────────────────────────────┐
//! │  ModbusContext (settings, receive steps,  │
//! │  confirmation checks, error recovery)     │
//! └───────────────────────────────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   ADU codec     │    │   Transport     │
//! │ (RTU / MBAP)    │    │ RTU / TCP / PI  │
//! └─────────────────┘    └─────────────────┘
//! ```

/// Error type, numeric error codes and `strerror`
pub mod error;

/// Function codes, exception codes, request PDUs and data helpers
pub mod protocol;

/// RTU and TCP envelopes, CRC and frame length discovery
pub mod codec;

/// Byte channels: serial line, TCP and protocol-independent TCP
pub mod transport;

/// RTS flow control for RS-485 adapters
pub mod rts;

/// Slave-side process image
pub mod mapping;

/// Per-link settings and the request/response engine
pub mod context;

/// Slave-side request validation and dispatch
pub mod reply;

/// Master-side operations
pub mod client;

/// TCP and RTU slave servers
pub mod server;

/// Configuration files
pub mod config;

/// Validation, formatting and metrics helpers
pub mod utils;

/// Debug frame tracing
pub mod logging;

// Re-export main types for convenience
pub use client::ModbusClient;
pub use codec::{AduCodec, Framing};
pub use config::EngineConfig;
pub use context::{ContextSettings, ErrorRecoveryMode, ModbusContext, Quirks};
pub use error::{strerror, ErrorCategory, ModbusError, ModbusResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use mapping::ModbusMapping;
pub use protocol::{ExceptionCode, FunctionCode, ReportSlaveId, Request};
pub use reply::{Reply, ReplyEngine, ReplyState};
pub use rts::{RtsMode, SerialMode};
pub use server::{ModbusRtuServer, ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
pub use transport::{BackendKind, ModbusTransport, RtuTransport, TcpTransport, TransportStats};
pub use utils::{ExchangeMetrics, ExchangeTimer};

pub use protocol::{
    BROADCAST_ADDRESS, DEFAULT_TCP_PORT, MAX_ADU_LENGTH, MAX_PDU_LENGTH, MAX_READ_BITS,
    MAX_READ_REGISTERS, MAX_RTU_ADU_LENGTH, MAX_TCP_ADU_LENGTH, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS, MAX_WR_READ_REGISTERS, MAX_WR_WRITE_REGISTERS, TCP_SLAVE,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const VERSION_MAJOR: u32 = version_part(env!("CARGO_PKG_VERSION_MAJOR"));
pub const VERSION_MINOR: u32 = version_part(env!("CARGO_PKG_VERSION_MINOR"));
pub const VERSION_MICRO: u32 = version_part(env!("CARGO_PKG_VERSION_PATCH"));

/// Version encoded as `0xMMmmuu`, e.g. 1.2.3 is `0x010203`
pub const VERSION_HEX: u32 = (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_MICRO;

const fn version_part(digits: &str) -> u32 {
    let bytes = digits.as_bytes();
    let mut value = 0;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

/// True when this library is at least version `major.minor.micro`.
///
/// ```rust
/// assert!(modbus_engine::version_check(0, 1, 0));
/// assert!(!modbus_engine::version_check(u32::MAX, 0, 0));
/// ```
pub fn version_check(major: u32, minor: u32, micro: u32) -> bool {
    (VERSION_MAJOR, VERSION_MINOR, VERSION_MICRO) >= (major, minor, micro)
}

/// Get library information
pub fn info() -> String {
    format!("modbus_engine v{} - Modbus RTU/TCP master and slave engine", VERSION)
}

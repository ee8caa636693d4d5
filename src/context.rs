//! # Modbus Context
//!
//! A [`ModbusContext`] is one end of one Modbus link: a transport, the ADU
//! codec for that transport, and the settings that govern every exchange
//! (unit id, timeouts, debug tracing, error recovery and quirks).
//!
//! ## Timeouts
//!
//! | Setting              | Default | Governs                                        |
//! |----------------------|---------|------------------------------------------------|
//! | `response_timeout`   | 500 ms  | first byte of a confirmation, connect          |
//! | `byte_timeout`       | 500 ms  | gap between bytes; zero hands the whole frame  |
//! |                      |         | to the response timeout                        |
//! | `indication_timeout` | 0       | first byte of a request; zero waits forever    |
//!
//! ## Error recovery
//!
//! `LINK` reconnects on broken connections (sends retry until they succeed,
//! receives reconnect once and still fail). `PROTOCOL` sleeps for the
//! response timeout and flushes pending input after a malformed or
//! mismatched frame. Both are off by default.
//!
//! A context is used by one task at a time; every operation takes `&mut self`.

use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::codec::{AduCodec, Framing, MessageType};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{CallbackLogger, Direction};
use crate::mapping::ModbusMapping;
use crate::protocol::{
    ExceptionCode, Request, BROADCAST_ADDRESS, MAX_PDU_LENGTH, MAX_SLAVE_ID,
    TCP_SLAVE,
};
use crate::reply::{Reply, ReplyEngine};
use crate::rts::{RtsCallback, RtsMode, SerialMode};
use crate::transport::{
    BackendKind, ModbusListener, ModbusTransport, RtuTransport, TcpTransport, TransportStats,
};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_BYTE_TIMEOUT: Duration = Duration::from_millis(500);

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(u8);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self($bit);)*

            pub const fn bits(self) -> u8 {
                self.0
            }

            pub const fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut names = Vec::new();
                $(if self.contains(Self::$flag) && Self::$flag.0 != 0 { names.push(stringify!($flag)); })*
                if names.is_empty() {
                    names.push("NONE");
                }
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}

flag_set! {
    /// Local recovery applied when an exchange fails.
    ErrorRecoveryMode {
        /// Reconnect after connection failures
        LINK = 1 << 1,
        /// Sleep and flush after malformed or mismatched frames
        PROTOCOL = 1 << 2,
    }
}

flag_set! {
    /// Opt-in deviations from strict protocol conformance.
    Quirks {
        /// Accept unit ids 248 to 255
        MAX_SLAVE = 1 << 1,
        /// Answer broadcast requests on an RTU slave
        REPLY_TO_BROADCAST = 1 << 2,
    }
}

impl Quirks {
    pub const ALL: Self = Self(Self::MAX_SLAVE.0 | Self::REPLY_TO_BROADCAST.0);

    /// Highest unit id accepted with these quirks
    pub fn max_slave(self) -> u8 {
        if self.contains(Self::MAX_SLAVE) {
            u8::MAX
        } else {
            MAX_SLAVE_ID
        }
    }
}

/// Settings carried by a Context, independent of its transport.
///
/// Servers copy these into every per-client Context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSettings {
    pub slave: Option<u8>,
    pub response_timeout: Duration,
    pub byte_timeout: Duration,
    pub indication_timeout: Duration,
    pub debug: bool,
    pub error_recovery: ErrorRecoveryMode,
    pub quirks: Quirks,
    /// Vendor bytes appended to report slave id replies
    pub report_slave_id_trailer: Vec<u8>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            slave: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            byte_timeout: DEFAULT_BYTE_TIMEOUT,
            indication_timeout: Duration::ZERO,
            debug: false,
            error_recovery: ErrorRecoveryMode::NONE,
            quirks: Quirks::NONE,
            report_slave_id_trailer: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
                .into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Function,
    Meta,
    Data,
}

/// One Modbus link, master or slave side.
pub struct ModbusContext {
    transport: Box<dyn ModbusTransport>,
    codec: AduCodec,
    settings: ContextSettings,
    logger: CallbackLogger,
}

impl fmt::Debug for ModbusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusContext")
            .field("backend", &self.backend_kind())
            .field("connected", &self.transport.is_connected())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ModbusContext {
    /// RTU context on a serial device. The port opens on `connect`.
    pub fn new_rtu(device: &str, baud: u32, parity: char, data_bits: u8, stop_bits: u8) -> ModbusResult<Self> {
        let transport = RtuTransport::new(device, baud, parity, data_bits, stop_bits)?;
        Ok(Self::from_transport(Box::new(transport)))
    }

    /// IPv4 TCP context. `ip` of `None` listens on every interface.
    pub fn new_tcp(ip: Option<&str>, port: u16) -> ModbusResult<Self> {
        Ok(Self::from_transport(Box::new(TcpTransport::new(ip, port)?)))
    }

    /// Protocol-independent TCP context (IPv4 or IPv6, host names resolved).
    pub fn new_tcp_pi(node: Option<&str>, service: Option<&str>) -> ModbusResult<Self> {
        Ok(Self::from_transport(Box::new(TcpTransport::new_pi(node, service)?)))
    }

    /// Wrap any transport. TCP contexts start with the `TCP_SLAVE` unit id.
    pub fn from_transport(transport: Box<dyn ModbusTransport>) -> Self {
        let mut settings = ContextSettings::default();
        if transport.kind().framing() == Framing::Tcp {
            settings.slave = Some(TCP_SLAVE);
        }
        Self::with_settings(transport, settings)
    }

    pub fn with_settings(mut transport: Box<dyn ModbusTransport>, settings: ContextSettings) -> Self {
        transport.set_connect_timeout(settings.response_timeout);
        let codec = AduCodec::new(transport.kind().framing());
        Self { transport, codec, settings, logger: CallbackLogger::disabled() }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.transport.kind()
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Bytes before the function code: 1 for RTU, 7 for TCP.
    pub fn header_length(&self) -> usize {
        self.codec.header_length()
    }

    // ----- slave id -----

    /// Set the unit id used by requests and accepted by the reply engine.
    ///
    /// 0..=247 always, up to 255 with [`Quirks::MAX_SLAVE`], and 255 on TCP.
    pub fn set_slave(&mut self, slave: u8) -> ModbusResult<()> {
        let tcp_slave = self.codec.framing() == Framing::Tcp && slave == TCP_SLAVE;
        if slave > self.settings.quirks.max_slave() && !tcp_slave {
            return Err(ModbusError::invalid_argument(format!("invalid slave id {}", slave)));
        }
        self.settings.slave = Some(slave);
        Ok(())
    }

    pub fn slave(&self) -> Option<u8> {
        self.settings.slave
    }

    // ----- timeouts -----

    pub fn set_response_timeout(&mut self, duration: Duration) -> ModbusResult<()> {
        if duration.is_zero() {
            return Err(ModbusError::invalid_argument("response timeout must be non-zero"));
        }
        self.settings.response_timeout = duration;
        self.transport.set_connect_timeout(duration);
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        self.settings.response_timeout
    }

    /// Zero disables the inter-byte timeout.
    pub fn set_byte_timeout(&mut self, duration: Duration) {
        self.settings.byte_timeout = duration;
    }

    pub fn byte_timeout(&self) -> Duration {
        self.settings.byte_timeout
    }

    /// Zero waits for requests forever.
    pub fn set_indication_timeout(&mut self, duration: Duration) {
        self.settings.indication_timeout = duration;
    }

    pub fn indication_timeout(&self) -> Duration {
        self.settings.indication_timeout
    }

    // ----- debug, recovery, quirks -----

    pub fn set_debug(&mut self, debug: bool) {
        self.settings.debug = debug;
    }

    pub fn debug(&self) -> bool {
        self.settings.debug
    }

    /// Where debug frame dumps go
    pub fn set_logger(&mut self, logger: CallbackLogger) {
        self.logger = logger;
    }

    pub fn set_error_recovery(&mut self, mode: ErrorRecoveryMode) {
        self.settings.error_recovery = mode;
    }

    pub fn error_recovery(&self) -> ErrorRecoveryMode {
        self.settings.error_recovery
    }

    pub fn enable_quirks(&mut self, quirks: Quirks) {
        self.settings.quirks.insert(quirks);
    }

    pub fn disable_quirks(&mut self, quirks: Quirks) {
        self.settings.quirks.remove(quirks);
    }

    pub fn quirks(&self) -> Quirks {
        self.settings.quirks
    }

    /// Vendor bytes answered to report slave id
    pub fn set_report_slave_id_trailer(&mut self, trailer: Vec<u8>) {
        self.settings.report_slave_id_trailer = trailer;
    }

    // ----- connection lifecycle -----

    pub async fn connect(&mut self) -> ModbusResult<()> {
        self.transport.connect().await
    }

    pub async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Discard unread input.
    pub async fn flush(&mut self) -> ModbusResult<usize> {
        self.transport.flush().await
    }

    /// Bind and listen (TCP and TCP-PI only).
    pub async fn listen(&mut self, max_pending: u32) -> ModbusResult<ModbusListener> {
        self.transport.listen(max_pending).await
    }

    /// Accept one client; this context then talks to it.
    pub async fn accept(&mut self, listener: &ModbusListener) -> ModbusResult<SocketAddr> {
        self.transport.accept(listener).await
    }

    // ----- RTU serial settings -----

    fn rtu(&self) -> ModbusResult<&RtuTransport> {
        self.transport
            .as_rtu()
            .ok_or_else(|| ModbusError::invalid_argument("not an RTU context"))
    }

    fn rtu_mut(&mut self) -> ModbusResult<&mut RtuTransport> {
        self.transport
            .as_rtu_mut()
            .ok_or_else(|| ModbusError::invalid_argument("not an RTU context"))
    }

    pub fn rtu_set_serial_mode(&mut self, mode: SerialMode) -> ModbusResult<()> {
        self.rtu_mut()?.set_serial_mode(mode);
        Ok(())
    }

    pub fn rtu_serial_mode(&self) -> ModbusResult<SerialMode> {
        Ok(self.rtu()?.serial_mode())
    }

    pub fn rtu_set_rts(&mut self, mode: RtsMode) -> ModbusResult<()> {
        self.rtu_mut()?.set_rts(mode)
    }

    pub fn rtu_rts(&self) -> ModbusResult<RtsMode> {
        Ok(self.rtu()?.rts())
    }

    /// Called with the wanted RTS level instead of driving the port.
    pub fn rtu_set_custom_rts(&mut self, callback: RtsCallback) -> ModbusResult<()> {
        self.rtu_mut()?.set_custom_rts(callback);
        Ok(())
    }

    pub fn rtu_set_rts_delay(&mut self, delay: Duration) -> ModbusResult<()> {
        self.rtu_mut()?.set_rts_delay(delay);
        Ok(())
    }

    pub fn rtu_rts_delay(&self) -> ModbusResult<Duration> {
        Ok(self.rtu()?.rts_delay())
    }

    // ----- raw frames -----

    /// Send `raw` (unit id, function code, payload) in the active envelope.
    pub async fn send_raw_request(&mut self, raw: &[u8]) -> ModbusResult<usize> {
        if raw.len() < 2 {
            return Err(ModbusError::invalid_argument("raw request needs a unit id and a function code"));
        }
        if raw.len() - 1 > MAX_PDU_LENGTH {
            return Err(ModbusError::too_much_data(raw.len() - 1, MAX_PDU_LENGTH));
        }
        let adu = self.codec.encode_request(raw[0], &raw[1..])?;
        self.send_msg(&adu).await
    }

    /// Read one complete confirmation ADU without interpreting it.
    pub async fn receive_confirmation(&mut self) -> ModbusResult<Vec<u8>> {
        self.receive_msg(MessageType::Confirmation).await
    }

    /// Wait for one request ADU, bounded by the indication timeout.
    pub async fn receive(&mut self) -> ModbusResult<Vec<u8>> {
        self.receive_msg(MessageType::Indication).await
    }

    // ----- slave side -----

    /// Reply engine configured from this context's settings.
    pub fn reply_engine(&self) -> ReplyEngine {
        ReplyEngine::new(self.codec.framing(), self.settings.slave, self.settings.quirks)
            .with_report_trailer(self.settings.report_slave_id_trailer.clone())
    }

    /// Validate `request` and apply it to `mapping`. Touches no I/O.
    pub fn prepare_reply(&self, request: &[u8], mapping: &mut ModbusMapping) -> ModbusResult<Reply> {
        let adu = self.codec.decode(request)?;
        Ok(self.reply_engine().process(&adu, mapping))
    }

    /// Send the response built by [`prepare_reply`](Self::prepare_reply).
    pub async fn send_reply(&mut self, request: &[u8], reply: &Reply) -> ModbusResult<usize> {
        match reply.pdu() {
            Some(pdu) => {
                let adu = self.codec.encode_response(request, &pdu)?;
                self.send_msg(&adu).await
            }
            None => Ok(0),
        }
    }

    /// Answer `request` from `mapping`: normal response, exception or nothing.
    pub async fn reply(&mut self, request: &[u8], mapping: &mut ModbusMapping) -> ModbusResult<Reply> {
        let reply = self.prepare_reply(request, mapping)?;
        self.send_reply(request, &reply).await?;
        Ok(reply)
    }

    /// Answer `request` with exception `code`, whatever it asked for.
    pub async fn reply_exception(&mut self, request: &[u8], code: ExceptionCode) -> ModbusResult<usize> {
        let adu = self.codec.decode(request)?;
        let pdu = [adu.function_code() | 0x80, code.to_u8()];
        let response = self.codec.encode_response(request, &pdu)?;
        self.send_msg(&response).await
    }

    // ----- master side -----

    /// Send `request` and return the checked confirmation PDU.
    ///
    /// `None` for RTU broadcasts, which are never answered.
    pub(crate) async fn execute(&mut self, request: &Request) -> ModbusResult<Option<Vec<u8>>> {
        let unit = self
            .settings
            .slave
            .ok_or_else(|| ModbusError::invalid_argument("slave id not set"))?;
        let broadcast = self.codec.framing() == Framing::Rtu && unit == BROADCAST_ADDRESS;
        if broadcast && !request.function_code().is_write_function() {
            return Err(ModbusError::invalid_argument(format!(
                "{} cannot be broadcast",
                request.function_code()
            )));
        }

        let adu = self.codec.encode_request(unit, &request.encode())?;
        self.send_msg(&adu).await?;
        if broadcast {
            return Ok(None);
        }

        let response = self.receive_msg(MessageType::Confirmation).await?;
        self.check_confirmation(unit, request, &response).await.map(Some)
    }

    async fn check_confirmation(&mut self, unit: u8, request: &Request, response: &[u8]) -> ModbusResult<Vec<u8>> {
        let adu = self.codec.decode(response)?;

        if let Some(transaction_id) = adu.transaction_id {
            if transaction_id != self.codec.transaction_id() {
                self.recover_protocol().await;
                return Err(ModbusError::protocol(format!(
                    "invalid transaction id: expected {}, got {}",
                    self.codec.transaction_id(),
                    transaction_id
                )));
            }
        } else if adu.unit_id != unit {
            return Err(ModbusError::bad_slave(unit, adu.unit_id));
        }

        let function = request.function_code();
        let pdu = adu.pdu;
        let received = pdu[0];
        if received & 0x80 != 0 {
            if pdu.len() == 2 && received == function.exception_code() {
                return Err(ModbusError::exception(function.to_u8(), pdu[1]));
            }
            return Err(ModbusError::BadException {
                function: function.to_u8(),
                code: pdu.get(1).copied().unwrap_or(0),
            });
        }
        if received != function.to_u8() {
            self.recover_protocol().await;
            return Err(ModbusError::protocol(format!(
                "unexpected function 0x{:02X} in answer to {}",
                received, function
            )));
        }

        if let Some(expected) = expected_response_length(request) {
            if pdu.len() != expected {
                self.recover_protocol().await;
                return Err(ModbusError::invalid_data(format!(
                    "{} answered with {} bytes, expected {}",
                    function,
                    pdu.len(),
                    expected
                )));
            }
        }
        check_echo(request, pdu)?;
        Ok(pdu.to_vec())
    }

    // ----- wire -----

    async fn send_msg(&mut self, adu: &[u8]) -> ModbusResult<usize> {
        if self.settings.debug {
            self.logger
                .log_frame(Direction::Tx, self.backend_kind(), self.header_length(), adu);
        }

        loop {
            let error = match self.transport.send(adu).await {
                Ok(sent) => return Ok(sent),
                Err(e) => e,
            };
            if !self.settings.error_recovery.contains(ErrorRecoveryMode::LINK) {
                return Err(error);
            }
            warn!("send failed ({}), recovering link", error);
            if matches!(error, ModbusError::Connection { .. }) {
                let _ = self.transport.close().await;
                sleep(self.settings.response_timeout).await;
                if let Err(e) = self.transport.connect().await {
                    debug!("reconnect failed: {}", e);
                }
            } else {
                sleep(self.settings.response_timeout).await;
                let _ = self.transport.flush().await;
            }
        }
    }

    /// Read exactly one ADU, discovering its length as bytes arrive.
    async fn receive_msg(&mut self, msg_type: MessageType) -> ModbusResult<Vec<u8>> {
        let header = self.codec.header_length();
        let max = self.codec.max_adu_length();
        let mut msg = vec![0u8; max];
        let mut length = 0;
        let mut to_read = header + 1;
        let mut step = Step::Function;
        // set once the full length is known
        let mut sized = false;

        let first_wait = match msg_type {
            MessageType::Confirmation => Some(self.settings.response_timeout),
            MessageType::Indication if self.settings.indication_timeout.is_zero() => None,
            MessageType::Indication => Some(self.settings.indication_timeout),
        };
        let deadline = first_wait.map(|wait| Instant::now() + wait);
        let mut wait = first_wait;
        let mut operation = match msg_type {
            MessageType::Confirmation => "waiting for confirmation",
            MessageType::Indication => "waiting for indication",
        };

        while to_read > 0 {
            let received = match wait {
                Some(limit) => timeout(limit, self.transport.recv(&mut msg[length..length + to_read]))
                    .await
                    .unwrap_or_else(|_| Err(ModbusError::timeout(operation, limit.as_millis() as u64))),
                None => self.transport.recv(&mut msg[length..length + to_read]).await,
            };
            let n = match received {
                Ok(0) => Err(ModbusError::connection("connection closed by peer")),
                other => other,
            };
            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    self.recover_receive(&e).await;
                    return Err(e);
                }
            };
            length += n;
            to_read -= n;

            if to_read == 0 && step == Step::Function {
                match self.codec.mbap_length(&msg[..length]) {
                    // unit id and function code are already in
                    Some(declared) if declared >= 2 => {
                        to_read = declared - 2;
                        step = Step::Data;
                    }
                    Some(declared) => {
                        self.recover_protocol().await;
                        return Err(ModbusError::frame(format!("MBAP length {} is too short", declared)));
                    }
                    None => {
                        to_read = self.codec.meta_length_after_function(msg[header], msg_type);
                        step = Step::Meta;
                    }
                }
                sized = step == Step::Data;
            }
            if to_read == 0 && step == Step::Meta {
                to_read = self.codec.data_length_after_meta(&msg[..length], msg_type);
                step = Step::Data;
                sized = true;
            }
            if sized {
                sized = false;
                if length + to_read > max {
                    self.recover_protocol().await;
                    return Err(ModbusError::frame(format!(
                        "declared frame of {} bytes exceeds {}",
                        length + to_read,
                        max
                    )));
                }
            }

            if to_read > 0 {
                operation = "waiting for next byte";
                wait = if !self.settings.byte_timeout.is_zero() {
                    Some(self.settings.byte_timeout)
                } else {
                    deadline.map(|d| d.saturating_duration_since(Instant::now()))
                };
            }
        }
        msg.truncate(length);

        if self.settings.debug {
            self.logger.log_frame(Direction::Rx, self.backend_kind(), header, &msg);
        }

        if let Err(e) = self.codec.decode(&msg) {
            self.recover_protocol().await;
            return Err(e);
        }
        Ok(msg)
    }

    async fn recover_receive(&mut self, error: &ModbusError) {
        if !self.settings.error_recovery.contains(ErrorRecoveryMode::LINK) {
            return;
        }
        match error {
            ModbusError::Timeout { .. } => {
                sleep(self.settings.response_timeout).await;
                let _ = self.transport.flush().await;
            }
            ModbusError::Connection { .. } | ModbusError::Io { .. } => {
                warn!("receive failed ({}), reconnecting once", error);
                let _ = self.transport.close().await;
                if let Err(e) = self.transport.connect().await {
                    debug!("reconnect failed: {}", e);
                }
            }
            _ => {}
        }
    }

    async fn recover_protocol(&mut self) {
        if self.settings.error_recovery.contains(ErrorRecoveryMode::PROTOCOL) {
            debug!("protocol error, flushing after {:?}", self.settings.response_timeout);
            sleep(self.settings.response_timeout).await;
            let _ = self.transport.flush().await;
        }
    }
}


/// PDU length of a normal answer to `request`, when fixed.
fn expected_response_length(request: &Request) -> Option<usize> {
    let length = match request {
        Request::ReadCoils { quantity, .. } | Request::ReadDiscreteInputs { quantity, .. } => {
            2 + (*quantity as usize + 7) / 8
        }
        Request::ReadHoldingRegisters { quantity, .. } | Request::ReadInputRegisters { quantity, .. } => {
            2 + 2 * *quantity as usize
        }
        Request::WriteAndReadRegisters { read_quantity, .. } => 2 + 2 * *read_quantity as usize,
        Request::ReadExceptionStatus => 2,
        Request::MaskWriteRegister { .. } => 7,
        Request::WriteSingleCoil { .. }
        | Request::WriteSingleRegister { .. }
        | Request::WriteMultipleCoils { .. }
        | Request::WriteMultipleRegisters { .. } => 5,
        Request::ReportSlaveId => return None,
    };
    Some(length)
}

/// Echoed fields and byte counts must match the request.
fn check_echo(request: &Request, pdu: &[u8]) -> ModbusResult<()> {
    let sent = request.encode();
    let consistent = match request {
        Request::ReadCoils { .. }
        | Request::ReadDiscreteInputs { .. }
        | Request::ReadHoldingRegisters { .. }
        | Request::ReadInputRegisters { .. }
        | Request::WriteAndReadRegisters { .. }
        | Request::ReportSlaveId => pdu.get(1).map_or(false, |&count| count as usize == pdu.len() - 2),
        Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => pdu[..5] == sent[..5],
        Request::MaskWriteRegister { .. } => pdu[..7] == sent[..7],
        Request::WriteMultipleCoils { .. } | Request::WriteMultipleRegisters { .. } => pdu[..5] == sent[..5],
        Request::ReadExceptionStatus => true,
    };
    if consistent {
        Ok(())
    } else {
        Err(ModbusError::invalid_data(format!(
            "{} answer does not match the request",
            request.function_code()
        )))
    }
}

//! # Modbus Transport Layer
//!
//! Raw byte channels underneath a Context. A transport knows nothing about
//! Modbus framing: it connects, listens, accepts, moves bytes and discards
//! pending input. Framing and checksums live in [`crate::codec`].
//!
//! ## Backends
//!
//! | Backend | Type           | Addressing                         |
//! |---------|----------------|------------------------------------|
//! | RTU     | `RtuTransport` | serial device, baud, parity, bits  |
//! | TCP     | `TcpTransport` | IPv4 address and port              |
//! | TCP-PI  | `TcpTransport` | host name or IPv4/IPv6, service    |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use modbus_engine::transport::{ModbusTransport, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = TcpTransport::new(Some("127.0.0.1"), 502)?;
//!     transport.connect().await?;
//!     transport.send(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0xFF, 0x07]).await?;
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialStream, StopBits};
use tracing::debug;

use crate::codec::Framing;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::DEFAULT_TCP_PORT;
use crate::rts::{RtsCallback, RtsController, RtsMode, SerialMode};

/// Default connect timeout, matching the default response timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Fixed inter-frame gap above 19200 baud
const HIGH_BAUD_FRAME_GAP: Duration = Duration::from_micros(1750);

/// Backend selected when a Context is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Rtu,
    Tcp,
    TcpPi,
}

impl BackendKind {
    pub fn framing(self) -> Framing {
        match self {
            BackendKind::Rtu => Framing::Rtu,
            BackendKind::Tcp | BackendKind::TcpPi => Framing::Tcp,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Rtu => "RTU",
            BackendKind::Tcp => "TCP",
            BackendKind::TcpPi => "TCP-PI",
        };
        f.write_str(name)
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_flushed: u64,
    pub errors: u64,
}

/// A bound, listening socket returned by [`ModbusTransport::listen`].
#[derive(Debug)]
pub struct ModbusListener {
    inner: TcpListener,
}

impl ModbusListener {
    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

/// Byte channel used by a Context.
///
/// Implementations own their connection handle. `accept` installs the
/// accepted connection as the transport's own, so one transport serves one
/// peer at a time.
#[async_trait]
pub trait ModbusTransport: Send {
    fn kind(&self) -> BackendKind;

    /// Open the connection (socket connect or serial open).
    async fn connect(&mut self) -> ModbusResult<()>;

    /// Drop the connection. Closing a closed transport is not an error.
    async fn close(&mut self) -> ModbusResult<()>;

    fn is_connected(&self) -> bool;

    /// Bind and listen with a backlog of `max_pending` connections.
    async fn listen(&mut self, max_pending: u32) -> ModbusResult<ModbusListener>;

    /// Wait for one peer on `listener` and adopt its connection.
    async fn accept(&mut self, listener: &ModbusListener) -> ModbusResult<SocketAddr>;

    /// Write a whole frame, returning the number of bytes written.
    async fn send(&mut self, frame: &[u8]) -> ModbusResult<usize>;

    /// Read whatever is available, up to `buf.len()`. Zero means the peer closed.
    async fn recv(&mut self, buf: &mut [u8]) -> ModbusResult<usize>;

    /// Discard unread input, returning how many bytes were dropped when known.
    async fn flush(&mut self) -> ModbusResult<usize>;

    /// Timeout applied to `connect`
    fn set_connect_timeout(&mut self, _timeout: Duration) {}

    fn stats(&self) -> TransportStats;

    fn as_rtu(&self) -> Option<&RtuTransport> {
        None
    }

    fn as_rtu_mut(&mut self) -> Option<&mut RtuTransport> {
        None
    }
}

#[derive(Debug, Clone)]
enum TcpTarget {
    Ipv4 { ip: Option<Ipv4Addr>, port: u16 },
    Resolved { node: Option<String>, port: u16 },
}

/// TCP and protocol-independent TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    target: TcpTarget,
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    stats: TransportStats,
}

impl TcpTransport {
    /// IPv4 transport. `None` connects to localhost and listens on any address.
    pub fn new(ip: Option<&str>, port: u16) -> ModbusResult<Self> {
        let ip = ip
            .map(|ip| {
                ip.parse::<Ipv4Addr>()
                    .map_err(|_| ModbusError::invalid_argument(format!("invalid IPv4 address '{}'", ip)))
            })
            .transpose()?;
        Ok(Self::with_target(TcpTarget::Ipv4 { ip, port }))
    }

    /// Protocol-independent transport resolving `node` at connect/listen time.
    ///
    /// `service` must be a numeric port; `None` selects 502.
    pub fn new_pi(node: Option<&str>, service: Option<&str>) -> ModbusResult<Self> {
        let port = match service {
            None => DEFAULT_TCP_PORT,
            Some(service) => service
                .parse::<u16>()
                .map_err(|_| ModbusError::invalid_argument(format!("invalid service '{}'", service)))?,
        };
        let node = node.map(str::to_string);
        Ok(Self::with_target(TcpTarget::Resolved { node, port }))
    }

    fn with_target(target: TcpTarget) -> Self {
        Self {
            target,
            stream: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stats: TransportStats::default(),
        }
    }

    async fn addresses(&self, passive: bool) -> ModbusResult<Vec<SocketAddr>> {
        match &self.target {
            TcpTarget::Ipv4 { ip, port } => {
                let fallback = if passive { Ipv4Addr::UNSPECIFIED } else { Ipv4Addr::LOCALHOST };
                Ok(vec![SocketAddr::new(IpAddr::V4(ip.unwrap_or(fallback)), *port)])
            }
            TcpTarget::Resolved { node: Some(node), port } => {
                let addrs: Vec<SocketAddr> = lookup_host((node.as_str(), *port))
                    .await
                    .map_err(|e| ModbusError::connection(format!("cannot resolve '{}': {}", node, e)))?
                    .collect();
                if addrs.is_empty() {
                    return Err(ModbusError::connection(format!("'{}' resolved to no address", node)));
                }
                Ok(addrs)
            }
            TcpTarget::Resolved { node: None, port } if passive => Ok(vec![
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), *port),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), *port),
            ]),
            TcpTarget::Resolved { node: None, port } => Ok(vec![
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), *port),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), *port),
            ]),
        }
    }

    fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)
    }

    fn stream_mut(&mut self) -> ModbusResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP socket not connected"))
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    fn kind(&self) -> BackendKind {
        match self.target {
            TcpTarget::Ipv4 { .. } => BackendKind::Tcp,
            TcpTarget::Resolved { .. } => BackendKind::TcpPi,
        }
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        let mut last_error = ModbusError::connection("no address to connect to");
        for addr in self.addresses(false).await? {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    debug!("connected to {}", addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    last_error = ModbusError::connection(format!("Failed to connect to {}: {}", addr, e));
                }
                Err(_) => {
                    last_error = ModbusError::timeout(
                        format!("connect to {}", addr),
                        self.connect_timeout.as_millis() as u64,
                    );
                }
            }
        }
        self.stats.errors += 1;
        Err(last_error)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn listen(&mut self, max_pending: u32) -> ModbusResult<ModbusListener> {
        let mut last_error = ModbusError::connection("no address to listen on");
        for addr in self.addresses(true).await? {
            match Self::bind(addr, max_pending) {
                Ok(inner) => {
                    debug!("listening on {}", addr);
                    return Ok(ModbusListener { inner });
                }
                Err(e) => {
                    last_error = ModbusError::Io {
                        message: format!("cannot listen on {}: {}", addr, e),
                        os_code: e.raw_os_error(),
                    };
                }
            }
        }
        Err(last_error)
    }

    async fn accept(&mut self, listener: &ModbusListener) -> ModbusResult<SocketAddr> {
        let (stream, peer) = listener.inner.accept().await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(peer)
    }

    async fn send(&mut self, frame: &[u8]) -> ModbusResult<usize> {
        let stream = self.stream_mut()?;
        if let Err(e) = stream.write_all(frame).await {
            self.stats.errors += 1;
            return Err(e.into());
        }
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        Ok(frame.len())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        let n = self.stream_mut()?.read(buf).await?;
        self.stats.bytes_received += n as u64;
        Ok(n)
    }

    async fn flush(&mut self) -> ModbusResult<usize> {
        let stream = self.stream_mut()?;
        let mut scratch = [0u8; 260];
        let mut discarded = 0;
        // Only what is already buffered; never wait for more.
        loop {
            match timeout(Duration::ZERO, stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        self.stats.bytes_flushed += discarded as u64;
        Ok(discarded)
    }

    fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Serial port as seen by the RTU transport.
///
/// Implemented for [`SerialStream`]; tests plug in in-memory pipes.
pub trait SerialLine: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drive the RTS output.
    fn set_rts(&mut self, level: bool) -> io::Result<()>;

    /// Drop bytes received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl SerialLine for SerialStream {
    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.write_request_to_send(level).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Modbus RTU transport implementation
pub struct RtuTransport {
    device: String,
    baud: u32,
    parity: char,
    data_bits: u8,
    stop_bits: u8,
    line: Option<Box<dyn SerialLine>>,
    serial_mode: SerialMode,
    rts: RtsController,
    /// Time to transmit one character, start and stop bits included
    onebyte_time: Duration,
    /// Silent interval kept before each frame
    frame_gap: Duration,
    stats: TransportStats,
}

impl fmt::Debug for RtuTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtuTransport")
            .field("device", &self.device)
            .field("baud", &self.baud)
            .field("parity", &self.parity)
            .field("data_bits", &self.data_bits)
            .field("stop_bits", &self.stop_bits)
            .field("connected", &self.line.is_some())
            .field("serial_mode", &self.serial_mode)
            .field("rts", &self.rts)
            .finish()
    }
}

impl RtuTransport {
    /// Describe a serial port; nothing is opened until `connect`.
    ///
    /// `parity` is `'N'`, `'E'` or `'O'`, `data_bits` 5 to 8, `stop_bits` 1 or 2.
    pub fn new(device: &str, baud: u32, parity: char, data_bits: u8, stop_bits: u8) -> ModbusResult<Self> {
        if device.is_empty() {
            return Err(ModbusError::invalid_argument("empty serial device name"));
        }
        if baud == 0 {
            return Err(ModbusError::invalid_argument("baud rate must be positive"));
        }
        if !matches!(parity, 'N' | 'E' | 'O') {
            return Err(ModbusError::invalid_argument(format!("invalid parity '{}'", parity)));
        }
        if !(5..=8).contains(&data_bits) {
            return Err(ModbusError::invalid_argument(format!("invalid data bits {}", data_bits)));
        }
        if !matches!(stop_bits, 1 | 2) {
            return Err(ModbusError::invalid_argument(format!("invalid stop bits {}", stop_bits)));
        }

        let bits_per_char = 1 + data_bits as u64 + u64::from(parity != 'N') + stop_bits as u64;
        let onebyte_time = Duration::from_micros(1_000_000 * bits_per_char / baud as u64);
        let frame_gap = if baud > 19_200 {
            HIGH_BAUD_FRAME_GAP
        } else {
            onebyte_time * 7 / 2
        };

        Ok(Self {
            device: device.to_string(),
            baud,
            parity,
            data_bits,
            stop_bits,
            line: None,
            serial_mode: SerialMode::Rs232,
            rts: RtsController::new(onebyte_time),
            onebyte_time,
            frame_gap,
            stats: TransportStats::default(),
        })
    }

    /// Use an already open line instead of opening the device.
    pub fn attach_line(&mut self, line: Box<dyn SerialLine>) {
        self.line = Some(line);
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn onebyte_time(&self) -> Duration {
        self.onebyte_time
    }

    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    pub fn serial_mode(&self) -> SerialMode {
        self.serial_mode
    }

    pub fn set_serial_mode(&mut self, mode: SerialMode) {
        self.serial_mode = mode;
    }

    pub fn rts(&self) -> RtsMode {
        self.rts.mode()
    }

    pub fn set_rts(&mut self, mode: RtsMode) -> ModbusResult<()> {
        let line = self.line.as_deref_mut().map(|l| l as &mut dyn SerialLine);
        self.rts.set_mode(mode, line)
    }

    /// Install a handler called instead of toggling the hardware line.
    pub fn set_custom_rts(&mut self, callback: RtsCallback) {
        self.rts.set_callback(callback);
    }

    pub fn rts_delay(&self) -> Duration {
        self.rts.delay()
    }

    pub fn set_rts_delay(&mut self, delay: Duration) {
        self.rts.set_delay(delay);
    }

    fn line_mut(&mut self) -> ModbusResult<&mut Box<dyn SerialLine>> {
        self.line
            .as_mut()
            .ok_or_else(|| ModbusError::connection(format!("serial port {} not open", self.device)))
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Rtu
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        if self.line.is_some() {
            return Ok(());
        }
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match self.parity {
            'E' => Parity::Even,
            'O' => Parity::Odd,
            _ => Parity::None,
        };
        let stop_bits = if self.stop_bits == 2 { StopBits::Two } else { StopBits::One };
        let builder = tokio_serial::new(&self.device, self.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits);
        let port = SerialStream::open(&builder).map_err(|e| {
            self.stats.errors += 1;
            ModbusError::connection(format!("Failed to open serial port {}: {}", self.device, e))
        })?;
        debug!("opened {} at {} baud", self.device, self.baud);
        self.line = Some(Box::new(port));
        if self.rts.mode() != RtsMode::None {
            self.set_rts(self.rts.mode())?;
        }
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut line) = self.line.take() {
            let _ = line.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.line.is_some()
    }

    async fn listen(&mut self, _max_pending: u32) -> ModbusResult<ModbusListener> {
        Err(ModbusError::invalid_argument("listen is not available on an RTU backend"))
    }

    async fn accept(&mut self, _listener: &ModbusListener) -> ModbusResult<SocketAddr> {
        Err(ModbusError::invalid_argument("accept is not available on an RTU backend"))
    }

    async fn send(&mut self, frame: &[u8]) -> ModbusResult<usize> {
        sleep(self.frame_gap).await;
        let onebyte_time = self.onebyte_time;
        let line = self
            .line
            .as_deref_mut()
            .ok_or_else(|| ModbusError::connection("serial port not open"))?;

        self.rts.begin_frame(&mut *line).await?;
        let written = match line.write_all(frame).await {
            Ok(()) => line.flush().await,
            Err(e) => Err(e),
        };
        self.rts.end_frame(&mut *line, frame.len(), onebyte_time).await?;

        if let Err(e) = written {
            self.stats.errors += 1;
            return Err(e.into());
        }
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        Ok(frame.len())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        let n = self.line_mut()?.read(buf).await?;
        self.stats.bytes_received += n as u64;
        Ok(n)
    }

    async fn flush(&mut self) -> ModbusResult<usize> {
        self.line_mut()?.clear_input()?;
        Ok(0)
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn as_rtu(&self) -> Option<&RtuTransport> {
        Some(self)
    }

    fn as_rtu_mut(&mut self) -> Option<&mut RtuTransport> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtu_parameter_validation() {
        assert!(RtuTransport::new("/dev/ttyUSB0", 9600, 'N', 8, 1).is_ok());
        assert!(RtuTransport::new("", 9600, 'N', 8, 1).is_err());
        assert!(RtuTransport::new("/dev/ttyUSB0", 0, 'N', 8, 1).is_err());
        assert!(RtuTransport::new("/dev/ttyUSB0", 9600, 'X', 8, 1).is_err());
        assert!(RtuTransport::new("/dev/ttyUSB0", 9600, 'N', 9, 1).is_err());
        assert!(RtuTransport::new("/dev/ttyUSB0", 9600, 'N', 8, 3).is_err());
    }

    #[test]
    fn test_rtu_character_timing() {
        // 1 start + 8 data + 1 stop = 10 bits at 9600 baud
        let rtu = RtuTransport::new("/dev/ttyUSB0", 9600, 'N', 8, 1).unwrap();
        assert_eq!(rtu.onebyte_time(), Duration::from_micros(1041));
        assert_eq!(rtu.frame_gap(), Duration::from_micros(1041) * 7 / 2);
        assert_eq!(rtu.rts_delay(), rtu.onebyte_time());

        // parity adds a bit
        let rtu = RtuTransport::new("/dev/ttyUSB0", 19200, 'E', 8, 1).unwrap();
        assert_eq!(rtu.onebyte_time(), Duration::from_micros(572));

        let rtu = RtuTransport::new("/dev/ttyUSB0", 115200, 'N', 8, 1).unwrap();
        assert_eq!(rtu.frame_gap(), HIGH_BAUD_FRAME_GAP);
    }

    #[test]
    fn test_rtu_mode_settings() {
        let mut rtu = RtuTransport::new("/dev/ttyUSB0", 9600, 'N', 8, 1).unwrap();
        assert_eq!(rtu.serial_mode(), SerialMode::Rs232);
        rtu.set_serial_mode(SerialMode::Rs485);
        assert_eq!(rtu.serial_mode(), SerialMode::Rs485);
        rtu.set_rts(RtsMode::Down).unwrap();
        assert_eq!(rtu.rts(), RtsMode::Down);
        rtu.set_rts_delay(Duration::from_micros(250));
        assert_eq!(rtu.rts_delay(), Duration::from_micros(250));
        assert!(!rtu.is_connected());
    }

    #[test]
    fn test_tcp_address_validation() {
        assert!(TcpTransport::new(Some("127.0.0.1"), 502).is_ok());
        assert!(TcpTransport::new(None, 1502).is_ok());
        assert!(TcpTransport::new(Some("not-an-ip"), 502).is_err());
        assert!(TcpTransport::new_pi(Some("::1"), Some("1502")).is_ok());
        assert!(TcpTransport::new_pi(None, Some("modbus")).is_err());
        assert_eq!(TcpTransport::new_pi(None, None).unwrap().kind(), BackendKind::TcpPi);
    }

    #[tokio::test]
    async fn test_tcp_listen_accept_exchange() {
        let mut server = TcpTransport::new(Some("127.0.0.1"), 0).unwrap();
        let listener = server.listen(1).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = TcpTransport::new(Some("127.0.0.1"), port).unwrap();
        let (accepted, connected) = tokio::join!(server.accept(&listener), client.connect());
        accepted.unwrap();
        connected.unwrap();

        assert_eq!(client.send(&[1, 2, 3]).await.unwrap(), 3);
        let mut buf = [0u8; 8];
        let mut read = 0;
        while read < 3 {
            read += server.recv(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(client.stats().bytes_sent, 3);

        client.close().await.unwrap();
        assert_eq!(server.recv(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rtu_listen_is_rejected() {
        let mut rtu = RtuTransport::new("/dev/ttyUSB0", 9600, 'N', 8, 1).unwrap();
        assert!(rtu.listen(1).await.is_err());
        assert!(rtu.send(&[0x01]).await.is_err());
    }
}

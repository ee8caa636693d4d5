/// Modbus slave servers
///
/// Both servers run the same loop over a [`ModbusContext`]: wait for an
/// indication, let the reply engine answer it from a shared
/// [`ModbusMapping`], send the reply (or stay silent). The TCP server runs
/// one such loop per accepted client; the RTU server runs one on its line.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::context::{ContextSettings, ModbusContext};
use crate::error::{ModbusError, ModbusResult};
use crate::mapping::ModbusMapping;
use crate::protocol::DEFAULT_TCP_PORT;
use crate::reply::Reply;
use crate::transport::{BackendKind, TcpTransport};

/// Process image shared by every connection of a server.
pub type SharedMapping = Arc<RwLock<ModbusMapping>>;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send {
    /// Start serving in background tasks
    async fn start(&mut self) -> ModbusResult<()>;

    async fn stop(&mut self) -> ModbusResult<()>;

    fn is_running(&self) -> bool;

    fn stats(&self) -> ServerStats;

    /// The mapping requests are answered from
    fn mapping(&self) -> SharedMapping;
}

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    /// Answered with a normal response
    pub successful_requests: u64,
    /// Answered with an exception
    pub exception_responses: u64,
    /// Broadcasts and requests for other units
    pub silent_requests: u64,
    /// Malformed frames and send failures
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

type SharedStats = Arc<Mutex<ServerStats>>;

fn update_stats(stats: &SharedStats, update: impl FnOnce(&mut ServerStats)) {
    if let Ok(mut stats) = stats.lock() {
        update(&mut stats);
    }
}

/// Outcome of one request handled by [`serve_one`].
enum Served {
    Replied,
    /// Frame was unusable; keep listening
    Rejected,
    /// Indication timeout expired
    Idle,
    /// Link is gone
    Closed,
}

/// Receive, answer and account for one indication.
async fn serve_one(ctx: &mut ModbusContext, mapping: &SharedMapping, stats: &SharedStats) -> Served {
    let request = match ctx.receive().await {
        Ok(request) => request,
        Err(e @ ModbusError::Connection { .. }) | Err(e @ ModbusError::Io { .. }) => {
            debug!("link closed: {}", e);
            return Served::Closed;
        }
        Err(e @ ModbusError::Timeout { .. }) => {
            debug!("no request within the indication timeout: {}", e);
            return Served::Idle;
        }
        Err(e) => {
            warn!("discarding request: {}", e);
            update_stats(stats, |s| s.failed_requests += 1);
            return Served::Rejected;
        }
    };
    update_stats(stats, |s| {
        s.total_requests += 1;
        s.bytes_received += request.len() as u64;
    });

    let prepared = match mapping.write() {
        Ok(mut guard) => ctx.prepare_reply(&request, &mut guard),
        Err(_) => Err(ModbusError::internal("mapping lock poisoned")),
    };
    let reply = match prepared {
        Ok(reply) => reply,
        Err(e) => {
            error!("cannot answer request: {}", e);
            update_stats(stats, |s| s.failed_requests += 1);
            return Served::Rejected;
        }
    };

    match ctx.send_reply(&request, &reply).await {
        Ok(sent) => {
            update_stats(stats, |s| {
                s.bytes_sent += sent as u64;
                match reply {
                    Reply::Normal(_) => s.successful_requests += 1,
                    Reply::Exception { .. } => s.exception_responses += 1,
                    Reply::Silent(_) => s.silent_requests += 1,
                }
            });
            Served::Replied
        }
        Err(e) => {
            error!("failed to send reply: {}", e);
            update_stats(stats, |s| s.failed_requests += 1);
            Served::Closed
        }
    }
}

/// Modbus TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    /// Interface to bind; `None` binds every interface
    pub host: Option<String>,
    pub port: u16,
    /// Resolve `host` as IPv4 or IPv6 instead of IPv4 only
    pub protocol_independent: bool,
    pub max_pending: u32,
    pub max_connections: usize,
    /// Copied into every client context
    pub settings: ContextSettings,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        let settings = ContextSettings { slave: Some(crate::protocol::TCP_SLAVE), ..Default::default() };
        Self {
            host: Some("127.0.0.1".to_string()),
            port: DEFAULT_TCP_PORT,
            protocol_independent: false,
            max_pending: 5,
            max_connections: 100,
            settings,
        }
    }
}

impl ModbusTcpServerConfig {
    fn transport(&self) -> ModbusResult<TcpTransport> {
        if self.protocol_independent {
            TcpTransport::new_pi(self.host.as_deref(), Some(&self.port.to_string()))
        } else {
            TcpTransport::new(self.host.as_deref(), self.port)
        }
    }

    fn context(&self) -> ModbusResult<ModbusContext> {
        Ok(ModbusContext::with_settings(Box::new(self.transport()?), self.settings.clone()))
    }
}

/// Modbus TCP server: one task per client, all sharing one mapping.
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    mapping: SharedMapping,
    stats: SharedStats,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    start_time: Option<Instant>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    /// Server on `host:port` answering from `mapping`.
    pub fn new(host: &str, port: u16, mapping: ModbusMapping) -> ModbusResult<Self> {
        let config = ModbusTcpServerConfig {
            host: Some(host.to_string()),
            port,
            ..Default::default()
        };
        Self::with_config(config, Arc::new(RwLock::new(mapping)))
    }

    pub fn with_config(config: ModbusTcpServerConfig, mapping: SharedMapping) -> ModbusResult<Self> {
        if config.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be at least 1"));
        }
        Ok(Self {
            config,
            mapping,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            start_time: None,
            local_addr: None,
        })
    }

    /// Bound address once started; reports the real port when 0 was asked.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn handle_client(
        mut ctx: ModbusContext,
        peer: SocketAddr,
        mapping: SharedMapping,
        stats: SharedStats,
        active: Arc<AtomicUsize>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("client connected: {}", peer);
        update_stats(&stats, |s| s.connections_count += 1);

        loop {
            let served = tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("shutdown signal received for client {}", peer);
                    break;
                }
                served = serve_one(&mut ctx, &mapping, &stats) => served,
            };
            // idle TCP clients are dropped
            if let Served::Closed | Served::Idle = served {
                break;
            }
        }

        let _ = ctx.close().await;
        active.fetch_sub(1, Ordering::SeqCst);
        info!("client disconnected: {}", peer);
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::configuration("server is already running"));
        }

        let mut listening = self.config.context()?;
        let listener = listening.listen(self.config.max_pending).await?;
        let local_addr = listener.local_addr()?;
        info!("Modbus TCP server listening on {}", local_addr);

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.start_time = Some(Instant::now());
        self.local_addr = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let mapping = self.mapping.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let active = Arc::new(AtomicUsize::new(0));
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let mut ctx = match config.context() {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        error!("cannot create client context: {}", e);
                        break;
                    }
                };
                tokio::select! {
                    result = ctx.accept(&listener) => match result {
                        Ok(peer) => {
                            if active.load(Ordering::SeqCst) >= config.max_connections {
                                warn!("refusing {}: {} clients connected", peer, config.max_connections);
                                let _ = ctx.close().await;
                                continue;
                            }
                            active.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(Self::handle_client(
                                ctx,
                                peer,
                                mapping.clone(),
                                stats.clone(),
                                active.clone(),
                                shutdown_tx.subscribe(),
                            ));
                        }
                        Err(e) => error!("failed to accept connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("shutdown signal received, stopping server");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Modbus TCP server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }

    fn mapping(&self) -> SharedMapping {
        self.mapping.clone()
    }
}

/// Modbus RTU server: a single slave on a serial line.
pub struct ModbusRtuServer {
    context: Option<ModbusContext>,
    mapping: SharedMapping,
    stats: SharedStats,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    start_time: Option<Instant>,
}

impl ModbusRtuServer {
    /// Serve `mapping` on `device` as unit `slave`.
    pub fn new(
        device: &str,
        baud: u32,
        parity: char,
        data_bits: u8,
        stop_bits: u8,
        slave: u8,
        mapping: ModbusMapping,
    ) -> ModbusResult<Self> {
        let mut ctx = ModbusContext::new_rtu(device, baud, parity, data_bits, stop_bits)?;
        ctx.set_slave(slave)?;
        Self::with_context(ctx, Arc::new(RwLock::new(mapping)))
    }

    /// Serve from an RTU context that already carries its slave id.
    pub fn with_context(context: ModbusContext, mapping: SharedMapping) -> ModbusResult<Self> {
        if context.backend_kind() != BackendKind::Rtu {
            return Err(ModbusError::configuration("RTU server needs an RTU context"));
        }
        if context.slave().is_none() {
            return Err(ModbusError::configuration("RTU server needs a slave id"));
        }
        Ok(Self {
            context: Some(context),
            mapping,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            start_time: None,
        })
    }
}

#[async_trait]
impl ModbusServer for ModbusRtuServer {
    async fn start(&mut self) -> ModbusResult<()> {
        let mut ctx = self
            .context
            .take()
            .ok_or_else(|| ModbusError::configuration("RTU server can only be started once"))?;
        ctx.connect().await?;
        info!("Modbus RTU server started as unit {:?}", ctx.slave());

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.start_time = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);
        update_stats(&self.stats, |s| s.connections_count += 1);

        let mapping = self.mapping.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            loop {
                let served = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    served = serve_one(&mut ctx, &mapping, &stats) => served,
                };
                // a quiet serial line only means nobody asked
                if let Served::Closed = served {
                    break;
                }
            }
            let _ = ctx.close().await;
            running.store(false, Ordering::SeqCst);
            info!("Modbus RTU server stopped");
        });
        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }

    fn mapping(&self) -> SharedMapping {
        self.mapping.clone()
    }
}

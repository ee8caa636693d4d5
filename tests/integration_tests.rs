//! Integration Tests for the Modbus engine
//!
//! TCP exchanges run a real server on `127.0.0.1` with an ephemeral port.
//! RTU exchanges run two Contexts over an in-memory pipe standing in for
//! the serial line.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_test::{assert_err, assert_ok};

use modbus_engine::codec::AduCodec;
use modbus_engine::error::EMBXILADD;
use modbus_engine::reply::SilentReason;
use modbus_engine::transport::SerialLine;
use modbus_engine::utils::logging::init_test_logger;
use modbus_engine::*;

// ---------------------------------------------------------------------------
// TCP helpers
// ---------------------------------------------------------------------------

async fn start_server(mapping: ModbusMapping) -> (ModbusTcpServer, u16) {
    init_test_logger();
    let mut server = ModbusTcpServer::new("127.0.0.1", 0, mapping).unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

async fn connect_master(port: u16) -> ModbusContext {
    let mut ctx = ModbusContext::new_tcp(Some("127.0.0.1"), port).unwrap();
    ctx.connect().await.unwrap();
    ctx
}

/// A TCP peer that answers the first request with `respond(request)`.
async fn fake_slave<F>(respond: F) -> u16
where
    F: FnOnce(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 260];
        let n = stream.read(&mut request).await.unwrap();
        match respond(&request[..n]) {
            Some(response) => {
                stream.write_all(&response).await.unwrap();
                // keep the socket open while the master reads
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            None => drop(stream),
        }
    });
    port
}

/// A TCP peer that reads one request and hands the socket to `script`.
async fn scripted_slave<F, Fut>(script: F) -> u16
where
    F: FnOnce(TcpStream, Vec<u8>) -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 260];
        let n = stream.read(&mut request).await.unwrap();
        let _ = script(stream, request[..n].to_vec()).await;
    });
    port
}

/// Answer a one-register read with 0x002A, stalling 300 ms after 4 bytes.
async fn split_answer(mut stream: TcpStream, request: Vec<u8>) -> io::Result<()> {
    let response = [request[0], request[1], 0x00, 0x00, 0x00, 0x05, 0xFF, 0x03, 0x02, 0x00, 0x2A];
    stream.write_all(&response[..4]).await?;
    sleep(Duration::from_millis(300)).await;
    stream.write_all(&response[4..]).await?;
    sleep(Duration::from_millis(300)).await;
    Ok(())
}

#[tokio::test]
async fn test_tcp_coil_and_register_round_trip() {
    let (mut server, port) = start_server(ModbusMapping::new(16, 16, 32, 8).unwrap()).await;
    server.mapping().write().unwrap().set_input_register(2, 0xBEEF).unwrap();
    server.mapping().write().unwrap().set_discrete_input(1, true).unwrap();
    let mut ctx = connect_master(port).await;

    assert_ok!(ctx.write_bit(3, true).await);
    assert_eq!(ctx.read_bits(0, 5).await.unwrap(), vec![false, false, false, true, false]);

    assert_ok!(ctx.write_bits(8, &[true, false, true, true, false, false, true, true, true]).await);
    assert_eq!(
        ctx.read_bits(8, 9).await.unwrap(),
        vec![true, false, true, true, false, false, true, true, true]
    );

    assert_ok!(ctx.write_register(0, 0x1234).await);
    assert_ok!(ctx.write_registers(10, &[1, 2, 3]).await);
    assert_eq!(ctx.read_registers(9, 4).await.unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(ctx.read_registers(0, 1).await.unwrap(), vec![0x1234]);

    assert_eq!(ctx.read_input_registers(2, 1).await.unwrap(), vec![0xBEEF]);
    assert_eq!(ctx.read_input_bits(0, 2).await.unwrap(), vec![false, true]);

    assert!(server.mapping().read().unwrap().get_coil(3).unwrap());
    assert_eq!(server.mapping().read().unwrap().get_holding_register(12).unwrap(), 3);

    ctx.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_write_and_read_overlap() {
    let mut mapping = ModbusMapping::new(0, 0, 4, 0).unwrap();
    mapping.holding_registers_mut().write(0, &[10, 11, 12, 13]).unwrap();
    let (mut server, port) = start_server(mapping).await;
    let mut ctx = connect_master(port).await;

    let read = ctx.write_and_read_registers(1, &[0xAA, 0xBB], 0, 4).await.unwrap();
    assert_eq!(read, vec![10, 0xAA, 0xBB, 13]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_mask_write_register() {
    let mut mapping = ModbusMapping::new(0, 0, 1, 0).unwrap();
    mapping.set_holding_register(0, 0b1010).unwrap();
    let (mut server, port) = start_server(mapping).await;
    let mut ctx = connect_master(port).await;

    assert_ok!(ctx.mask_write_register(0, 0b1100, 0b0011).await);
    assert_eq!(ctx.read_registers(0, 1).await.unwrap(), vec![0b1011]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_ceiling_rejected_before_io() {
    let (mut server, port) = start_server(ModbusMapping::new(2000, 0, 0, 0).unwrap()).await;
    let mut ctx = connect_master(port).await;

    let err = ctx.read_bits(0, 2001).await.unwrap_err();
    assert!(matches!(err, ModbusError::TooMuchData { requested: 2001, max: 2000 }));
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(ctx.transport_stats().bytes_sent, 0);

    assert_eq!(ctx.read_bits(0, 2000).await.unwrap().len(), 2000);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_exception_replies() {
    let (mut server, port) = start_server(ModbusMapping::new(0, 0, 100, 0).unwrap()).await;
    let mut ctx = connect_master(port).await;

    let err = ctx.read_registers(200, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Exception { function: 0x03, code: 0x02, .. }));
    assert_eq!(err.code(), EMBXILADD);
    assert_eq!(strerror(err.code()), "Illegal data address");

    let err = ctx.read_exception_status().await.unwrap_err();
    assert!(matches!(err, ModbusError::Exception { function: 0x07, code: 0x01, .. }));

    // the link stays usable after exceptions
    assert_ok!(ctx.write_register(99, 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = server.stats();
    assert_eq!(stats.exception_responses, 2);
    assert_eq!(stats.successful_requests, 1);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_report_slave_id() {
    let (mut server, port) = start_server(ModbusMapping::new(0, 0, 0, 0).unwrap()).await;
    let mut ctx = connect_master(port).await;

    let report = ctx.report_slave_id().await.unwrap();
    assert_eq!(report.slave_id, TCP_SLAVE);
    assert!(report.run_indicator);
    let trailer = String::from_utf8(report.additional_data).unwrap();
    assert_eq!(trailer, format!("modbus_engine {}", VERSION));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_raw_request() {
    let mut mapping = ModbusMapping::new(0, 0, 2, 0).unwrap();
    mapping.set_holding_register(1, 0x0102).unwrap();
    let (mut server, port) = start_server(mapping).await;
    let mut ctx = connect_master(port).await;

    assert_eq!(ctx.send_raw_request(&[0xFF, 0x03, 0x00, 0x01, 0x00, 0x01]).await.unwrap(), 12);
    let response = ctx.receive_confirmation().await.unwrap();
    assert_eq!(response.len(), 11);
    assert_eq!(&response[6..], &[0xFF, 0x03, 0x02, 0x01, 0x02]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_transaction_id_mismatch_flushes_input() {
    let port = fake_slave(|request| {
        let mut response = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x05, request[6], 0x03, 0x02, 0x00, 0x07];
        // answer with the wrong transaction id, followed by stray bytes
        response[0] = request[0] ^ 0xFF;
        response[1] = request[1];
        response.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00]);
        Some(response)
    })
    .await;
    let mut ctx = connect_master(port).await;
    ctx.set_error_recovery(ErrorRecoveryMode::PROTOCOL);
    ctx.set_response_timeout(Duration::from_millis(50)).unwrap();

    let started = Instant::now();
    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Protocol { .. }));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(ctx.transport_stats().bytes_flushed, 5);
}

#[tokio::test]
async fn test_tcp_mismatch_without_recovery_keeps_input() {
    let port = fake_slave(|request| {
        let mut response = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x05, request[6], 0x03, 0x02, 0x00, 0x07];
        response[0] = request[0] ^ 0xFF;
        response.extend_from_slice(&[0xDE, 0xAD]);
        Some(response)
    })
    .await;
    let mut ctx = connect_master(port).await;

    assert!(matches!(ctx.read_registers(0, 1).await, Err(ModbusError::Protocol { .. })));
    assert_eq!(ctx.transport_stats().bytes_flushed, 0);
}

#[tokio::test]
async fn test_tcp_wrong_length_is_invalid_data() {
    let port = fake_slave(|request| {
        // two registers where one was asked for
        let mut response = request[..7].to_vec();
        response[5] = 7;
        response.extend_from_slice(&[0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
        Some(response)
    })
    .await;
    let mut ctx = connect_master(port).await;

    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::InvalidData { .. }));
}

#[tokio::test]
async fn test_tcp_unsupported_function_answered_on_the_wire() {
    let mut mapping = ModbusMapping::new(0, 0, 1, 0).unwrap();
    mapping.set_holding_register(0, 0x2A).unwrap();
    let (mut server, port) = start_server(mapping).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // read device identification (0x2B / 0x0E) is not served
    stream
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0xFF, 0x2B, 0x0E, 0x01, 0x00])
        .await
        .unwrap();
    let mut exception = [0u8; 9];
    timeout(Duration::from_secs(1), stream.read_exact(&mut exception)).await.unwrap().unwrap();
    assert_eq!(exception, [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0xFF, 0xAB, 0x01]);

    // the connection is still in step
    stream
        .write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await
        .unwrap();
    let mut response = [0u8; 11];
    timeout(Duration::from_secs(1), stream.read_exact(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, [0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0xFF, 0x03, 0x02, 0x00, 0x2A]);

    sleep(Duration::from_millis(50)).await;
    let stats = server.stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.exception_responses, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.failed_requests, 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_master_unsupported_function_exception() {
    let (mut server, port) = start_server(ModbusMapping::new(0, 0, 1, 0).unwrap()).await;
    let mut ctx = connect_master(port).await;

    // diagnostics, return query data
    ctx.send_raw_request(&[0xFF, 0x08, 0x00, 0x00, 0x12, 0x34]).await.unwrap();
    let confirmation = ctx.receive_confirmation().await.unwrap();
    assert_eq!(&confirmation[6..], &[0xFF, 0x88, 0x01]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_byte_timeout_bounds_each_gap() {
    let port = scripted_slave(split_answer).await;
    let mut ctx = connect_master(port).await;
    ctx.set_response_timeout(Duration::from_secs(1)).unwrap();
    ctx.set_byte_timeout(Duration::from_millis(30));

    let started = Instant::now();
    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(250));
    match err {
        ModbusError::Timeout { operation, timeout_ms } => {
            assert_eq!(operation, "waiting for next byte");
            assert_eq!(timeout_ms, 30);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_zero_byte_timeout_uses_response_deadline() {
    let port = scripted_slave(split_answer).await;
    let mut ctx = connect_master(port).await;
    ctx.set_response_timeout(Duration::from_secs(1)).unwrap();
    ctx.set_byte_timeout(Duration::ZERO);

    let started = Instant::now();
    assert_eq!(ctx.read_registers(0, 1).await.unwrap(), vec![0x2A]);
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn test_zero_byte_timeout_expires_with_response_deadline() {
    let port = scripted_slave(split_answer).await;
    let mut ctx = connect_master(port).await;
    ctx.set_response_timeout(Duration::from_millis(150)).unwrap();
    ctx.set_byte_timeout(Duration::ZERO);

    let started = Instant::now();
    let err = ctx.read_registers(0, 1).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, ModbusError::Timeout { .. }));
    assert!(elapsed >= Duration::from_millis(100), "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(290), "gave up after {:?}", elapsed);
}

#[tokio::test]
async fn test_indication_timeout() {
    let mut ctx = ModbusContext::new_tcp(Some("127.0.0.1"), 0).unwrap();
    let listener = ctx.listen(1).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = tokio::spawn(async move {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sleep(Duration::from_millis(600)).await;
        drop(stream);
    });
    ctx.accept(&listener).await.unwrap();

    // zero waits forever
    assert!(timeout(Duration::from_millis(100), ctx.receive()).await.is_err());

    ctx.set_indication_timeout(Duration::from_millis(50));
    let started = Instant::now();
    let err = ctx.receive().await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { ref operation, .. } if operation == "waiting for indication"));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_millis(400));
    client.await.unwrap();
}

#[tokio::test]
async fn test_tcp_server_drops_idle_clients() {
    let config = ModbusTcpServerConfig {
        host: Some("127.0.0.1".to_string()),
        port: 0,
        settings: ContextSettings {
            slave: Some(TCP_SLAVE),
            indication_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    };
    let mapping = Arc::new(RwLock::new(ModbusMapping::new(0, 0, 1, 0).unwrap()));
    let mut server = ModbusTcpServer::with_config(config, mapping).unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(1), stream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_link_recovery_connects_before_sending() {
    let (mut server, port) = start_server(ModbusMapping::new(0, 0, 1, 0).unwrap()).await;

    let mut plain = ModbusContext::new_tcp(Some("127.0.0.1"), port).unwrap();
    assert!(matches!(plain.write_register(0, 7).await, Err(ModbusError::Connection { .. })));

    // never connected: the send fails, the link is rebuilt and the send retried
    let mut ctx = ModbusContext::new_tcp(Some("127.0.0.1"), port).unwrap();
    ctx.set_error_recovery(ErrorRecoveryMode::LINK);
    ctx.set_response_timeout(Duration::from_millis(50)).unwrap();
    let started = Instant::now();
    assert_ok!(ctx.write_register(0, 7).await);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(ctx.is_connected());
    assert_eq!(server.mapping().read().unwrap().get_holding_register(0).unwrap(), 7);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_link_recovery_reconnects_once_on_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = [0u8; 260];
                let _ = stream.read(&mut request).await;
                // the first peer hangs up without answering
                if index > 0 {
                    sleep(Duration::from_millis(500)).await;
                }
            });
        }
    });

    let mut ctx = connect_master(port).await;
    ctx.set_error_recovery(ErrorRecoveryMode::LINK);
    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Connection { .. }));
    assert!(ctx.is_connected());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_tcp_response_timeout() {
    // holds the socket open without answering
    let port = fake_slave(|_| Some(Vec::new())).await;
    let mut ctx = connect_master(port).await;
    ctx.set_response_timeout(Duration::from_millis(50)).unwrap();

    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));
    assert_eq!(err.category(), ErrorCategory::Timeout);
}

#[tokio::test]
async fn test_tcp_peer_close_is_transport_error() {
    let port = fake_slave(|_| None).await;
    let mut ctx = connect_master(port).await;

    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(err.is_transport_error(), "unexpected error {:?}", err);
}

#[tokio::test]
async fn test_tcp_debug_frames_reach_logger() {
    let (mut server, port) = start_server(ModbusMapping::new(0, 0, 1, 0).unwrap()).await;
    let mut ctx = connect_master(port).await;

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    ctx.set_logger(CallbackLogger::new(
        Some(Box::new(move |_: LogLevel, message: &str| sink.lock().unwrap().push(message.to_string()))),
        LogLevel::Debug,
    ));
    ctx.set_debug(true);
    assert_ok!(ctx.read_registers(0, 1).await);

    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("[MODBUS-TCP] TX slave:255 00 01 00 00 00 06 FF 03"));
    assert!(lines[1].starts_with("[MODBUS-TCP] RX slave:255 00 01 00 00 00 05 FF 03 02"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_concurrent_masters_share_mapping() {
    let (mut server, port) = start_server(ModbusMapping::new(0, 0, 8, 0).unwrap()).await;

    let masters = (0..4u16).map(|i| async move {
        let mut ctx = connect_master(port).await;
        ctx.write_register(i, 100 + i).await?;
        let read = ctx.read_registers(i, 1).await?;
        ctx.close().await?;
        Ok::<_, ModbusError>(read[0])
    });
    let results = join_all(masters).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), 100 + i as u16);
    }
    assert_eq!(
        server.mapping().read().unwrap().holding_registers().as_slice(),
        &[100, 101, 102, 103, 0, 0, 0, 0]
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().connections_count, 4);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_pi_loopback() {
    let mapping = Arc::new(RwLock::new(ModbusMapping::new(0, 0, 4, 0).unwrap()));
    let config = ModbusTcpServerConfig {
        host: Some("127.0.0.1".to_string()),
        port: 0,
        protocol_independent: true,
        ..Default::default()
    };
    let mut server = ModbusTcpServer::with_config(config, mapping.clone()).unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut ctx = ModbusContext::new_tcp_pi(Some("127.0.0.1"), Some(&port.to_string())).unwrap();
    assert_eq!(ctx.backend_kind(), BackendKind::TcpPi);
    ctx.connect().await.unwrap();
    assert_ok!(ctx.write_register(2, 42).await);
    assert_eq!(mapping.read().unwrap().get_holding_register(2).unwrap(), 42);

    server.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// RTU helpers
// ---------------------------------------------------------------------------

/// In-memory serial line recording every hardware RTS transition.
struct PipeLine {
    inner: DuplexStream,
    rts: Arc<Mutex<Vec<bool>>>,
}

impl AsyncRead for PipeLine {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeLine {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl SerialLine for PipeLine {
    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.rts.lock().unwrap().push(level);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn rtu_on(stream: DuplexStream, slave: u8, quirks: Quirks) -> (ModbusContext, Arc<Mutex<Vec<bool>>>) {
    let rts = Arc::new(Mutex::new(Vec::new()));
    let mut transport = RtuTransport::new("pipe", 115200, 'N', 8, 1).unwrap();
    transport.attach_line(Box::new(PipeLine { inner: stream, rts: rts.clone() }));
    let mut ctx = ModbusContext::from_transport(Box::new(transport));
    ctx.enable_quirks(quirks);
    ctx.set_slave(slave).unwrap();
    (ctx, rts)
}

/// Master and slave Contexts joined by one pipe.
fn rtu_pair(master_slave: u8, slave_id: u8, slave_quirks: Quirks) -> (ModbusContext, ModbusContext, Arc<Mutex<Vec<bool>>>) {
    let (a, b) = duplex(512);
    let (master, rts) = rtu_on(a, master_slave, slave_quirks);
    let (slave, _) = rtu_on(b, slave_id, slave_quirks);
    (master, slave, rts)
}

/// Answer exactly one request on `slave`.
fn serve_once(mut slave: ModbusContext, mut mapping: ModbusMapping) -> tokio::task::JoinHandle<(Reply, ModbusMapping)> {
    tokio::spawn(async move {
        let request = slave.receive().await.unwrap();
        let reply = slave.reply(&request, &mut mapping).await.unwrap();
        (reply, mapping)
    })
}

#[tokio::test]
async fn test_rtu_exchange_with_hardware_rts() {
    let (mut master, slave, rts) = rtu_pair(1, 1, Quirks::NONE);
    master.rtu_set_rts(RtsMode::Up).unwrap();
    let served = serve_once(slave, ModbusMapping::new(0, 0, 8, 0).unwrap());

    assert_ok!(master.write_register(5, 0x1234).await);
    let (reply, mapping) = served.await.unwrap();
    assert_eq!(reply, Reply::Normal(vec![0x06, 0x00, 0x05, 0x12, 0x34]));
    assert_eq!(mapping.get_holding_register(5).unwrap(), 0x1234);

    // parked low, raised for the frame, released after it
    assert_eq!(*rts.lock().unwrap(), vec![false, true, false]);
}

#[tokio::test]
async fn test_rtu_custom_rts_callback() {
    let (mut master, slave, hardware) = rtu_pair(1, 1, Quirks::NONE);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    master.rtu_set_custom_rts(Box::new(move |on| seen.lock().unwrap().push(on))).unwrap();
    master.rtu_set_rts(RtsMode::Up).unwrap();
    let served = serve_once(slave, ModbusMapping::new(4, 0, 0, 0).unwrap());

    assert_eq!(master.read_bits(0, 4).await.unwrap(), vec![false; 4]);
    served.await.unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![false, true, false]);
    assert!(hardware.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rtu_broadcast_is_silent() {
    let (mut master, slave, _) = rtu_pair(BROADCAST_ADDRESS, 1, Quirks::NONE);
    let served = serve_once(slave, ModbusMapping::new(0, 0, 2, 0).unwrap());

    assert_ok!(master.write_register(1, 7).await);
    let (reply, mapping) = served.await.unwrap();
    assert_eq!(reply, Reply::Silent(SilentReason::Broadcast));
    assert_eq!(mapping.get_holding_register(1).unwrap(), 7);

    master.set_response_timeout(Duration::from_millis(50)).unwrap();
    assert!(matches!(master.receive_confirmation().await, Err(ModbusError::Timeout { .. })));
}

#[tokio::test]
async fn test_rtu_broadcast_answered_with_quirk() {
    let (mut master, slave, _) = rtu_pair(BROADCAST_ADDRESS, 1, Quirks::REPLY_TO_BROADCAST);
    let served = serve_once(slave, ModbusMapping::new(0, 0, 2, 0).unwrap());

    assert_ok!(master.write_register(0, 9).await);
    let (reply, _) = served.await.unwrap();
    assert_eq!(reply, Reply::Normal(vec![0x06, 0x00, 0x00, 0x00, 0x09]));

    let confirmation = master.receive_confirmation().await.unwrap();
    assert_eq!(&confirmation[..6], &[0x00, 0x06, 0x00, 0x00, 0x00, 0x09]);
}

#[tokio::test]
async fn test_rtu_max_slave_quirk() {
    let (mut master, slave, _) = rtu_pair(250, 250, Quirks::MAX_SLAVE);
    let mut mapping = ModbusMapping::new(0, 0, 1, 0).unwrap();
    mapping.set_holding_register(0, 0x0A0B).unwrap();
    let served = serve_once(slave, mapping);

    assert_eq!(master.read_registers(0, 1).await.unwrap(), vec![0x0A0B]);
    served.await.unwrap();
}

#[tokio::test]
async fn test_rtu_request_for_other_unit_ignored() {
    let (mut master, slave, _) = rtu_pair(2, 1, Quirks::NONE);
    master.set_response_timeout(Duration::from_millis(50)).unwrap();
    let served = serve_once(slave, ModbusMapping::new(0, 0, 1, 0).unwrap());

    assert!(matches!(master.write_register(0, 1).await, Err(ModbusError::Timeout { .. })));
    let (reply, mapping) = served.await.unwrap();
    assert_eq!(reply, Reply::Silent(SilentReason::OtherUnit(2)));
    assert_eq!(mapping.get_holding_register(0).unwrap(), 0);
}

#[tokio::test]
async fn test_rtu_bad_crc_rejected() {
    let (mut wire, b) = duplex(512);
    let (mut slave, _) = rtu_on(b, 1, Quirks::NONE);

    // valid frame is 01 03 00 00 00 01 84 0A
    wire.write_all(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0B]).await.unwrap();
    let err = slave.receive().await.unwrap_err();
    assert!(matches!(err, ModbusError::CrcMismatch { expected: 0x0A84, actual: 0x0B84 }));
    assert_eq!(err.category(), ErrorCategory::Framing);

    wire.write_all(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]).await.unwrap();
    assert_eq!(slave.receive().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_rtu_answer_from_wrong_unit() {
    let (a, mut wire) = duplex(512);
    let (mut master, _) = rtu_on(a, 1, Quirks::NONE);

    let responder = tokio::spawn(async move {
        let mut request = [0u8; 8];
        wire.read_exact(&mut request).await.unwrap();
        let response = AduCodec::rtu().encode_request(2, &[0x03, 0x02, 0x00, 0x07]).unwrap();
        wire.write_all(&response).await.unwrap();
        wire
    });

    let err = master.read_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::BadSlave { expected: 1, actual: 2 }));
    responder.await.unwrap();
}

#[tokio::test]
async fn test_rtu_server_serves_until_stopped() {
    let (a, b) = duplex(512);
    let (mut master, _) = rtu_on(a, 1, Quirks::NONE);
    let (slave, _) = rtu_on(b, 1, Quirks::NONE);

    let mapping = Arc::new(RwLock::new(ModbusMapping::new(8, 0, 0, 0).unwrap()));
    let mut server = ModbusRtuServer::with_context(slave, mapping.clone()).unwrap();
    server.start().await.unwrap();
    assert!(server.is_running());

    assert_ok!(master.write_bits(0, &[true, true, false, true]).await);
    assert_eq!(master.read_bits(0, 4).await.unwrap(), vec![true, true, false, true]);
    assert_err!(master.read_bits(6, 4).await);
    assert!(mapping.read().unwrap().get_coil(3).unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = server.stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.exception_responses, 1);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_config_file_builds_working_context() {
    let path = std::env::temp_dir().join(format!("modbus_engine_{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{"backend": {"type": "tcp", "ip": "127.0.0.1", "port": 1502},
            "context": {"response_timeout_ms": 250, "quirks": ["reply_to_broadcast"]},
            "mapping": {"coils": {"count": 8}}}"#,
    )
    .unwrap();

    let config = EngineConfig::from_file(&path).unwrap();
    let ctx = config.build_context().unwrap();
    assert_eq!(ctx.response_timeout(), Duration::from_millis(250));
    assert!(ctx.quirks().contains(Quirks::REPLY_TO_BROADCAST));
    assert_eq!(config.build_mapping().unwrap().coils().len(), 8);

    std::fs::remove_file(&path).unwrap();
}

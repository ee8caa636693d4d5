/// Random test client
///
/// Writes random values at random addresses of a `random_test_server`
/// with every write function, reads them back and reports mismatches.
/// Exits with an error when any exchange failed.
///
/// Usage: `random_test_client [tcp|tcp_pi|rtu] [device] [loops]`

use anyhow::{bail, ensure};
use rand::Rng;
use tracing::{error, info};

use modbus_engine::utils::format::format_metrics;
use modbus_engine::utils::logging::init_tracing;
use modbus_engine::{ExchangeMetrics, ExchangeTimer, ModbusClient, ModbusContext, ModbusError, ModbusResult};

const SERVER_ID: u8 = 17;
const ADDRESS_START: u16 = 0;
const ADDRESS_END: u16 = 99;
const MAX_BLOCK: u16 = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let mut args = std::env::args().skip(1);
    let backend = args.next().unwrap_or_else(|| "tcp".to_string());
    let device = args.next().unwrap_or_else(|| "/dev/ttyUSB1".to_string());
    let loops: usize = args.next().map(|n| n.parse::<usize>()).transpose()?.unwrap_or(100);

    let mut ctx = match backend.as_str() {
        "tcp" => ModbusContext::new_tcp(Some("127.0.0.1"), 1502)?,
        "tcp_pi" => ModbusContext::new_tcp_pi(Some("::1"), Some("1502"))?,
        "rtu" => ModbusContext::new_rtu(&device, 115200, 'N', 8, 1)?,
        other => bail!("unknown backend '{}', expected tcp, tcp_pi or rtu", other),
    };
    ctx.set_slave(SERVER_ID)?;
    ctx.set_debug(std::env::var_os("MODBUS_DEBUG").is_some());
    ctx.connect().await?;

    let mut metrics = ExchangeMetrics::new();
    let mut mismatches = 0usize;
    let mut rng = rand::thread_rng();

    for _ in 0..loops {
        let address = rng.gen_range(ADDRESS_START..=ADDRESS_END);
        let nb = rng.gen_range(1..=MAX_BLOCK.min(ADDRESS_END - address + 1));
        let bits: Vec<bool> = (0..nb).map(|_| rng.gen()).collect();
        let registers: Vec<u16> = (0..nb).map(|_| rng.gen()).collect();
        let swapped: Vec<u16> = registers.iter().map(|r| !r).collect();

        mismatches += check(&mut metrics, "single coil", async {
            ctx.write_bit(address, bits[0]).await?;
            Ok::<_, ModbusError>(ctx.read_bits(address, 1).await? == [bits[0]])
        })
        .await;

        mismatches += check(&mut metrics, "multiple coils", async {
            ctx.write_bits(address, &bits).await?;
            Ok::<_, ModbusError>(ctx.read_bits(address, nb).await? == bits)
        })
        .await;

        mismatches += check(&mut metrics, "single register", async {
            ctx.write_register(address, registers[0]).await?;
            Ok::<_, ModbusError>(ctx.read_registers(address, 1).await? == [registers[0]])
        })
        .await;

        mismatches += check(&mut metrics, "multiple registers", async {
            ctx.write_registers(address, &registers).await?;
            Ok::<_, ModbusError>(ctx.read_registers(address, nb).await? == registers)
        })
        .await;

        mismatches += check(&mut metrics, "write and read registers", async {
            let read = ctx.write_and_read_registers(address, &swapped, address, nb).await?;
            Ok::<_, ModbusError>(read == swapped)
        })
        .await;
    }

    info!("{}", format_metrics(&metrics));
    ctx.close().await?;
    ensure!(mismatches == 0 && metrics.failed == 0, "{} mismatches, {} failed exchanges", mismatches, metrics.failed);
    info!("TEST PASSED");
    Ok(())
}

/// Run one write/read-back exchange; 1 when the values differ.
async fn check<F>(metrics: &mut ExchangeMetrics, label: &str, exchange: F) -> usize
where
    F: std::future::Future<Output = ModbusResult<bool>>,
{
    let timer = ExchangeTimer::start(label);
    match exchange.await {
        Ok(true) => {
            timer.finish(metrics, true);
            0
        }
        Ok(false) => {
            timer.finish(metrics, true);
            error!("{}: values read back differ from those written", label);
            1
        }
        Err(e) => {
            timer.finish(metrics, false);
            error!("{}: {}", label, e);
            0
        }
    }
}

/// Random test server
///
/// Answers one master from a mapping of 500 entries per table until the
/// master disconnects. Pair with `random_test_client`.
///
/// Usage: `random_test_server [tcp|tcp_pi|rtu] [device]`

use anyhow::{bail, Context as _};
use tracing::info;

use modbus_engine::utils::logging::init_tracing;
use modbus_engine::{ModbusContext, ModbusError, ModbusMapping, Reply};

const TABLE_SIZE: usize = 500;
const SERVER_ID: u8 = 17;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let mut args = std::env::args().skip(1);
    let backend = args.next().unwrap_or_else(|| "tcp".to_string());
    let device = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    let mut mapping = ModbusMapping::new(TABLE_SIZE, TABLE_SIZE, TABLE_SIZE, TABLE_SIZE)?;
    let mut ctx = match backend.as_str() {
        "tcp" => ModbusContext::new_tcp(Some("127.0.0.1"), 1502)?,
        "tcp_pi" => ModbusContext::new_tcp_pi(Some("::0"), Some("1502"))?,
        "rtu" => {
            let mut ctx = ModbusContext::new_rtu(&device, 115200, 'N', 8, 1)?;
            ctx.set_slave(SERVER_ID)?;
            ctx
        }
        other => bail!("unknown backend '{}', expected tcp, tcp_pi or rtu", other),
    };
    ctx.set_debug(std::env::var_os("MODBUS_DEBUG").is_some());

    if backend == "rtu" {
        ctx.connect().await.with_context(|| format!("opening {}", device))?;
        info!("serving unit {} on {}", SERVER_ID, device);
    } else {
        let listener = ctx.listen(1).await?;
        info!("waiting for a master on {}", listener.local_addr()?);
        let peer = ctx.accept(&listener).await?;
        info!("master connected from {}", peer);
    }

    let (mut answered, mut exceptions) = (0u64, 0u64);
    loop {
        let request = match ctx.receive().await {
            Ok(request) => request,
            Err(ModbusError::Connection { .. }) => break,
            Err(e) if e.is_protocol_error() => {
                info!("skipping malformed request: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match ctx.reply(&request, &mut mapping).await? {
            Reply::Exception { .. } => exceptions += 1,
            Reply::Normal(_) => answered += 1,
            Reply::Silent(_) => {}
        }
    }

    info!("master disconnected: {} answered, {} exceptions", answered, exceptions);
    ctx.close().await?;
    Ok(())
}

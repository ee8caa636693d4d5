//! Engine configuration files.
//!
//! An [`EngineConfig`] describes one Context (backend and settings) and,
//! for slaves, the mapping it serves. JSON and YAML are both accepted:
//!
//! ```yaml
//! backend:
//!   type: rtu
//!   device: /dev/ttyUSB0
//!   baud: 19200
//!   parity: E
//! context:
//!   slave: 1
//!   response_timeout_ms: 1000
//!   error_recovery: [link, protocol]
//! mapping:
//!   holding_registers: { start: 0, count: 100 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::{ContextSettings, ErrorRecoveryMode, ModbusContext, Quirks};
use crate::error::{ModbusError, ModbusResult};
use crate::mapping::ModbusMapping;
use crate::protocol::{DEFAULT_TCP_PORT, TCP_SLAVE};
use crate::rts::{RtsMode, SerialMode};
use crate::transport::{RtuTransport, TcpTransport};

fn default_parity() -> char {
    'N'
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

/// Transport selection and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Rtu {
        device: String,
        baud: u32,
        #[serde(default = "default_parity")]
        parity: char,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        serial_mode: SerialMode,
        #[serde(default)]
        rts: RtsMode,
        /// Defaults to one character time
        #[serde(default)]
        rts_delay_us: Option<u64>,
    },
    Tcp {
        #[serde(default)]
        ip: Option<String>,
        #[serde(default = "default_port")]
        port: u16,
    },
    TcpPi {
        #[serde(default)]
        node: Option<String>,
        #[serde(default)]
        service: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryFlag {
    Link,
    Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuirkFlag {
    MaxSlave,
    ReplyToBroadcast,
}

/// Context settings as written in a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub slave: Option<u8>,
    pub response_timeout_ms: u64,
    pub byte_timeout_ms: u64,
    pub indication_timeout_ms: u64,
    pub debug: bool,
    pub error_recovery: Vec<RecoveryFlag>,
    pub quirks: Vec<QuirkFlag>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let settings = ContextSettings::default();
        Self {
            slave: None,
            response_timeout_ms: settings.response_timeout.as_millis() as u64,
            byte_timeout_ms: settings.byte_timeout.as_millis() as u64,
            indication_timeout_ms: 0,
            debug: false,
            error_recovery: Vec::new(),
            quirks: Vec::new(),
        }
    }
}

impl ContextConfig {
    pub fn error_recovery_mode(&self) -> ErrorRecoveryMode {
        self.error_recovery
            .iter()
            .fold(ErrorRecoveryMode::NONE, |mode, flag| match flag {
                RecoveryFlag::Link => mode | ErrorRecoveryMode::LINK,
                RecoveryFlag::Protocol => mode | ErrorRecoveryMode::PROTOCOL,
            })
    }

    pub fn quirk_set(&self) -> Quirks {
        self.quirks.iter().fold(Quirks::NONE, |quirks, flag| match flag {
            QuirkFlag::MaxSlave => quirks | Quirks::MAX_SLAVE,
            QuirkFlag::ReplyToBroadcast => quirks | Quirks::REPLY_TO_BROADCAST,
        })
    }
}

/// One table of the mapping; `count` 0 leaves it absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub start: u16,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub coils: TableConfig,
    pub discrete_inputs: TableConfig,
    pub holding_registers: TableConfig,
    pub input_registers: TableConfig,
}

/// Complete description of one engine endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `.json`, `.yaml` or `.yml`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            _ => Err(ModbusError::configuration(format!(
                "unsupported config format: {}",
                path.display()
            ))),
        }
    }

    pub fn to_yaml_string(&self) -> ModbusResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if let BackendConfig::Rtu { baud, parity, data_bits, stop_bits, .. } = &self.backend {
            if *baud == 0 {
                return Err(ModbusError::configuration("baud rate must be non-zero"));
            }
            if !matches!(parity, 'N' | 'E' | 'O') {
                return Err(ModbusError::configuration(format!("invalid parity '{}'", parity)));
            }
            if !(5..=8).contains(data_bits) {
                return Err(ModbusError::configuration(format!("invalid data bits {}", data_bits)));
            }
            if !matches!(stop_bits, 1 | 2) {
                return Err(ModbusError::configuration(format!("invalid stop bits {}", stop_bits)));
            }
        }
        if self.context.response_timeout_ms == 0 {
            return Err(ModbusError::configuration("response_timeout_ms must be non-zero"));
        }
        if let Some(slave) = self.context.slave {
            let tcp_slave = !matches!(self.backend, BackendConfig::Rtu { .. }) && slave == TCP_SLAVE;
            if slave > self.context.quirk_set().max_slave() && !tcp_slave {
                return Err(ModbusError::configuration(format!("invalid slave id {}", slave)));
            }
        }
        Ok(())
    }

    /// Context for the configured backend. Nothing is opened yet.
    pub fn build_context(&self) -> ModbusResult<ModbusContext> {
        self.validate()?;
        let mut ctx = match &self.backend {
            BackendConfig::Rtu {
                device,
                baud,
                parity,
                data_bits,
                stop_bits,
                serial_mode,
                rts,
                rts_delay_us,
            } => {
                let mut transport = RtuTransport::new(device, *baud, *parity, *data_bits, *stop_bits)?;
                transport.set_serial_mode(*serial_mode);
                if let Some(delay) = rts_delay_us {
                    transport.set_rts_delay(Duration::from_micros(*delay));
                }
                transport.set_rts(*rts)?;
                ModbusContext::from_transport(Box::new(transport))
            }
            BackendConfig::Tcp { ip, port } => {
                ModbusContext::from_transport(Box::new(TcpTransport::new(ip.as_deref(), *port)?))
            }
            BackendConfig::TcpPi { node, service } => ModbusContext::from_transport(Box::new(
                TcpTransport::new_pi(node.as_deref(), service.as_deref())?,
            )),
        };

        let context = &self.context;
        ctx.enable_quirks(context.quirk_set());
        if let Some(slave) = context.slave {
            ctx.set_slave(slave)?;
        }
        ctx.set_response_timeout(Duration::from_millis(context.response_timeout_ms))?;
        ctx.set_byte_timeout(Duration::from_millis(context.byte_timeout_ms));
        ctx.set_indication_timeout(Duration::from_millis(context.indication_timeout_ms));
        ctx.set_debug(context.debug);
        ctx.set_error_recovery(context.error_recovery_mode());
        Ok(ctx)
    }

    pub fn build_mapping(&self) -> ModbusResult<ModbusMapping> {
        let m = &self.mapping;
        ModbusMapping::new_start_address(
            m.coils.start,
            m.coils.count,
            m.discrete_inputs.start,
            m.discrete_inputs.count,
            m.holding_registers.start,
            m.holding_registers.count,
            m.input_registers.start,
            m.input_registers.count,
        )
    }
}

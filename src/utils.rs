/// Helpers shared by the engine, the test binaries and the test suites:
/// argument validation, formatting, exchange metrics and logger setup.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{ModbusError, ModbusResult};

/// Success and latency counters for a series of exchanges.
#[derive(Debug, Clone, Default)]
pub struct ExchangeMetrics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
}

impl ExchangeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, duration: Duration, success: bool) {
        self.total += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
    }

    /// Percentage of successful exchanges
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 * 100.0 / self.total as f64
    }

    pub fn average(&self) -> Duration {
        if self.total == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_duration.as_secs_f64() / self.total as f64)
    }
}

/// Times one exchange and feeds the result to [`ExchangeMetrics`].
pub struct ExchangeTimer {
    label: String,
    started: Instant,
}

impl ExchangeTimer {
    pub fn start(label: &str) -> Self {
        Self { label: label.to_string(), started: Instant::now() }
    }

    pub fn finish(self, metrics: &mut ExchangeMetrics, success: bool) -> Duration {
        let elapsed = self.started.elapsed();
        metrics.record(elapsed, success);
        if success {
            debug!("{} completed in {}", self.label, format::format_duration(elapsed));
        } else {
            warn!("{} failed after {}", self.label, format::format_duration(elapsed));
        }
        elapsed
    }
}

/// Argument checks run before any I/O.
pub mod validation {
    use super::*;

    /// `requested` must be in `1..=max`.
    pub fn check_quantity(requested: usize, max: usize) -> ModbusResult<()> {
        if requested == 0 {
            return Err(ModbusError::invalid_argument("quantity must be at least 1"));
        }
        if requested > max {
            return Err(ModbusError::too_much_data(requested, max));
        }
        Ok(())
    }

    /// The range must not run past address 0xFFFF.
    pub fn check_address_range(start: u16, count: usize) -> ModbusResult<()> {
        if start as usize + count > 0x1_0000 {
            return Err(ModbusError::invalid_argument(format!(
                "{} values from address {} run past the address space",
                count, start
            )));
        }
        Ok(())
    }
}

pub mod format {
    use super::*;

    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn format_duration(duration: Duration) -> String {
        let micros = duration.as_micros();
        if micros < 1_000 {
            format!("{}μs", micros)
        } else if micros < 1_000_000 {
            format!("{:.2}ms", micros as f64 / 1_000.0)
        } else {
            format!("{:.2}s", duration.as_secs_f64())
        }
    }

    pub fn format_metrics(metrics: &ExchangeMetrics) -> String {
        format!(
            "{} exchanges, {:.1}% ok, avg {}, min {}, max {}",
            metrics.total,
            metrics.success_rate(),
            format_duration(metrics.average()),
            metrics.min_duration.map_or("n/a".to_string(), format_duration),
            metrics.max_duration.map_or("n/a".to_string(), format_duration),
        )
    }
}

pub mod logging {
    use tracing_subscriber::EnvFilter;

    /// `log` output for tests, captured per test.
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }

    /// `tracing` subscriber honouring `RUST_LOG`, `default` otherwise.
    pub fn init_tracing(default: &str) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

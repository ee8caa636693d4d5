//! RTS flow control around RTU transmissions.
//!
//! RS-485 half-duplex adapters often need the RTS line raised (or lowered)
//! while a frame is on the wire. The controller drives the line through the
//! serial port, or through a per-context callback when one is installed.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::ModbusResult;
use crate::transport::SerialLine;

/// Settle time after each hardware RTS transition
const RTS_SETTLE: Duration = Duration::from_millis(1);

/// Custom RTS handler, called with `true` to assert the line.
pub type RtsCallback = Box<dyn FnMut(bool) + Send>;

/// Electrical interface of the serial port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialMode {
    #[default]
    Rs232,
    Rs485,
}

/// RTS polarity during transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtsMode {
    /// RTS is left alone
    #[default]
    None,
    /// RTS high while sending
    Up,
    /// RTS low while sending
    Down,
}

/// Drives RTS before and after each frame.
pub struct RtsController {
    mode: RtsMode,
    delay: Duration,
    callback: Option<RtsCallback>,
}

impl fmt::Debug for RtsController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtsController")
            .field("mode", &self.mode)
            .field("delay", &self.delay)
            .field("custom", &self.callback.is_some())
            .finish()
    }
}

impl RtsController {
    pub fn new(delay: Duration) -> Self {
        Self { mode: RtsMode::None, delay, callback: None }
    }

    pub fn mode(&self) -> RtsMode {
        self.mode
    }

    /// Change the mode and park the line in its idle level.
    pub fn set_mode(&mut self, mode: RtsMode, line: Option<&mut dyn SerialLine>) -> ModbusResult<()> {
        self.mode = mode;
        if mode == RtsMode::None {
            return Ok(());
        }
        let idle = mode != RtsMode::Up;
        match (self.callback.as_mut(), line) {
            (Some(callback), _) => callback(idle),
            (None, Some(line)) => line.set_rts(idle)?,
            (None, None) => {}
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn set_callback(&mut self, callback: RtsCallback) {
        self.callback = Some(callback);
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Assert RTS and wait the configured delay before the frame is written.
    pub async fn begin_frame(&mut self, line: &mut dyn SerialLine) -> ModbusResult<()> {
        if self.mode == RtsMode::None {
            return Ok(());
        }
        self.drive(line, self.mode == RtsMode::Up).await?;
        sleep(self.delay).await;
        Ok(())
    }

    /// Wait for `frame_len` bytes to drain, then release RTS.
    pub async fn end_frame(
        &mut self,
        line: &mut dyn SerialLine,
        frame_len: usize,
        onebyte_time: Duration,
    ) -> ModbusResult<()> {
        if self.mode == RtsMode::None {
            return Ok(());
        }
        sleep(onebyte_time * frame_len as u32 + self.delay).await;
        self.drive(line, self.mode != RtsMode::Up).await
    }

    async fn drive(&mut self, line: &mut dyn SerialLine, on: bool) -> ModbusResult<()> {
        match self.callback.as_mut() {
            Some(callback) => callback(on),
            None => {
                line.set_rts(on)?;
                sleep(RTS_SETTLE).await;
            }
        }
        Ok(())
    }
}

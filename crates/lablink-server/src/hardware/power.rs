//! Target power switch driven through a Raspberry Pi GPIO pin.

use super::{HwFuture, PowerSwitch};
use lablink_core::LabError;
use tokio::process::Command;
use tracing::info;

/// Drives the power relay pin with `pinctrl set <pin> op dh|dl`.
#[derive(Debug, Clone)]
pub struct GpioPowerSwitch {
    pin: u32,
}

impl GpioPowerSwitch {
    pub fn new(pin: u32) -> Self {
        Self { pin }
    }

    async fn drive(&self, high: bool) -> Result<(), LabError> {
        let level = if high { "dh" } else { "dl" };
        let status = Command::new("pinctrl")
            .args(["set", &self.pin.to_string(), "op", level])
            .status()
            .await
            .map_err(|e| LabError::Power(format!("cannot run pinctrl: {e}")))?;
        if !status.success() {
            return Err(LabError::Power(format!(
                "pinctrl set {} {level} exited with {status}",
                self.pin
            )));
        }
        info!(pin = self.pin, high, "power pin driven");
        Ok(())
    }
}

impl PowerSwitch for GpioPowerSwitch {
    fn power_on(&self) -> HwFuture<'_, ()> {
        Box::pin(self.drive(true))
    }

    fn power_off(&self) -> HwFuture<'_, ()> {
        Box::pin(self.drive(false))
    }
}

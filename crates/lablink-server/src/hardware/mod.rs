//! Hardware collaborators: the UART byte channel and the target power switch.
//!
//! The bridge treats the channel as an opaque byte pipe; the lifecycle
//! controller only decides *when* power changes happen.

pub mod mock;
pub mod power;
pub mod serial;

#[cfg(test)]
pub use mock::{MockHarness, PowerEvent};
pub use mock::{MockChannel, MockPowerSwitch};
pub use power::GpioPowerSwitch;
pub use serial::SerialChannel;

use lablink_core::LabResult;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by the collaborator traits.
pub type HwFuture<'a, T> = Pin<Box<dyn Future<Output = LabResult<T>> + Send + 'a>>;

/// How long the target stays unpowered during a reset.
pub const POWER_CYCLE_DELAY: Duration = Duration::from_secs(1);

/// The exclusive byte channel to the target's UART.
pub trait HardwareChannel: Send + Sync {
    /// Open the underlying device.
    fn open(&self) -> HwFuture<'_, ()>;

    /// Close the underlying device. Closing a closed channel is a no-op.
    fn close(&self) -> HwFuture<'_, ()>;

    /// Read whatever is available, waiting at most a short device timeout.
    /// Returns 0 when nothing arrived.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> HwFuture<'a, usize>;

    /// Write all bytes.
    fn write<'a>(&'a self, data: &'a [u8]) -> HwFuture<'a, ()>;

    /// Change the line speed.
    fn set_baud_rate(&self, baud_rate: u32) -> HwFuture<'_, ()>;
}

/// Power control for the target board.
pub trait PowerSwitch: Send + Sync {
    fn power_on(&self) -> HwFuture<'_, ()>;

    fn power_off(&self) -> HwFuture<'_, ()>;

    /// Power-cycle the target so it boots fresh.
    fn reset(&self) -> HwFuture<'_, ()> {
        Box::pin(async move {
            self.power_off().await?;
            tokio::time::sleep(POWER_CYCLE_DELAY).await;
            self.power_on().await
        })
    }
}

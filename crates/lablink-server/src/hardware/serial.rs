//! UART channel backed by tokio-serial.

use super::{HardwareChannel, HwFuture};
use lablink_core::LabError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

/// Upper bound on how long a single `read` waits for data.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// A serial port opened lazily by [`HardwareChannel::open`].
pub struct SerialChannel {
    path: String,
    baud_rate: std::sync::atomic::AtomicU32,
    port: Mutex<Option<SerialStream>>,
}

impl SerialChannel {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate: std::sync::atomic::AtomicU32::new(baud_rate),
            port: Mutex::new(None),
        }
    }

    fn baud(&self) -> u32 {
        self.baud_rate.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn not_open(&self) -> LabError {
        LabError::Hardware(format!("serial port {} is not open", self.path))
    }
}

impl HardwareChannel for SerialChannel {
    fn open(&self) -> HwFuture<'_, ()> {
        Box::pin(async move {
            let mut port = self.port.lock().await;
            if port.is_some() {
                return Ok(());
            }
            let stream = tokio_serial::new(&self.path, self.baud())
                .open_native_async()
                .map_err(|e| LabError::Hardware(format!("cannot open {}: {e}", self.path)))?;
            info!(path = %self.path, baud_rate = self.baud(), "serial port opened");
            *port = Some(stream);
            Ok(())
        })
    }

    fn close(&self) -> HwFuture<'_, ()> {
        Box::pin(async move {
            if self.port.lock().await.take().is_some() {
                info!(path = %self.path, "serial port closed");
            }
            Ok(())
        })
    }

    fn read<'a>(&'a self, buf: &'a mut [u8]) -> HwFuture<'a, usize> {
        Box::pin(async move {
            let mut guard = self.port.lock().await;
            let port = guard.as_mut().ok_or_else(|| self.not_open())?;
            match tokio::time::timeout(READ_TIMEOUT, port.read(buf)).await {
                Err(_) => Ok(0),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(LabError::Hardware(format!("serial read failed: {e}"))),
            }
        })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> HwFuture<'a, ()> {
        Box::pin(async move {
            let mut guard = self.port.lock().await;
            let port = guard.as_mut().ok_or_else(|| self.not_open())?;
            port.write_all(data)
                .await
                .map_err(|e| LabError::Hardware(format!("serial write failed: {e}")))?;
            port.flush()
                .await
                .map_err(|e| LabError::Hardware(format!("serial flush failed: {e}")))?;
            debug!(bytes = data.len(), "wrote to serial port");
            Ok(())
        })
    }

    fn set_baud_rate(&self, baud_rate: u32) -> HwFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.port.lock().await;
            let port = guard.as_mut().ok_or_else(|| self.not_open())?;
            port.set_baud_rate(baud_rate)
                .map_err(|e| LabError::Hardware(format!("cannot set baud rate: {e}")))?;
            self.baud_rate
                .store(baud_rate, std::sync::atomic::Ordering::Relaxed);
            info!(path = %self.path, baud_rate, "serial speed changed");
            Ok(())
        })
    }
}

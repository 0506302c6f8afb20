//! In-memory collaborators for tests and for running without a lab board.
//!
//! `MockChannel::new` returns the channel plus a [`MockHarness`] that plays
//! the role of the target: it injects bytes for the bridge to read and
//! observes everything the bridge writes.

use super::{HardwareChannel, HwFuture, PowerSwitch};
use lablink_core::LabError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

struct MockShared {
    readable: Mutex<VecDeque<u8>>,
    writes: Option<mpsc::UnboundedSender<Vec<u8>>>,
    open: AtomicBool,
    fail_reads: AtomicBool,
    echo: bool,
    baud_rate: AtomicU32,
}

impl MockShared {
    fn push_readable(&self, data: &[u8]) {
        self.readable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(data.iter().copied());
    }
}

/// Fake UART channel.
pub struct MockChannel {
    shared: Arc<MockShared>,
}

/// Target-side view of a [`MockChannel`].
#[cfg(test)]
pub struct MockHarness {
    shared: Arc<MockShared>,
    writes: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockChannel {
    /// A channel whose traffic is driven by the returned harness. Starts open.
    #[cfg(test)]
    pub fn new() -> (Self, MockHarness) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            readable: Mutex::new(VecDeque::new()),
            writes: Some(tx),
            open: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            echo: false,
            baud_rate: AtomicU32::new(115_200),
        });
        (
            Self {
                shared: shared.clone(),
            },
            MockHarness { shared, writes: rx },
        )
    }

    /// A loopback channel: every write becomes readable again.
    pub fn echo() -> Self {
        Self {
            shared: Arc::new(MockShared {
                readable: Mutex::new(VecDeque::new()),
                writes: None,
                open: AtomicBool::new(false),
                fail_reads: AtomicBool::new(false),
                echo: true,
                baud_rate: AtomicU32::new(115_200),
            }),
        }
    }

    fn ensure_open(&self) -> Result<(), LabError> {
        if self.shared.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LabError::Hardware("mock channel is closed".into()))
        }
    }
}

impl HardwareChannel for MockChannel {
    fn open(&self) -> HwFuture<'_, ()> {
        Box::pin(async move {
            self.shared.open.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn close(&self) -> HwFuture<'_, ()> {
        Box::pin(async move {
            self.shared.open.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn read<'a>(&'a self, buf: &'a mut [u8]) -> HwFuture<'a, usize> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.shared.fail_reads.load(Ordering::SeqCst) {
                return Err(LabError::Hardware("injected read failure".into()));
            }
            let mut readable = self
                .shared
                .readable
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let n = buf.len().min(readable.len());
            for (slot, byte) in buf.iter_mut().zip(readable.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> HwFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.shared.echo {
                self.shared.push_readable(data);
            }
            if let Some(tx) = &self.shared.writes {
                let _ = tx.send(data.to_vec());
            }
            debug!(bytes = data.len(), "mock channel write");
            Ok(())
        })
    }

    fn set_baud_rate(&self, baud_rate: u32) -> HwFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            self.shared.baud_rate.store(baud_rate, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
impl MockHarness {
    /// Make bytes available to the next channel reads.
    pub fn emit(&self, data: &[u8]) {
        self.shared.push_readable(data);
    }

    /// Wait for the next chunk the bridge wrote.
    pub async fn next_write(&mut self) -> Option<Vec<u8>> {
        self.writes.recv().await
    }

    /// Make every subsequent read fail.
    pub fn fail_reads(&self, fail: bool) {
        self.shared.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn baud_rate(&self) -> u32 {
        self.shared.baud_rate.load(Ordering::SeqCst)
    }
}

/// A power change observed by [`MockPowerSwitch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    On,
    Off,
    Reset,
}

/// Power switch that only records what it was asked to do.
#[derive(Debug, Default, Clone)]
pub struct MockPowerSwitch {
    events: Arc<Mutex<Vec<PowerEvent>>>,
}

impl MockPowerSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: PowerEvent) {
        debug!(?event, "mock power switch");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    #[cfg(test)]
    pub fn events(&self) -> Vec<PowerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PowerSwitch for MockPowerSwitch {
    fn power_on(&self) -> HwFuture<'_, ()> {
        Box::pin(async move {
            self.record(PowerEvent::On);
            Ok(())
        })
    }

    fn power_off(&self) -> HwFuture<'_, ()> {
        Box::pin(async move {
            self.record(PowerEvent::Off);
            Ok(())
        })
    }

    fn reset(&self) -> HwFuture<'_, ()> {
        Box::pin(async move {
            self.record(PowerEvent::Reset);
            Ok(())
        })
    }
}

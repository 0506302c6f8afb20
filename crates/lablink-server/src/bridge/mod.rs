//! Connection bridge: at most one client relayed to the hardware channel.
//!
//! ```text
//! Disconnected --attach--> Connected --drop/close/error--> GraceWindow
//! GraceWindow --attach--> Connected          (grace timer stopped)
//! GraceWindow --grace timer--> Disconnected  (lease reset, hardware released)
//! Connected/GraceWindow --force_disconnect--> Disconnected
//! ```
//!
//! All transitions happen under one lock that is never held across an
//! await. Waiting for a relay to stop happens after the lock is released.
//! A relay detaches itself when it stops; that report is ignored once its
//! id is no longer the active one.

mod relay;

pub use relay::RelayEnd;

use crate::hardware::HardwareChannel;
use crate::session::{DeadlineTimer, SessionLease};
use futures_util::future::BoxFuture;
use lablink_core::AttachError;
use relay::{RelayControl, RelayTuning};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invoked when the grace window elapses. The owner decides whether the
/// lease is released (see [`ConnectionBridge::expire_grace`]).
pub type GraceHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Bridge tuning.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Reconnection window after an unexpected disconnect.
    pub grace_period: Duration,
    /// Sleep between hardware polls that returned no data.
    pub poll_interval: Duration,
    /// Hardware read chunk size.
    pub read_buffer: usize,
    /// Client frames larger than this are dropped.
    pub max_frame_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(6),
            poll_interval: Duration::from_millis(100),
            read_buffer: 1024,
            max_frame_size: 1_048_576,
        }
    }
}

/// Externally visible bridge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Disconnected,
    Connected,
    GraceWindow,
}

enum Phase {
    Disconnected,
    Connected(RelayControl),
    GraceWindow,
}

struct BridgeState {
    phase: Phase,
    next_relay_id: u64,
}

/// Handle to an attached relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    id: u64,
    finished: CancellationToken,
}

impl RelayHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the relay has stopped and released the hardware channel.
    pub async fn closed(&self) {
        self.finished.cancelled().await
    }

}

/// Owns the single client connection and the relay to the hardware channel.
pub struct ConnectionBridge {
    state: Mutex<BridgeState>,
    lease: Arc<SessionLease>,
    channel: Arc<dyn HardwareChannel>,
    /// Held by a relay for its whole lifetime.
    channel_owner: Arc<tokio::sync::Mutex<()>>,
    grace_timer: DeadlineTimer,
    on_grace_expired: GraceHook,
    config: BridgeConfig,
}

impl ConnectionBridge {
    pub fn new(
        lease: Arc<SessionLease>,
        channel: Arc<dyn HardwareChannel>,
        config: BridgeConfig,
        on_grace_expired: GraceHook,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BridgeState {
                phase: Phase::Disconnected,
                next_relay_id: 1,
            }),
            lease,
            channel,
            channel_owner: Arc::new(tokio::sync::Mutex::new(())),
            grace_timer: DeadlineTimer::new("grace", config.grace_period),
            on_grace_expired,
            config,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tuning(&self) -> RelayTuning {
        RelayTuning {
            poll_interval: self.config.poll_interval,
            read_buffer: self.config.read_buffer,
            max_frame_size: self.config.max_frame_size,
        }
    }

    pub fn phase(&self) -> BridgePhase {
        match self.lock().phase {
            Phase::Disconnected => BridgePhase::Disconnected,
            Phase::Connected(_) => BridgePhase::Connected,
            Phase::GraceWindow => BridgePhase::GraceWindow,
        }
    }

    /// Whether the grace-window timer is pending.
    pub fn grace_pending(&self) -> bool {
        self.grace_timer.is_active()
    }

    fn check(state: &BridgeState, lease: &SessionLease, token: &str) -> Result<(), AttachError> {
        if matches!(state.phase, Phase::Connected(_)) {
            return Err(AttachError::Conflict);
        }
        if !lease.validate(token) {
            return Err(AttachError::Unauthorized);
        }
        Ok(())
    }

    /// Non-binding check used before upgrading an HTTP request, so that a
    /// refusal can be answered with a plain status code.
    pub fn precheck(&self, token: &str) -> Result<(), AttachError> {
        let state = self.lock();
        Self::check(&state, &self.lease, token)
    }

    /// Attach a client and start relaying.
    ///
    /// The conflict and token checks and the installation of the new relay
    /// happen under a single lock acquisition. A refused socket is closed with
    /// close code 4409 (conflict) or 4401 (unauthorized).
    pub async fn attach<S>(
        self: &Arc<Self>,
        mut ws: WebSocketStream<S>,
        token: &str,
    ) -> Result<RelayHandle, AttachError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let refused = {
            let mut state = self.lock();
            match Self::check(&state, &self.lease, token) {
                Ok(()) => return Ok(self.install(&mut state, ws)),
                Err(e) => e,
            }
        };

        warn!(error = %refused, "attach refused");
        let frame = CloseFrame {
            code: CloseCode::from(refused.close_code()),
            reason: refused.to_string().into(),
        };
        if let Err(e) = ws.close(Some(frame)).await {
            debug!(error = %e, "close after refused attach failed");
        }
        Err(refused)
    }

    /// Start a relay for `ws` and make it the active connection. Caller holds the lock.
    fn install<S>(self: &Arc<Self>, state: &mut BridgeState, ws: WebSocketStream<S>) -> RelayHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let resumed = matches!(state.phase, Phase::GraceWindow);
        self.grace_timer.stop();

        let id = state.next_relay_id;
        state.next_relay_id += 1;
        let control = RelayControl {
            id,
            cancel: CancellationToken::new(),
            notify_disconnect: Arc::new(AtomicBool::new(false)),
            finished: CancellationToken::new(),
        };
        tokio::spawn(relay::run(
            self.clone(),
            ws,
            id,
            control.cancel.clone(),
            control.notify_disconnect.clone(),
            control.finished.clone(),
        ));
        let handle = RelayHandle {
            id,
            finished: control.finished.clone(),
        };
        state.phase = Phase::Connected(control);
        info!(relay_id = id, resumed, "client attached");
        handle
    }

    /// Drop connection `id` without ending the session: its relay is
    /// cancelled and the grace window opens.
    ///
    /// A relay calls this itself when it stops on a transport or hardware
    /// failure or a client close. Idempotent: returns `false` when `id` is no
    /// longer the active connection.
    pub fn detach(&self, id: u64, reason: RelayEnd) -> bool {
        let control = {
            let mut state = self.lock();
            match std::mem::replace(&mut state.phase, Phase::GraceWindow) {
                Phase::Connected(control) if control.id == id => {
                    self.arm_grace();
                    control
                }
                other => {
                    state.phase = other;
                    debug!(relay_id = id, ?reason, "detach ignored, connection already gone");
                    return false;
                }
            }
        };
        control.cancel.cancel();
        info!(
            relay_id = id,
            ?reason,
            grace_ms = self.config.grace_period.as_millis() as u64,
            "client detached, grace window opened"
        );
        true
    }

    fn arm_grace(&self) {
        let hook = self.on_grace_expired.clone();
        self.grace_timer.start(async move { hook().await });
    }

    /// Tear down the active connection because the session is ending.
    ///
    /// Sends `{"type":"disconnect"}` first (best effort), never opens a grace
    /// window, and cancels a pending one. Returns once the relay has stopped
    /// touching the hardware channel. Returns whether a connection was closed.
    pub async fn force_disconnect(&self) -> bool {
        let control = {
            let mut state = self.lock();
            self.grace_timer.stop();
            match std::mem::replace(&mut state.phase, Phase::Disconnected) {
                Phase::Connected(control) => Some(control),
                _ => None,
            }
        };
        let Some(control) = control else {
            return false;
        };
        control.notify_disconnect.store(true, Ordering::SeqCst);
        control.cancel.cancel();
        control.finished.cancelled().await;
        info!(relay_id = control.id, "client forcibly disconnected");
        true
    }

    /// Grace window elapsed. Resets the lease and returns `true` only if no
    /// client reattached and nothing tore the session down in the meantime.
    pub fn expire_grace(&self) -> bool {
        let mut state = self.lock();
        if !matches!(state.phase, Phase::GraceWindow) {
            debug!("grace expiry ignored, bridge no longer waiting");
            return false;
        }
        state.phase = Phase::Disconnected;
        self.lease.reset();
        info!("grace window expired without reconnection");
        true
    }
}

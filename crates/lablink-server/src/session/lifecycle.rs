//! Lease lifecycle policy.
//!
//! Sequences lease changes, the lease-expiry timer, forced disconnects and
//! power changes. Transitions are serialized by one async lock so that a
//! deferred expiry can never act on a lease created after it was scheduled.
//! Power is only switched after the bridge has confirmed the relay stopped.

use super::lease::{LeaseInfo, SessionLease};
use super::timer::DeadlineTimer;
use crate::bridge::{BridgeConfig, ConnectionBridge, GraceHook};
use crate::hardware::{HardwareChannel, PowerSwitch};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of creating a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCreated {
    Created,
    /// A previously active lease was displaced and its client disconnected.
    Overwritten,
}

/// Outcome of deleting a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDeleted {
    Reset,
    AlreadyInactive,
}

/// Wires the lease, the lease-expiry timer, the bridge and the power switch.
pub struct LifecycleController {
    lease: Arc<SessionLease>,
    bridge: Arc<ConnectionBridge>,
    lease_timer: DeadlineTimer,
    power: Arc<dyn PowerSwitch>,
    transitions: Mutex<()>,
}

impl LifecycleController {
    pub fn new(
        lease: Arc<SessionLease>,
        channel: Arc<dyn HardwareChannel>,
        power: Arc<dyn PowerSwitch>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let on_grace_expired: GraceHook = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(controller) = weak.upgrade() {
                        controller.on_grace_expired().await;
                    }
                }
                .boxed()
            });
            Self {
                bridge: ConnectionBridge::new(lease.clone(), channel, config, on_grace_expired),
                lease,
                lease_timer: DeadlineTimer::new("lease", Duration::ZERO),
                power,
                transitions: Mutex::new(()),
            }
        })
    }

    pub fn lease(&self) -> &Arc<SessionLease> {
        &self.lease
    }

    pub fn bridge(&self) -> &Arc<ConnectionBridge> {
        &self.bridge
    }

    pub fn current_session(&self) -> Option<LeaseInfo> {
        self.lease.current()
    }

    /// Whether the lease-expiry timer is pending.
    pub fn lease_timer_active(&self) -> bool {
        self.lease_timer.is_active()
    }

    /// Install a new lease, preempting any existing one.
    ///
    /// A displaced lease is invalidated and its client disconnected before
    /// the target is power-cycled; the new token becomes usable only after
    /// the power cycle, so no relay runs while power changes.
    pub async fn create_session(
        self: &Arc<Self>,
        token: String,
        expires_at: DateTime<Utc>,
    ) -> SessionCreated {
        let _transition = self.transitions.lock().await;

        let displaced = self.lease.reset();
        if displaced {
            self.bridge.force_disconnect().await;
        }
        if let Err(e) = self.power.reset().await {
            warn!(error = %e, "power cycle failed");
        }

        let overwritten = self.lease.set(token, expires_at) || displaced;
        let generation = self.lease.generation();

        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.lease_timer.set_duration(remaining);
        let weak = Arc::downgrade(self);
        self.lease_timer.start(async move {
            if let Some(controller) = weak.upgrade() {
                controller.on_lease_expired(generation).await;
            }
        });
        info!(
            generation,
            remaining_secs = remaining.as_secs(),
            overwritten,
            "session created"
        );

        if overwritten {
            SessionCreated::Overwritten
        } else {
            SessionCreated::Created
        }
    }

    /// Explicit release by the backend.
    pub async fn delete_session(&self) -> SessionDeleted {
        let _transition = self.transitions.lock().await;

        let was_active = self.lease.reset();
        let remaining_secs = self.lease_timer.remaining().map(|d| d.as_secs());
        self.lease_timer.stop();
        self.bridge.force_disconnect().await;
        self.power_off().await;

        info!(was_active, ?remaining_secs, "session deleted");
        if was_active {
            SessionDeleted::Reset
        } else {
            SessionDeleted::AlreadyInactive
        }
    }

    async fn on_lease_expired(&self, generation: u64) {
        let _transition = self.transitions.lock().await;
        if !self.lease.is_active() || self.lease.generation() != generation {
            debug!(generation, "stale lease expiry ignored");
            return;
        }

        info!(generation, "session lease expired");
        self.lease.reset();
        self.bridge.force_disconnect().await;
        self.power_off().await;
    }

    async fn on_grace_expired(&self) {
        let _transition = self.transitions.lock().await;
        if !self.bridge.expire_grace() {
            return;
        }
        self.lease_timer.stop();
        self.power_off().await;
    }

    async fn power_off(&self) {
        if let Err(e) = self.power.power_off().await {
            warn!(error = %e, "power off failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgePhase, RelayEnd, RelayHandle};
    use crate::hardware::{MockChannel, MockHarness, MockPowerSwitch, PowerEvent};
    use futures_util::{SinkExt, StreamExt};
    use lablink_core::AttachError;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    type Ws = WebSocketStream<DuplexStream>;

    const GRACE: Duration = Duration::from_secs(1);

    async fn ws_pair() -> (Ws, Ws) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::join!(
            WebSocketStream::from_raw_socket(a, Role::Server, None),
            WebSocketStream::from_raw_socket(b, Role::Client, None),
        )
    }

    fn controller() -> (Arc<LifecycleController>, MockHarness, MockPowerSwitch) {
        let (channel, harness) = MockChannel::new();
        let power = MockPowerSwitch::new();
        let config = BridgeConfig {
            grace_period: GRACE,
            ..BridgeConfig::default()
        };
        let controller = LifecycleController::new(
            Arc::new(SessionLease::new()),
            Arc::new(channel),
            Arc::new(power.clone()),
            config,
        );
        (controller, harness, power)
    }

    fn secs_from_now(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    async fn next_text(client: &mut Ws) -> Option<String> {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(text.to_string()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    }

    async fn detach(controller: &LifecycleController, handle: &RelayHandle) {
        assert!(controller.bridge().detach(handle.id(), RelayEnd::Cancelled));
        handle.closed().await;
    }

    async fn wait_for(controller: &LifecycleController, phase: BridgePhase) {
        for _ in 0..100 {
            if controller.bridge().phase() == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bridge never reached {phase:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn create_arms_timer_and_cycles_power() {
        let (controller, _harness, power) = controller();
        let created = controller
            .create_session("t1".into(), secs_from_now(60))
            .await;
        assert_eq!(created, SessionCreated::Created);
        assert!(controller.lease_timer_active());
        assert!(controller.lease().validate("t1"));
        assert_eq!(power.events(), vec![PowerEvent::Reset]);

        let info = controller.current_session().unwrap();
        assert_eq!(info.token, "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn session_expires_end_to_end() {
        let (controller, mut harness, power) = controller();
        controller
            .create_session("tok".into(), secs_from_now(2))
            .await;

        let (server, mut client) = ws_pair().await;
        controller.bridge().attach(server, "tok").await.unwrap();

        client
            .send(Message::Text(r#"{"type":"uart","text":"PING"}"#.into()))
            .await
            .unwrap();
        assert_eq!(harness.next_write().await.unwrap(), b"PING");

        harness.emit(b"PONG");
        assert_eq!(
            next_text(&mut client).await.unwrap(),
            r#"{"type":"uart","text":"PONG"}"#
        );

        // lease timer fires at 2s
        assert_eq!(
            next_text(&mut client).await.unwrap(),
            r#"{"type":"disconnect"}"#
        );
        assert_eq!(next_text(&mut client).await, None);

        assert!(!controller.lease().is_active());
        assert_eq!(controller.bridge().phase(), BridgePhase::Disconnected);
        assert!(!controller.bridge().grace_pending());
        assert_eq!(power.events(), vec![PowerEvent::Reset, PowerEvent::Off]);

        let (server, _client) = ws_pair().await;
        assert_eq!(
            controller.bridge().attach(server, "tok").await.unwrap_err(),
            AttachError::Unauthorized
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_drop_resumes_within_grace() {
        let (controller, mut harness, power) = controller();
        controller
            .create_session("tok".into(), secs_from_now(3600))
            .await;

        let (server, client) = ws_pair().await;
        let first = controller.bridge().attach(server, "tok").await.unwrap();
        drop(client);
        first.closed().await;
        wait_for(&controller, BridgePhase::GraceWindow).await;

        let (server, mut client) = ws_pair().await;
        controller.bridge().attach(server, "tok").await.unwrap();
        tokio::time::sleep(GRACE * 3).await;

        assert!(controller.lease().validate("tok"));
        assert!(controller.lease_timer_active());
        assert_eq!(controller.bridge().phase(), BridgePhase::Connected);
        // no power cycle besides the one at creation
        assert_eq!(power.events(), vec![PowerEvent::Reset]);

        client
            .send(Message::Text(r#"{"text":"resume"}"#.into()))
            .await
            .unwrap();
        assert_eq!(harness.next_write().await.unwrap(), b"resume");
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_just_before_grace_expiry_wins() {
        let (controller, _harness, power) = controller();
        controller
            .create_session("tok".into(), secs_from_now(3600))
            .await;
        let (server, _client) = ws_pair().await;
        let handle = controller.bridge().attach(server, "tok").await.unwrap();

        detach(&controller, &handle).await;
        tokio::time::sleep(GRACE - Duration::from_millis(10)).await;

        let (server, _client) = ws_pair().await;
        assert!(controller.bridge().attach(server, "tok").await.is_ok());
        tokio::time::sleep(GRACE).await;
        assert!(controller.lease().is_active());
        assert_eq!(power.events(), vec![PowerEvent::Reset]);
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_after_grace_expiry_loses() {
        let (controller, _harness, power) = controller();
        controller
            .create_session("tok".into(), secs_from_now(3600))
            .await;
        let (server, _client) = ws_pair().await;
        let handle = controller.bridge().attach(server, "tok").await.unwrap();

        detach(&controller, &handle).await;
        tokio::time::sleep(GRACE + Duration::from_millis(10)).await;

        assert!(!controller.lease().is_active());
        assert!(!controller.lease_timer_active());
        assert_eq!(power.events(), vec![PowerEvent::Reset, PowerEvent::Off]);

        let (server, _client) = ws_pair().await;
        assert_eq!(
            controller.bridge().attach(server, "tok").await.unwrap_err(),
            AttachError::Unauthorized
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_preempts_active_client() {
        let (controller, _harness, power) = controller();
        controller
            .create_session("old".into(), secs_from_now(3600))
            .await;
        let (server, mut old_client) = ws_pair().await;
        controller.bridge().attach(server, "old").await.unwrap();

        let created = controller
            .create_session("new".into(), secs_from_now(3600))
            .await;
        assert_eq!(created, SessionCreated::Overwritten);
        assert_eq!(
            next_text(&mut old_client).await.unwrap(),
            r#"{"type":"disconnect"}"#
        );
        assert_eq!(
            power.events(),
            vec![PowerEvent::Reset, PowerEvent::Reset]
        );

        assert!(!controller.lease().validate("old"));
        let (server, _client) = ws_pair().await;
        assert!(controller.bridge().attach(server, "new").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_does_not_end_newer_session() {
        let (controller, _harness, _power) = controller();
        controller
            .create_session("first".into(), secs_from_now(1))
            .await;
        controller
            .create_session("second".into(), secs_from_now(3600))
            .await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(controller.lease().validate("second"));
        assert!(controller.lease_timer_active());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_tears_everything_down() {
        let (controller, _harness, power) = controller();
        controller
            .create_session("tok".into(), secs_from_now(3600))
            .await;
        let (server, mut client) = ws_pair().await;
        controller.bridge().attach(server, "tok").await.unwrap();

        assert_eq!(controller.delete_session().await, SessionDeleted::Reset);
        assert_eq!(
            next_text(&mut client).await.unwrap(),
            r#"{"type":"disconnect"}"#
        );
        assert!(!controller.lease().is_active());
        assert!(!controller.lease_timer_active());
        assert!(!controller.bridge().grace_pending());
        assert_eq!(controller.bridge().phase(), BridgePhase::Disconnected);
        assert_eq!(power.events(), vec![PowerEvent::Reset, PowerEvent::Off]);

        assert_eq!(
            controller.delete_session().await,
            SessionDeleted::AlreadyInactive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_during_grace_window() {
        let (controller, _harness, power) = controller();
        controller
            .create_session("tok".into(), secs_from_now(3600))
            .await;
        let (server, _client) = ws_pair().await;
        let handle = controller.bridge().attach(server, "tok").await.unwrap();
        detach(&controller, &handle).await;

        assert_eq!(controller.delete_session().await, SessionDeleted::Reset);
        tokio::time::sleep(GRACE * 2).await;
        // grace expiry did not power off a second time
        assert_eq!(power.events(), vec![PowerEvent::Reset, PowerEvent::Off]);
    }

    #[tokio::test(start_paused = true)]
    async fn past_expiry_ends_immediately() {
        let (controller, _harness, power) = controller();
        controller
            .create_session("tok".into(), secs_from_now(-5))
            .await;
        assert!(!controller.lease().validate("tok"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!controller.lease().is_active());
        assert_eq!(power.events(), vec![PowerEvent::Reset, PowerEvent::Off]);
    }
}

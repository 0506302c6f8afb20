//! Core server: builds the hardware collaborators and the lifecycle
//! controller, then runs the HTTP API and the WebSocket attach listener.

use crate::api::{self, ApiState};
use crate::config::ServerConfig;
use crate::hardware::{
    GpioPowerSwitch, HardwareChannel, MockChannel, MockPowerSwitch, PowerSwitch, SerialChannel,
};
use crate::session::{LifecycleController, SessionLease};
use crate::transport::websocket;
use lablink_core::{LabError, LabResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// The lablink server instance.
pub struct LabServer {
    config: ServerConfig,
    channel: Arc<dyn HardwareChannel>,
    power: Arc<dyn PowerSwitch>,
    controller: Arc<LifecycleController>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl LabServer {
    /// Create a new server instance. Hardware is not touched until
    /// [`LabServer::start_hardware`].
    pub fn new(config: ServerConfig) -> Self {
        let (channel, power): (Arc<dyn HardwareChannel>, Arc<dyn PowerSwitch>) =
            if config.mock_hardware {
                warn!("running with mocked hardware (loopback UART, no power control)");
                (Arc::new(MockChannel::echo()), Arc::new(MockPowerSwitch::new()))
            } else {
                (
                    Arc::new(SerialChannel::new(&config.serial_path, config.baud_rate)),
                    Arc::new(GpioPowerSwitch::new(config.power_pin)),
                )
            };
        Self::with_hardware(config, channel, power)
    }

    /// Create a server around caller-supplied hardware collaborators.
    pub fn with_hardware(
        config: ServerConfig,
        channel: Arc<dyn HardwareChannel>,
        power: Arc<dyn PowerSwitch>,
    ) -> Self {
        let controller = LifecycleController::new(
            Arc::new(SessionLease::new()),
            channel.clone(),
            power.clone(),
            config.bridge.clone(),
        );
        Self {
            config,
            channel,
            power,
            controller,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Open the UART and put the target into a known, unpowered state.
    pub async fn start_hardware(&self) -> LabResult<()> {
        self.channel.open().await?;
        if let Err(e) = self.power.power_off().await {
            warn!(error = %e, "initial power off failed");
        }
        info!(
            mocked = self.config.mock_hardware,
            device_type = %self.config.device_type,
            serial = %self.config.serial_path,
            baud_rate = self.config.baud_rate,
            "hardware ready"
        );
        Ok(())
    }

    /// Run both listeners until either fails or [`LabServer::shutdown`] is called.
    pub async fn run(&self) -> LabResult<()> {
        let http_addr = bind_addr(self.config.port)?;
        let ws_addr = bind_addr(self.config.ws_port)?;

        let (_, ws_task) = websocket::start_listener(ws_addr, self.controller.bridge().clone()).await?;
        let ws_abort = ws_task.abort_handle();

        let state = ApiState {
            controller: self.controller.clone(),
            channel: self.channel.clone(),
            api_secret: Arc::from(self.config.api_secret.as_str()),
            device_type: self.config.device_type,
        };
        let http = api::serve(http_addr, state, self.shutdown_tx.subscribe());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let result = tokio::select! {
            result = http => result,
            result = ws_task => result.map_err(|e| LabError::Other(format!("WS listener task: {e}"))),
            _ = shutdown_rx.recv() => Ok(()),
        };
        ws_abort.abort();
        result
    }

    /// Stop the listeners, end any active session and release the UART.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!(
            phase = ?self.controller.bridge().phase(),
            grace_pending = self.controller.bridge().grace_pending(),
            lease_timer = self.controller.lease_timer_active(),
            "shutting down"
        );
        let outcome = self.controller.delete_session().await;
        info!(?outcome, "session state cleared for shutdown");
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "failed to close hardware channel");
        }
    }
}

fn bind_addr(port: u16) -> LabResult<SocketAddr> {
    format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| LabError::Other(format!("invalid address: {e}")))
}

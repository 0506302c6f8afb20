//! lablink-server: single-tenant UART access server.
//!
//! A backend grants time-limited session leases over HTTP; the lease holder
//! attaches over WebSocket and gets a bidirectional relay to the target's UART.

mod api;
mod bridge;
mod config;
mod hardware;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use lablink_core::DeviceType;
use server::LabServer;
use std::path::PathBuf;
use tracing::{error, info};

/// lablink-server: UART session server
#[derive(Parser, Debug)]
#[command(name = "lablink-server", version, about = "UART session server")]
struct Cli {
    /// HTTP API port
    #[arg(short, long)]
    port: Option<u16>,

    /// WebSocket attach port (defaults to port + 1)
    #[arg(long)]
    ws_port: Option<u16>,

    /// Shared secret the backend sends in Authorization
    #[arg(long, env = "LABLINK_API_SECRET", hide_env_values = true)]
    api_secret: Option<String>,

    /// Serial device of the target UART
    #[arg(long)]
    serial: Option<String>,

    /// Initial UART baud rate
    #[arg(long)]
    baud_rate: Option<u32>,

    /// GPIO pin driving the target's power
    #[arg(long)]
    power_pin: Option<u32>,

    /// Reconnection grace window in milliseconds
    #[arg(long)]
    grace_period_ms: Option<u64>,

    /// Target kind reported to clients (mcu or fpga)
    #[arg(long)]
    device_type: Option<DeviceType>,

    /// Use a loopback UART and no power control
    #[arg(long)]
    mock_hardware: bool,

    /// Config file path
    #[arg(long, default_value = "~/.lablink/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting lablink-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        ws_port: cli.ws_port,
        api_secret: cli.api_secret,
        serial_path: cli.serial,
        baud_rate: cli.baud_rate,
        power_pin: cli.power_pin,
        grace_period_ms: cli.grace_period_ms,
        device_type: cli.device_type,
        mock_hardware: cli.mock_hardware,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(
        port = server_config.port,
        ws_port = server_config.ws_port,
        grace_ms = server_config.bridge.grace_period.as_millis() as u64,
        "config loaded"
    );

    let lab_server = LabServer::new(server_config);
    if let Err(e) = lab_server.start_hardware().await {
        error!(error = %e, "failed to open hardware channel");
        std::process::exit(1);
    }

    // Run until shutdown signal
    let mut exit_code = 0;
    tokio::select! {
        result = lab_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                exit_code = 1;
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    lab_server.shutdown().await;
    info!("lablink-server stopped");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

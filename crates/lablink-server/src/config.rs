//! Server configuration: TOML file + CLI overrides.

use crate::bridge::BridgeConfig;
use lablink_core::{DeviceType, LabError, LabResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub hardware: HardwareSection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Defaults to `port + 1`.
    #[serde(default)]
    pub ws_port: Option<u16>,
    /// Secret the lease-management backend sends in `Authorization`.
    #[serde(default)]
    pub api_secret: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            ws_port: None,
            api_secret: None,
        }
    }
}

/// `[hardware]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HardwareSection {
    #[serde(default = "default_serial_path")]
    pub serial_path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_power_pin")]
    pub power_pin: u32,
    /// Run against an in-process loopback channel and a no-op power switch.
    #[serde(default)]
    pub mocked: bool,
    /// Reported to the attached client (`mcu` or `fpga`).
    #[serde(default)]
    pub device_type: DeviceType,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            serial_path: default_serial_path(),
            baud_rate: default_baud_rate(),
            power_pin: default_power_pin(),
            mocked: false,
            device_type: DeviceType::default(),
        }
    }
}

/// `[bridge]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            read_buffer: default_read_buffer(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

fn default_port() -> u16 {
    8080
}
fn default_serial_path() -> String {
    "/dev/ttyACM0".to_string()
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_power_pin() -> u32 {
    17
}
fn default_grace_period_ms() -> u64 {
    6000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_read_buffer() -> usize {
    1024
}
fn default_max_frame_size() -> usize {
    1_048_576
}

/// Values given on the command line; `None`/`false` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub ws_port: Option<u16>,
    pub api_secret: Option<String>,
    pub serial_path: Option<String>,
    pub baud_rate: Option<u32>,
    pub power_pin: Option<u32>,
    pub grace_period_ms: Option<u64>,
    pub device_type: Option<DeviceType>,
    pub mock_hardware: bool,
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub ws_port: u16,
    pub api_secret: String,
    pub serial_path: String,
    pub baud_rate: u32,
    pub power_pin: u32,
    pub mock_hardware: bool,
    pub device_type: DeviceType,
    pub bridge: BridgeConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> LabResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| LabError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    /// Merge a parsed config file with CLI overrides.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> LabResult<Self> {
        let port = cli.port.unwrap_or(file.server.port);
        let ws_port = match cli.ws_port.or(file.server.ws_port) {
            Some(ws_port) => ws_port,
            None => port.checked_add(1).ok_or_else(|| {
                LabError::Config(format!(
                    "port {port} leaves no room for the default WebSocket port; set server.ws_port"
                ))
            })?,
        };
        if ws_port == port {
            return Err(LabError::Config(format!(
                "HTTP and WebSocket ports must differ (both {port})"
            )));
        }

        let api_secret = cli
            .api_secret
            .or(file.server.api_secret)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                LabError::Config(
                    "api secret missing: set server.api_secret or LABLINK_API_SECRET".into(),
                )
            })?;

        let grace_period_ms = cli.grace_period_ms.unwrap_or(file.bridge.grace_period_ms);
        if file.bridge.poll_interval_ms == 0 {
            return Err(LabError::Config(
                "bridge.poll_interval_ms must be at least 1".into(),
            ));
        }

        Ok(Self {
            port,
            ws_port,
            api_secret,
            serial_path: cli.serial_path.unwrap_or(file.hardware.serial_path),
            baud_rate: cli.baud_rate.unwrap_or(file.hardware.baud_rate),
            power_pin: cli.power_pin.unwrap_or(file.hardware.power_pin),
            mock_hardware: cli.mock_hardware || file.hardware.mocked,
            device_type: cli.device_type.unwrap_or(file.hardware.device_type),
            bridge: BridgeConfig {
                grace_period: Duration::from_millis(grace_period_ms),
                poll_interval: Duration::from_millis(file.bridge.poll_interval_ms),
                read_buffer: file.bridge.read_buffer,
                max_frame_size: file.bridge.max_frame_size,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_secret() -> CliOverrides {
        CliOverrides {
            api_secret: Some("s3cret".into()),
            ..CliOverrides::default()
        }
    }

    #[test]
    fn defaults() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), with_secret()).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ws_port, 8081);
        assert_eq!(cfg.serial_path, "/dev/ttyACM0");
        assert_eq!(cfg.baud_rate, 115_200);
        assert_eq!(cfg.bridge.grace_period, Duration::from_secs(6));
        assert_eq!(cfg.bridge.poll_interval, Duration::from_millis(100));
        assert!(!cfg.mock_hardware);
        assert_eq!(cfg.device_type, DeviceType::Mcu);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
port = 9000
api_secret = "from-file"

[hardware]
serial_path = "/dev/ttyUSB1"
baud_rate = 9600
mocked = true
device_type = "fpga"

[bridge]
grace_period_ms = 2500
poll_interval_ms = 20
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cfg = ServerConfig::resolve(file, CliOverrides::default()).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.ws_port, 9001);
        assert_eq!(cfg.api_secret, "from-file");
        assert_eq!(cfg.serial_path, "/dev/ttyUSB1");
        assert_eq!(cfg.baud_rate, 9600);
        assert!(cfg.mock_hardware);
        assert_eq!(cfg.device_type, DeviceType::Fpga);
        assert_eq!(cfg.bridge.grace_period, Duration::from_millis(2500));
        assert_eq!(cfg.bridge.poll_interval, Duration::from_millis(20));
        assert_eq!(cfg.bridge.read_buffer, 1024);
    }

    #[test]
    fn cli_overrides_file() {
        let file: ConfigFile = toml::from_str(
            "[server]\nport = 9000\nws_port = 9100\napi_secret = \"file\"\n",
        )
        .unwrap();
        let cli = CliOverrides {
            port: Some(7000),
            api_secret: Some("cli".into()),
            grace_period_ms: Some(100),
            ..CliOverrides::default()
        };
        let cfg = ServerConfig::resolve(file, cli).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.ws_port, 9100);
        assert_eq!(cfg.api_secret, "cli");
        assert_eq!(cfg.bridge.grace_period, Duration::from_millis(100));
    }

    #[test]
    fn missing_secret_is_an_error() {
        assert!(ServerConfig::resolve(ConfigFile::default(), CliOverrides::default()).is_err());
        let empty = CliOverrides {
            api_secret: Some(String::new()),
            ..CliOverrides::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), empty).is_err());
    }

    #[test]
    fn same_ports_rejected() {
        let cli = CliOverrides {
            port: Some(8000),
            ws_port: Some(8000),
            ..with_secret()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), cli).is_err());
    }

    #[test]
    fn top_port_needs_explicit_ws_port() {
        let cli = CliOverrides {
            port: Some(u16::MAX),
            ..with_secret()
        };
        let err = ServerConfig::resolve(ConfigFile::default(), cli).unwrap_err();
        assert!(err.to_string().contains("server.ws_port"), "{err}");

        let cli = CliOverrides {
            port: Some(u16::MAX),
            ws_port: Some(9000),
            ..with_secret()
        };
        let cfg = ServerConfig::resolve(ConfigFile::default(), cli).unwrap();
        assert_eq!(cfg.ws_port, 9000);
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let file: ConfigFile = toml::from_str("[bridge]\npoll_interval_ms = 0\n").unwrap();
        assert!(ServerConfig::resolve(file, with_secret()).is_err());
    }

    #[test]
    fn cli_device_type_wins() {
        let file: ConfigFile = toml::from_str("[hardware]\ndevice_type = \"fpga\"\n").unwrap();
        let cli = CliOverrides {
            device_type: Some(DeviceType::Mcu),
            ..with_secret()
        };
        let cfg = ServerConfig::resolve(file, cli).unwrap();
        assert_eq!(cfg.device_type, DeviceType::Mcu);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/lablink/config.toml")),
            with_secret(),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
    }
}

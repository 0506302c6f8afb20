//! Wire shapes for the relay and the lease-management API.
//!
//! The relay carries JSON text frames. Hardware output goes to the client as
//! `{"type":"uart","text":...}`, and `{"type":"disconnect"}` is sent once
//! before a forced teardown. Client frames carry their payload in `text`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LabError, LabResult};

/// Messages sent from the server to the attached client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A chunk of bytes read from the UART.
    Uart { text: String },
    /// The session is being torn down; the socket closes right after.
    Disconnect,
}

impl ServerMessage {
    /// Wrap a raw hardware chunk. Invalid UTF-8 is replaced, not rejected.
    pub fn uart(chunk: &[u8]) -> Self {
        ServerMessage::Uart {
            text: String::from_utf8_lossy(chunk).into_owned(),
        }
    }

    pub fn to_json(&self) -> LabResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A frame sent by the client. Only `text` is forwarded to the hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub text: String,
}

impl ClientMessage {
    /// Parse a client text frame.
    pub fn parse(raw: &str) -> LabResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| LabError::InvalidMessage(format!("client frame: {e}")))
    }

    /// The raw bytes to write to the hardware channel.
    pub fn into_payload(self) -> Vec<u8> {
        self.text.into_bytes()
    }
}

/// `POST /api/session` body. The end time is parsed separately so that a bad
/// date can be reported apart from a bad body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub token: String,
    pub session_end_time: String,
}

impl CreateSessionRequest {
    /// Parse `sessionEndTime` as RFC 3339.
    pub fn end_time(&self) -> LabResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.session_end_time)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| LabError::InvalidMessage(format!("sessionEndTime: {e}")))
    }
}

/// `GET /api/session` response; both fields are null when no lease is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub token: Option<String>,
    pub session_end_time: Option<DateTime<Utc>>,
}

/// Kind of target wired to the UART.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Mcu,
    Fpga,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mcu => "mcu",
            DeviceType::Fpga => "fpga",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mcu" => Ok(DeviceType::Mcu),
            "fpga" => Ok(DeviceType::Fpga),
            other => Err(LabError::Config(format!(
                "unknown device type {other:?} (expected mcu or fpga)"
            ))),
        }
    }
}

/// `GET /api/my-session` response for the attached client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MySessionView {
    pub session_end_time: DateTime<Utc>,
    pub device_type: DeviceType,
}

/// `POST /api/uart/speed` body and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartSpeed {
    pub speed: u32,
}

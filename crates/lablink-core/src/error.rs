use thiserror::Error;

/// Errors produced by the lablink server and its collaborators.
#[derive(Debug, Error)]
pub enum LabError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("power switch error: {0}")]
    Power(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type LabResult<T> = Result<T, LabError>;

/// Why a bridge attach attempt was refused.
///
/// Neither variant changes bridge or lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("only one connection allowed at a time")]
    Conflict,

    #[error("unauthorized")]
    Unauthorized,
}

impl AttachError {
    /// HTTP status code reported to the client when the attach is refused.
    pub fn status_code(&self) -> u16 {
        match self {
            AttachError::Conflict => 409,
            AttachError::Unauthorized => 401,
        }
    }

    /// WebSocket close code used when the refusal happens after the upgrade.
    pub fn close_code(&self) -> u16 {
        4000 + self.status_code()
    }
}

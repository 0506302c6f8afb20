//! lablink-core: shared protocol library for the lab UART bridge.
//!
//! Provides the relay message shapes, lease-management request/response
//! bodies, the error taxonomy, and bearer token extraction.

pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{AttachError, LabError, LabResult};
pub use messages::{
    ClientMessage, CreateSessionRequest, DeviceType, MySessionView, ServerMessage, SessionView,
    UartSpeed,
};
pub use token::{bearer_from_header, bearer_from_query, header_candidates};

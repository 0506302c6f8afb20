//! Session management: the lease, the deadline timer, and the lifecycle
//! policy that ties them to the bridge and the power switch.

pub mod lease;
pub mod lifecycle;
pub mod timer;

pub use lease::{LeaseInfo, SessionLease};
pub use lifecycle::{LifecycleController, SessionCreated, SessionDeleted};
pub use timer::DeadlineTimer;

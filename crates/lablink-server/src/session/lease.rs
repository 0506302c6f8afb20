//! The process-wide session lease.
//!
//! Exactly one logical lease exists at a time. It is created by the backend,
//! checked on every privileged access, and cleared on delete, expiry, or when
//! the reconnection grace window runs out.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug)]
struct LeaseState {
    active: bool,
    token: String,
    expires_at: DateTime<Utc>,
    /// Bumped on every `set`, so deferred work can tell which lease it belongs to.
    generation: u64,
}

impl LeaseState {
    fn accepts(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.active && self.token == token && now < self.expires_at
    }

    fn info(&self) -> LeaseInfo {
        LeaseInfo {
            token: self.token.clone(),
            expires_at: self.expires_at,
            generation: self.generation,
        }
    }
}

/// Snapshot of an active lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub generation: u64,
}

/// Current authorization: token, expiry, active flag.
#[derive(Debug)]
pub struct SessionLease {
    state: Mutex<LeaseState>,
}

impl Default for SessionLease {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLease {
    /// Create an inactive lease.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LeaseState {
                active: false,
                token: String::new(),
                expires_at: DateTime::<Utc>::MIN_UTC,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a new lease. Returns `true` if an active lease was displaced.
    pub fn set(&self, token: impl Into<String>, expires_at: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        let overwritten = state.active;
        state.active = true;
        state.token = token.into();
        state.expires_at = expires_at;
        state.generation += 1;
        info!(
            generation = state.generation,
            expires_at = %expires_at,
            overwritten,
            "session lease set"
        );
        overwritten
    }

    /// True iff a lease is active, `token` matches it, and it has not expired.
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, Utc::now())
    }

    /// [`validate`](Self::validate) against an explicit clock reading.
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.lock().accepts(token, now)
    }

    /// Validate `token` and snapshot the lease it matched, under one lock.
    pub fn validated(&self, token: &str) -> Option<LeaseInfo> {
        let state = self.lock();
        state.accepts(token, Utc::now()).then(|| state.info())
    }

    /// Deactivate the lease. Returns whether it had been active.
    pub fn reset(&self) -> bool {
        let mut state = self.lock();
        let was_active = state.active;
        state.active = false;
        if was_active {
            info!(generation = state.generation, "session lease reset");
        } else {
            debug!("session lease reset (already inactive)");
        }
        was_active
    }

    /// The active lease, if any. Expired-but-not-yet-reset leases are returned.
    pub fn current(&self) -> Option<LeaseInfo> {
        let state = self.lock();
        state.active.then(|| state.info())
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Generation of the most recently set lease (0 before the first `set`).
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}

//! Shared lifecycle status.
//!
//! The cache and the persister escalate into the same indicator. Once it
//! reports [`LifecycleStatus::Error`] the owner is expected to stop feeding
//! the tracker and restart it.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::error;

/// Coarse lifecycle status of the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleStatus {
    Up,
    /// Carries the reason of the first escalation.
    Error(String),
}

/// Cloneable handle to a shared [`LifecycleStatus`].
#[derive(Debug, Clone)]
pub struct HealthIndicator {
    status: Arc<RwLock<LifecycleStatus>>,
}

impl Default for HealthIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthIndicator {
    pub fn new() -> Self {
        Self {
            status: Arc::new(RwLock::new(LifecycleStatus::Up)),
        }
    }

    pub fn status(&self) -> LifecycleStatus {
        self.status.read().clone()
    }

    pub fn is_up(&self) -> bool {
        matches!(*self.status.read(), LifecycleStatus::Up)
    }

    /// Escalate to [`LifecycleStatus::Error`].
    ///
    /// The first reason sticks; later escalations are only logged.
    pub fn set_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "delivery tracker lifecycle error");
        let mut status = self.status.write();
        if matches!(*status, LifecycleStatus::Up) {
            *status = LifecycleStatus::Error(reason);
        }
    }

    /// Clear a previous escalation.
    pub fn set_up(&self) {
        *self.status.write() = LifecycleStatus::Up;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_reason_sticks() {
        let health = HealthIndicator::new();
        let shared = health.clone();
        assert!(health.is_up());

        shared.set_error("conflict on partition 1");
        shared.set_error("write failed");

        assert_eq!(
            health.status(),
            LifecycleStatus::Error("conflict on partition 1".to_string())
        );

        health.set_up();
        assert!(shared.is_up());
    }
}

//! Live tracker configuration with change notification.

use tokio::sync::watch;
use tracker_config::{ConfigResult, DeliveryTrackerConfig};

/// Holds the current [`DeliveryTrackerConfig`] snapshot.
///
/// Snapshots are replaced wholesale by [`update`](Self::update); listeners
/// obtained from [`subscribe`](Self::subscribe) observe every replacement.
#[derive(Debug)]
pub struct DeliveryTrackerConfiguration {
    tx: watch::Sender<DeliveryTrackerConfig>,
}

impl Default for DeliveryTrackerConfiguration {
    fn default() -> Self {
        Self::new(DeliveryTrackerConfig::default())
    }
}

impl DeliveryTrackerConfiguration {
    pub fn new(initial: DeliveryTrackerConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// The snapshot in effect right now.
    pub fn current(&self) -> DeliveryTrackerConfig {
        self.tx.borrow().clone()
    }

    /// Validate and install a new snapshot, notifying subscribers.
    pub fn update(&self, config: DeliveryTrackerConfig) -> ConfigResult<()> {
        config.validate()?;
        self.tx.send_replace(config);
        Ok(())
    }

    /// A listener that sees the current snapshot and every later one.
    pub fn subscribe(&self) -> watch::Receiver<DeliveryTrackerConfig> {
        self.tx.subscribe()
    }
}

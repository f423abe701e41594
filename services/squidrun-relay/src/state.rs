use std::sync::Arc;

use crate::config::RelayConfig;
use crate::pairing::PairingEngine;
use crate::pending::PendingAckTracker;
use crate::registry::DeviceRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: DeviceRegistry,
    pub pending: PendingAckTracker,
    pub pairing: PairingEngine,
}

impl AppState {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: DeviceRegistry::new(),
            pending: PendingAckTracker::new(),
            pairing: PairingEngine::new(),
        }
    }
}

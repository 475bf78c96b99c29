//! Registry of connector instances, one per source name.
//!
//! The registry owns every [`ConnectorCore`] a process runs and fans
//! lifecycle calls out to all of them. Source names are unique; registering
//! the same name twice is refused rather than replacing the live instance.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::{ConnectorCore, CoreStatus};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("source `{0}` is already registered")]
    DuplicateSource(String),

    #[error("source name must not be empty")]
    EmptySourceName,
}

/// All connector instances of one process.
pub struct ConnectorRegistry {
    connectors: DashMap<String, Arc<ConnectorCore>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        ConnectorRegistry {
            connectors: DashMap::new(),
        }
    }

    /// Add an instance under its source name and hand back the shared handle.
    pub fn register(&self, core: ConnectorCore) -> Result<Arc<ConnectorCore>, RegistryError> {
        let source = core.source_name().to_string();
        if source.is_empty() {
            return Err(RegistryError::EmptySourceName);
        }
        match self.connectors.entry(source.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateSource(source)),
            Entry::Vacant(slot) => {
                let core = Arc::new(core);
                slot.insert(Arc::clone(&core));
                info!(source = %source, "connector registered");
                Ok(core)
            }
        }
    }

    pub fn get(&self, source: &str) -> Option<Arc<ConnectorCore>> {
        self.connectors.get(source).map(|entry| Arc::clone(&entry))
    }

    pub fn count(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connectors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Start every registered instance concurrently.
    ///
    /// Returns how many came up; the ones that did not are logged and left
    /// stopped, they do not prevent the rest from starting.
    pub async fn start_all(&self, timeout: Duration) -> usize {
        let cores = self.handles();
        let results = join_all(cores.iter().map(|core| core.start(timeout))).await;
        let mut started = 0;
        for (core, ok) in cores.iter().zip(results) {
            if ok {
                started += 1;
            } else {
                warn!(source = %core.source_name(), "connector failed to start");
            }
        }
        info!(started, total = cores.len(), "registry startup complete");
        started
    }

    /// Stop every registered instance concurrently.
    pub async fn stop_all(&self) {
        let cores = self.handles();
        join_all(cores.iter().map(|core| core.stop())).await;
        info!(total = cores.len(), "registry shutdown complete");
    }

    /// `true` only when at least one source is registered and every one of
    /// them is healthy.
    pub fn all_healthy(&self) -> bool {
        !self.is_empty() && self.handles().iter().all(|core| core.is_healthy())
    }

    /// Status snapshots for every instance, ordered by source name.
    pub fn statuses(&self) -> Vec<CoreStatus> {
        let mut statuses: Vec<CoreStatus> =
            self.handles().iter().map(|core| core.status()).collect();
        statuses.sort_by(|a, b| a.source.cmp(&b.source));
        statuses
    }

    // Snapshot the handles first; holding DashMap shard guards across an
    // await would deadlock against concurrent registrations.
    fn handles(&self) -> Vec<Arc<ConnectorCore>> {
        self.connectors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

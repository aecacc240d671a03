//! Backend-type to driver-constructor table.

use peerlink_common::{PeerlinkError, PeerlinkResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::TunnelDriver;

pub type DriverConstructor =
    Box<dyn Fn() -> PeerlinkResult<Arc<dyn TunnelDriver>> + Send + Sync>;

/// Driver constructors keyed by backend type. Each backend may be
/// registered once.
#[derive(Default)]
pub struct DriverRegistry {
    constructors: BTreeMap<String, DriverConstructor>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        backend: impl Into<String>,
        constructor: DriverConstructor,
    ) -> PeerlinkResult<()> {
        let backend = backend.into();
        if self.constructors.contains_key(&backend) {
            return Err(PeerlinkError::DuplicateBackend { backend });
        }
        info!("Registered tunnel backend {}", backend);
        self.constructors.insert(backend, constructor);
        Ok(())
    }

    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Constructs one driver per registered backend.
    pub fn instantiate(&self) -> PeerlinkResult<DriverSet> {
        let mut drivers = BTreeMap::new();
        for (backend, constructor) in &self.constructors {
            drivers.insert(backend.clone(), constructor()?);
        }
        Ok(DriverSet { drivers })
    }
}

/// Constructed drivers, looked up by backend type.
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: BTreeMap<String, Arc<dyn TunnelDriver>>,
}

impl DriverSet {
    /// Returns the driver for `backend`, or a non-retryable
    /// [`PeerlinkError::UnknownBackend`].
    pub fn get(&self, backend: &str) -> PeerlinkResult<Arc<dyn TunnelDriver>> {
        self.drivers
            .get(backend)
            .cloned()
            .ok_or_else(|| PeerlinkError::unknown_backend(backend))
    }

    pub async fn init_all(&self) -> PeerlinkResult<()> {
        for driver in self.drivers.values() {
            driver.init().await?;
            info!(
                "Tunnel backend {} initialized on {}",
                driver.backend(),
                driver.interface_name()
            );
        }
        Ok(())
    }

    /// Closes every driver, logging failures instead of stopping at the
    /// first one.
    pub async fn close_all(&self) {
        for driver in self.drivers.values() {
            if let Err(e) = driver.close().await {
                warn!("Failed to close tunnel backend {}: {}", driver.backend(), e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

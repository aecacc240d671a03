//! One-time startup gate on the local network configuration.
//!
//! Controllers compute rules from the local pod and external CIDRs, so the
//! daemon holds them back until the first configuration has been published.

use peerlink_common::{PeerlinkError, PeerlinkResult};
use peerlink_types::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalNetwork {
    pub pod_cidr: Ipv4Cidr,
    pub external_cidr: Ipv4Cidr,
}

#[derive(Debug, Clone)]
pub struct StartupGate {
    tx: Arc<watch::Sender<Option<LocalNetwork>>>,
}

impl Default for StartupGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publishes (or replaces) the local network configuration.
    pub fn publish(&self, network: LocalNetwork) {
        info!(
            pod_cidr = %network.pod_cidr,
            external_cidr = %network.external_cidr,
            "Local network configuration published"
        );
        self.tx.send_replace(Some(network));
    }

    pub fn current(&self) -> Option<LocalNetwork> {
        *self.tx.borrow()
    }

    /// Waits until a configuration has been published.
    pub async fn wait(&self) -> PeerlinkResult<LocalNetwork> {
        let mut rx = self.tx.subscribe();
        let network = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PeerlinkError::internal("startup gate closed"))?;
        (*network).ok_or_else(|| PeerlinkError::internal("startup gate released empty"))
    }
}

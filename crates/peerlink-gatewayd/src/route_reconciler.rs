//! Remote-cluster routes on ordinary nodes.
//!
//! Nodes that do not host the tunnel send traffic for a peered cluster's
//! CIDRs through the overlay to the active gateway replica.

use async_trait::async_trait;
use peerlink_common::{PeerlinkError, PeerlinkResult, Reconciler, Requeue};
use peerlink_routing::{RouteTarget, RoutingManager};
use peerlink_types::ClusterIdentity;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::pod_controller::ActiveGateway;
use crate::store::ConnectionStore;

pub struct RouteReconciler {
    store: Arc<dyn ConnectionStore>,
    routing: Arc<RoutingManager>,
    active: Arc<ActiveGateway>,
    resync: Duration,
}

impl RouteReconciler {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        routing: Arc<RoutingManager>,
        active: Arc<ActiveGateway>,
        resync: Duration,
    ) -> Self {
        Self {
            store,
            routing,
            active,
            resync,
        }
    }
}

#[async_trait]
impl Reconciler for RouteReconciler {
    type Key = ClusterIdentity;

    fn name(&self) -> &str {
        "route"
    }

    #[instrument(skip(self), fields(cluster = %key))]
    async fn reconcile(&self, key: &ClusterIdentity) -> PeerlinkResult<Requeue> {
        let descriptor = match self.store.get_connection(key).await? {
            Some(d) if !d.deletion_requested => d,
            _ => {
                let removed = self.routing.remove_connection(key).await?;
                debug!(removed, "Connection gone, routes withdrawn");
                return Ok(Requeue::Done);
            }
        };
        descriptor.spec.validate()?;

        let via = self.active.overlay_ip().ok_or_else(|| {
            PeerlinkError::not_ready(format!("routes to cluster {}", key), "no active gateway")
        })?;
        self.routing
            .ensure_connection(&descriptor.spec, &RouteTarget::Overlay(via))
            .await?;
        Ok(Requeue::After(self.resync))
    }
}

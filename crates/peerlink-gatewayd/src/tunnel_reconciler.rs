//! Connection Reconciler.
//!
//! Drives one connection descriptor through its lifecycle:
//!
//! - **Pending**: the remote gateway IP is unknown, nothing to do.
//! - **Connecting**: attach the finalizer, then `connect_to_endpoint`.
//! - **Connected**: the driver reports a stable link; per-cluster rules and
//!   routes are ensured and the descriptor becomes `Ready`.
//! - **Disconnecting**: deletion was requested; the peer, rules and routes
//!   are torn down before the finalizer is released.
//!
//! Status is written back only when it changed materially, so a healthy
//! tunnel reconciled on every resync does not churn the store.

use async_trait::async_trait;
use peerlink_common::{PeerlinkError, PeerlinkResult, Reconciler, Requeue};
use peerlink_netfilter::RuleEngine;
use peerlink_routing::{RouteTarget, RoutingManager};
use peerlink_tunnel::{DriverSet, TunnelDriver};
use peerlink_types::{
    ClusterIdentity, ConnectionDescriptor, ConnectionState, ConnectionStatus, DescriptorStatus,
    Phase, FINALIZER,
};
use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::events::EventRecorder;
use crate::service_controller::AdvertisedEndpoint;
use crate::store::ConnectionStore;

/// Attempts at a conditional write before the conflict is handed back.
const CONFLICT_RETRIES: usize = 5;

/// Delay before a key whose writes kept conflicting is looked at again.
const CONFLICT_REQUEUE: Duration = Duration::from_millis(200);

pub struct TunnelReconciler {
    store: Arc<dyn ConnectionStore>,
    drivers: DriverSet,
    rules: Arc<RuleEngine>,
    routing: Arc<RoutingManager>,
    events: Arc<dyn EventRecorder>,
    resync: Duration,
    advertised: Option<Arc<AdvertisedEndpoint>>,
}

/// What must stay equal for a status write to be skipped.
fn material(
    status: &DescriptorStatus,
) -> (
    Phase,
    Option<ConnectionState>,
    Option<&BTreeMap<String, String>>,
    Option<&str>,
    Option<SocketAddrV4>,
) {
    (
        status.phase,
        status.connection.as_ref().map(|c| c.state),
        status.connection.as_ref().map(|c| &c.peer_configuration),
        status.tunnel_interface.as_deref(),
        status.local_endpoint,
    )
}

impl TunnelReconciler {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        drivers: DriverSet,
        rules: Arc<RuleEngine>,
        routing: Arc<RoutingManager>,
        events: Arc<dyn EventRecorder>,
        resync: Duration,
    ) -> Self {
        Self {
            store,
            drivers,
            rules,
            routing,
            events,
            resync,
            advertised: None,
        }
    }

    /// Endpoint published into every status this reconciler writes.
    pub fn with_advertised_endpoint(mut self, advertised: Arc<AdvertisedEndpoint>) -> Self {
        self.advertised = Some(advertised);
        self
    }

    /// Adds or removes our finalizer, re-reading the descriptor on conflict.
    ///
    /// Returns the descriptor as stored afterwards, or `None` if it is gone.
    async fn set_finalizer(
        &self,
        id: &ClusterIdentity,
        present: bool,
    ) -> PeerlinkResult<Option<ConnectionDescriptor>> {
        let mut last_conflict = None;
        for _ in 0..CONFLICT_RETRIES {
            let Some(current) = self.store.get_connection(id).await? else {
                return Ok(None);
            };
            if current.has_finalizer() == present {
                return Ok(Some(current));
            }
            let mut finalizers = current.finalizers.clone();
            if present {
                finalizers.insert(FINALIZER.to_string());
            } else {
                finalizers.remove(FINALIZER);
            }
            match self
                .store
                .update_finalizers(id, current.resource_version, finalizers)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => {
                    debug!(cluster = %id, "Finalizer update conflicted, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict
            .unwrap_or_else(|| PeerlinkError::conflict(id.to_string(), "retries exhausted")))
    }

    /// Writes `status` unless it matches what is stored. Returns true if written.
    async fn persist_status(
        &self,
        id: &ClusterIdentity,
        mut status: DescriptorStatus,
    ) -> PeerlinkResult<bool> {
        status.local_endpoint = self.advertised.as_ref().and_then(|a| a.endpoint());
        let mut last_conflict = None;
        for _ in 0..CONFLICT_RETRIES {
            let Some(current) = self.store.get_connection(id).await? else {
                return Ok(false);
            };
            if material(&current.status) == material(&status) {
                return Ok(false);
            }
            match self
                .store
                .update_status(id, current.resource_version, status.clone())
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => {
                    debug!(cluster = %id, "Status update conflicted, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict
            .unwrap_or_else(|| PeerlinkError::conflict(id.to_string(), "retries exhausted")))
    }

    async fn connect(
        &self,
        descriptor: ConnectionDescriptor,
        driver: Arc<dyn TunnelDriver>,
    ) -> PeerlinkResult<Requeue> {
        let id = descriptor.identity().clone();
        let spec = &descriptor.spec;
        let iface = driver.interface_name().to_string();
        let was_ready = descriptor.is_ready();

        let status = match driver.connect_to_endpoint(&descriptor).await {
            Ok(status) => status,
            Err(e) => {
                self.events.warning(&id, "ConnectFailed", &e.to_string());
                let failed = DescriptorStatus {
                    phase: Phase::Pending,
                    connection: Some(ConnectionStatus::new(
                        ConnectionState::ConnectionError,
                        e.to_string(),
                    )),
                    tunnel_interface: Some(iface),
                    local_endpoint: None,
                };
                if let Err(write_err) = self.persist_status(&id, failed).await {
                    debug!(cluster = %id, error = %write_err, "Could not record connect failure");
                }
                return Err(e);
            }
        };

        let phase = if status.is_connected() {
            if let Err(e) = self.ensure_datapath(&descriptor, &iface).await {
                self.events.warning(&id, "DatapathFailed", &e.to_string());
                return Err(e);
            }
            Phase::Ready
        } else {
            debug!(cluster = %id, message = %status.message, "Tunnel not established yet");
            Phase::Pending
        };

        let message = status.message.clone();
        let written = self
            .persist_status(
                &id,
                DescriptorStatus {
                    phase,
                    connection: Some(status),
                    tunnel_interface: Some(iface.clone()),
                    local_endpoint: None,
                },
            )
            .await?;

        match (was_ready, phase) {
            (false, Phase::Ready) => {
                self.events.normal(
                    &id,
                    "Connected",
                    &format!("tunnel to {} established via {}", spec.cluster, iface),
                );
            }
            (true, Phase::Pending) => {
                self.events.warning(&id, "ConnectionLost", &message);
            }
            _ => {}
        }
        if written {
            debug!(cluster = %id, phase = %phase, "Status persisted");
        }

        Ok(Requeue::After(self.resync))
    }

    async fn ensure_datapath(
        &self,
        descriptor: &ConnectionDescriptor,
        iface: &str,
    ) -> PeerlinkResult<()> {
        let rules = self.rules.ensure_rules_per_cluster(&descriptor.spec).await?;
        let routes = self
            .routing
            .ensure_connection(&descriptor.spec, &RouteTarget::Device(iface.to_string()))
            .await?;
        if !rules.is_noop() || routes > 0 {
            info!(
                cluster = %descriptor.identity(),
                rules_added = rules.added,
                rules_removed = rules.removed,
                route_changes = routes,
                "Datapath converged"
            );
        }
        Ok(())
    }

    async fn disconnect(&self, descriptor: ConnectionDescriptor) -> PeerlinkResult<Requeue> {
        let id = descriptor.identity().clone();
        if !descriptor.has_finalizer() {
            debug!(cluster = %id, "Deletion requested, no finalizer of ours");
            return Ok(Requeue::Done);
        }

        let terminating = DescriptorStatus {
            phase: Phase::Terminating,
            ..descriptor.status.clone()
        };
        self.persist_status(&id, terminating).await?;

        if let Err(e) = self.teardown(&descriptor).await {
            self.events.warning(&id, "DisconnectFailed", &e.to_string());
            return Err(e);
        }

        self.set_finalizer(&id, false).await?;
        self.events
            .normal(&id, "Disconnected", "tunnel, rules and routes removed");
        Ok(Requeue::Done)
    }

    async fn teardown(&self, descriptor: &ConnectionDescriptor) -> PeerlinkResult<()> {
        let id = descriptor.identity();
        match self.drivers.get(&descriptor.spec.backend_type) {
            Ok(driver) => driver.disconnect_from_endpoint(descriptor).await?,
            Err(e) => warn!(cluster = %id, error = %e, "No driver to disconnect with"),
        }
        self.rules.remove_per_cluster(id).await?;
        let removed = self.routing.remove_connection(id).await?;
        info!(cluster = %id, routes_removed = removed, "Connection torn down");
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %id))]
    async fn reconcile_descriptor(&self, id: &ClusterIdentity) -> PeerlinkResult<Requeue> {
        let Some(descriptor) = self.store.get_connection(id).await? else {
            debug!("Descriptor gone");
            return Ok(Requeue::Done);
        };

        if descriptor.deletion_requested {
            return self.disconnect(descriptor).await;
        }

        if let Err(e) = descriptor.spec.validate() {
            self.events.warning(id, "InvalidSpec", &e.to_string());
            return Err(e.into());
        }

        let driver = match self.drivers.get(&descriptor.spec.backend_type) {
            Ok(driver) => driver,
            Err(e) => {
                self.events.warning(id, "UnknownBackend", &e.to_string());
                return Err(e);
            }
        };

        if descriptor.spec.endpoint_ip().is_none() {
            debug!("Remote gateway address unknown, waiting");
            return Ok(Requeue::Done);
        }

        let descriptor = if descriptor.has_finalizer() {
            descriptor
        } else {
            match self.set_finalizer(id, true).await? {
                Some(updated) => updated,
                None => return Ok(Requeue::Done),
            }
        };

        self.connect(descriptor, driver).await
    }
}

#[async_trait]
impl Reconciler for TunnelReconciler {
    type Key = ClusterIdentity;

    fn name(&self) -> &str {
        "connection"
    }

    async fn reconcile(&self, key: &ClusterIdentity) -> PeerlinkResult<Requeue> {
        match self.reconcile_descriptor(key).await {
            Err(e) if e.is_conflict() => {
                debug!(cluster = %key, error = %e, "Store conflict, requeueing");
                Ok(Requeue::After(CONFLICT_REQUEUE))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LoggingRecorder;
    use crate::store::tests::spec;
    use crate::store::MemoryStore;
    use peerlink_netfilter::fake::FakePacketFilter;
    use peerlink_netfilter::Table;
    use peerlink_netlink::fake::FakeNetConfig;
    use peerlink_routing::RoutingConfig;
    use peerlink_tunnel::fake::FakeTunnelDriver;
    use peerlink_tunnel::DriverRegistry;
    use peerlink_types::{backend_keys, TableId};
    use pretty_assertions::assert_eq;

    struct Harness {
        store: Arc<MemoryStore>,
        driver: Arc<FakeTunnelDriver>,
        filter: Arc<FakePacketFilter>,
        net: Arc<FakeNetConfig>,
        events: Arc<LoggingRecorder>,
        reconciler: TunnelReconciler,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(FakeTunnelDriver::new("fake"));
        let filter = Arc::new(FakePacketFilter::new());
        let net = Arc::new(FakeNetConfig::new().with_link("fake0"));
        let events = Arc::new(LoggingRecorder::default());

        let mut registry = DriverRegistry::new();
        let shared = Arc::clone(&driver);
        registry
            .register(
                "fake",
                Box::new(move || Ok(Arc::clone(&shared) as Arc<dyn TunnelDriver>)),
            )
            .unwrap();

        let rules = Arc::new(RuleEngine::new(filter.clone()));
        rules.init().await.unwrap();
        let routing = Arc::new(RoutingManager::new(
            net.clone(),
            RoutingConfig {
                gateway_table: TableId::custom(18952).unwrap(),
                symmetric_table: TableId::custom(18953).unwrap(),
                rule_priority: 200,
                overlay_device: "vxlan.plk".to_string(),
            },
        ));

        let reconciler = TunnelReconciler::new(
            store.clone(),
            registry.instantiate().unwrap(),
            rules,
            routing,
            events.clone(),
            Duration::from_secs(30),
        );
        Harness {
            store,
            driver,
            filter,
            net,
            events,
            reconciler,
        }
    }

    fn east() -> ClusterIdentity {
        ClusterIdentity::new("east").unwrap()
    }

    #[tokio::test]
    async fn test_pending_without_endpoint() {
        let h = harness().await;
        let mut spec = spec("east");
        spec.backend_config.remove(backend_keys::ENDPOINT_IP);
        h.store.apply_connection(spec);

        let requeue = h.reconciler.reconcile(&east()).await.unwrap();
        assert_eq!(requeue, Requeue::Done);
        assert_eq!(h.driver.connect_count(), 0);
        assert!(!h.store.connection(&east()).unwrap().has_finalizer());
    }

    #[tokio::test]
    async fn test_connect_makes_ready() {
        let h = harness().await;
        h.store.apply_connection(spec("east"));

        let requeue = h.reconciler.reconcile(&east()).await.unwrap();
        assert_eq!(requeue, Requeue::After(Duration::from_secs(30)));

        let descriptor = h.store.connection(&east()).unwrap();
        assert!(descriptor.has_finalizer());
        assert!(descriptor.is_ready());
        assert_eq!(descriptor.status.tunnel_interface.as_deref(), Some("fake0"));
        assert!(h.filter.has_chain(Table::Filter, "PLK-FRWD-CLS-EAST"));
        assert_eq!(h.net.routes(TableId::custom(18952).unwrap()).len(), 2);
        assert_eq!(h.events.reasons(&east()), vec!["Connected".to_string()]);
    }

    #[tokio::test]
    async fn test_connecting_stays_pending() {
        let h = harness().await;
        h.driver.set_state(ConnectionState::Connecting);
        h.store.apply_connection(spec("east"));

        h.reconciler.reconcile(&east()).await.unwrap();
        let descriptor = h.store.connection(&east()).unwrap();
        assert_eq!(descriptor.status.phase, Phase::Pending);
        assert!(!h.filter.has_chain(Table::Filter, "PLK-FRWD-CLS-EAST"));
    }

    #[tokio::test]
    async fn test_unchanged_status_not_rewritten() {
        let h = harness().await;
        h.store.apply_connection(spec("east"));
        h.reconciler.reconcile(&east()).await.unwrap();
        let writes = h.store.write_count();
        let version = h.store.connection(&east()).unwrap().resource_version;

        h.reconciler.reconcile(&east()).await.unwrap();
        assert_eq!(h.store.write_count(), writes);
        assert_eq!(h.store.connection(&east()).unwrap().resource_version, version);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_event() {
        let h = harness().await;
        h.driver.fail_connect(true);
        h.store.apply_connection(spec("east"));

        let err = h.reconciler.reconcile(&east()).await.unwrap_err();
        assert!(err.is_retryable());
        let descriptor = h.store.connection(&east()).unwrap();
        assert_eq!(
            descriptor.status.connection.map(|c| c.state),
            Some(ConnectionState::ConnectionError)
        );
        assert_eq!(h.events.reasons(&east()), vec!["ConnectFailed".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_spec_is_permanent() {
        let h = harness().await;
        let mut spec = spec("east");
        spec.remote_remapped_pod_cidr = "10.0.4.0/24".parse().unwrap();
        h.store.apply_connection(spec);

        let err = h.reconciler.reconcile(&east()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(h.driver.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_conflicts_retried_silently() {
        let h = harness().await;
        h.store.apply_connection(spec("east"));
        h.store.inject_conflicts(2);

        h.reconciler.reconcile(&east()).await.unwrap();
        assert!(h.store.connection(&east()).unwrap().has_finalizer());
        assert!(h.events.reasons(&east()).iter().all(|r| r != "ConnectFailed"));
    }

    #[tokio::test]
    async fn test_persistent_conflict_requeues() {
        let h = harness().await;
        h.store.apply_connection(spec("east"));
        h.store.inject_conflicts(CONFLICT_RETRIES);

        let requeue = h.reconciler.reconcile(&east()).await.unwrap();
        assert_eq!(requeue, Requeue::After(CONFLICT_REQUEUE));
        assert_eq!(h.driver.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_deletion_tears_down_before_release() {
        let h = harness().await;
        h.store.apply_connection(spec("east"));
        h.reconciler.reconcile(&east()).await.unwrap();
        assert!(h.store.request_deletion(&east()));

        h.reconciler.reconcile(&east()).await.unwrap();
        assert_eq!(h.store.connection(&east()), None);
        assert_eq!(h.driver.disconnect_count(), 1);
        assert!(!h.filter.has_chain(Table::Filter, "PLK-FRWD-CLS-EAST"));
        assert!(h.net.routes(TableId::custom(18952).unwrap()).is_empty());

        // Gone from the store: nothing left to do.
        assert_eq!(h.reconciler.reconcile(&east()).await.unwrap(), Requeue::Done);
        assert_eq!(h.driver.disconnect_count(), 1);
    }
}

//! Service controller.
//!
//! Watches the gateway Service, the one carrying the gateway label, and
//! keeps the endpoint it advertises (service IP plus the tunnel port) in
//! [`AdvertisedEndpoint`]. Every connection is requeued when that endpoint
//! changes so the connection reconciler publishes it in the descriptor
//! status.

use async_trait::async_trait;
use parking_lot::RwLock;
use peerlink_common::{PeerlinkResult, Reconciler, Requeue, WorkQueue};
use peerlink_types::ClusterIdentity;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::LabelsConfig;
use crate::store::{ConnectionStore, ServiceRecord, TopologyStore};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Advertised {
    service: String,
    endpoint: SocketAddrV4,
}

/// The endpoint remote clusters should connect to, and the Service it
/// came from.
#[derive(Debug, Default)]
pub struct AdvertisedEndpoint {
    current: RwLock<Option<Advertised>>,
}

impl AdvertisedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> Option<SocketAddrV4> {
        self.current.read().as_ref().map(|a| a.endpoint)
    }

    pub fn service(&self) -> Option<String> {
        self.current.read().as_ref().map(|a| a.service.clone())
    }

    /// Returns true if the endpoint changed.
    fn set(&self, service: &str, endpoint: SocketAddrV4) -> bool {
        let mut current = self.current.write();
        let next = Advertised {
            service: service.to_string(),
            endpoint,
        };
        if current.as_ref() == Some(&next) {
            return false;
        }
        *current = Some(next);
        true
    }

    /// Clears the endpoint if `service` supplied it. Returns true if cleared.
    fn clear_if(&self, service: &str) -> bool {
        let mut current = self.current.write();
        if current.as_ref().map(|a| a.service.as_str()) == Some(service) {
            *current = None;
            return true;
        }
        false
    }
}

pub struct ServiceController {
    store: Arc<dyn TopologyStore>,
    labels: LabelsConfig,
    advertised: Arc<AdvertisedEndpoint>,
    connections: Option<(Arc<dyn ConnectionStore>, Arc<WorkQueue<ClusterIdentity>>)>,
}

impl ServiceController {
    pub fn new(
        store: Arc<dyn TopologyStore>,
        labels: LabelsConfig,
        advertised: Arc<AdvertisedEndpoint>,
    ) -> Self {
        Self {
            store,
            labels,
            advertised,
            connections: None,
        }
    }

    /// Connections to revisit when the advertised endpoint changes.
    pub fn with_connection_queue(
        mut self,
        store: Arc<dyn ConnectionStore>,
        queue: Arc<WorkQueue<ClusterIdentity>>,
    ) -> Self {
        self.connections = Some((store, queue));
        self
    }

    fn is_gateway(&self, service: &ServiceRecord) -> bool {
        service.has_label(&self.labels.gateway_key, &self.labels.gateway_value)
    }

    /// The endpoint `service` advertises, if it has an address and a UDP
    /// tunnel port yet.
    fn endpoint_of(&self, service: &ServiceRecord) -> Option<SocketAddrV4> {
        let Some(ip) = service.ip else {
            debug!(service = %service.name, "Gateway service has no address yet");
            return None;
        };
        match service.port(&self.labels.gateway_port_name) {
            Some(port) if port.protocol.eq_ignore_ascii_case("udp") && port.port != 0 => {
                Some(SocketAddrV4::new(ip, port.port))
            }
            Some(port) => {
                warn!(
                    service = %service.name,
                    protocol = %port.protocol,
                    port = port.port,
                    "Gateway service port is not a usable UDP port"
                );
                None
            }
            None => {
                warn!(
                    service = %service.name,
                    port_name = %self.labels.gateway_port_name,
                    "Gateway service lacks the tunnel port"
                );
                None
            }
        }
    }

    async fn requeue_connections(&self) -> PeerlinkResult<()> {
        let Some((store, queue)) = &self.connections else {
            return Ok(());
        };
        for descriptor in store.list_connections().await? {
            queue.add(descriptor.identity().clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ServiceController {
    type Key = String;

    fn name(&self) -> &str {
        "service"
    }

    #[instrument(skip(self), fields(service = %key))]
    async fn reconcile(&self, key: &String) -> PeerlinkResult<Requeue> {
        let service = self.store.get_service(key).await?;
        let endpoint = service
            .as_ref()
            .filter(|s| self.is_gateway(s))
            .and_then(|s| self.endpoint_of(s));

        let changed = match endpoint {
            Some(endpoint) => {
                if let Some(other) = self.advertised.service().filter(|s| s != key) {
                    warn!(previous = %other, "Another gateway service now supplies the endpoint");
                }
                self.advertised.set(key, endpoint)
            }
            None => self.advertised.clear_if(key),
        };

        if changed {
            info!(endpoint = ?self.advertised.endpoint(), "Advertised gateway endpoint changed");
            self.requeue_connections().await?;
        }
        Ok(Requeue::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::spec;
    use crate::store::{MemoryStore, ServicePort};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    struct Harness {
        store: Arc<MemoryStore>,
        advertised: Arc<AdvertisedEndpoint>,
        queue: Arc<WorkQueue<ClusterIdentity>>,
        controller: ServiceController,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let advertised = Arc::new(AdvertisedEndpoint::new());
        let queue = Arc::new(WorkQueue::new());
        let controller =
            ServiceController::new(store.clone(), LabelsConfig::default(), advertised.clone())
                .with_connection_queue(store.clone(), queue.clone());
        Harness {
            store,
            advertised,
            queue,
            controller,
        }
    }

    fn gateway_service(ip: Option<Ipv4Addr>, port: u16) -> ServiceRecord {
        let labels = LabelsConfig::default();
        ServiceRecord::new("peerlink-gateway", ip)
            .with_port(ServicePort::udp("tunnel", port))
            .with_label(labels.gateway_key, labels.gateway_value)
    }

    fn key() -> String {
        "peerlink-gateway".to_string()
    }

    #[tokio::test]
    async fn test_gateway_service_sets_endpoint_and_requeues() {
        let h = harness();
        h.store.apply_connection(spec("east"));
        h.store
            .put_service(gateway_service(Some(Ipv4Addr::new(172, 18, 0, 100)), 51820));

        h.controller.reconcile(&key()).await.unwrap();
        assert_eq!(
            h.advertised.endpoint(),
            Some("172.18.0.100:51820".parse().unwrap())
        );
        assert_eq!(h.queue.try_next(), Some(ClusterIdentity::new("east").unwrap()));
        h.queue.done(&ClusterIdentity::new("east").unwrap());

        // unchanged: nothing requeued
        h.controller.reconcile(&key()).await.unwrap();
        assert_eq!(h.queue.try_next(), None);
    }

    #[tokio::test]
    async fn test_pending_address_advertises_nothing() {
        let h = harness();
        h.store.put_service(gateway_service(None, 51820));
        h.controller.reconcile(&key()).await.unwrap();
        assert_eq!(h.advertised.endpoint(), None);
    }

    #[tokio::test]
    async fn test_unlabelled_service_is_ignored() {
        let h = harness();
        h.store.put_service(
            ServiceRecord::new("web", Some(Ipv4Addr::new(172, 18, 0, 7)))
                .with_port(ServicePort::udp("tunnel", 51820)),
        );
        h.controller.reconcile(&"web".to_string()).await.unwrap();
        assert_eq!(h.advertised.endpoint(), None);
    }

    #[tokio::test]
    async fn test_tcp_port_is_not_advertised() {
        let h = harness();
        let mut service = gateway_service(Some(Ipv4Addr::new(172, 18, 0, 100)), 51820);
        service.ports[0].protocol = "TCP".to_string();
        h.store.put_service(service);
        h.controller.reconcile(&key()).await.unwrap();
        assert_eq!(h.advertised.endpoint(), None);
    }

    #[tokio::test]
    async fn test_removed_service_clears_endpoint() {
        let h = harness();
        h.store
            .put_service(gateway_service(Some(Ipv4Addr::new(172, 18, 0, 100)), 51820));
        h.controller.reconcile(&key()).await.unwrap();

        // an unrelated service going away changes nothing
        h.controller.reconcile(&"web".to_string()).await.unwrap();
        assert!(h.advertised.endpoint().is_some());

        h.store.remove_service("peerlink-gateway");
        h.controller.reconcile(&key()).await.unwrap();
        assert_eq!(h.advertised.endpoint(), None);
        assert_eq!(h.advertised.service(), None);
    }
}

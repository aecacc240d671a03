//! Pod controller.
//!
//! In gateway mode it keeps one symmetric-routing host route per local pod,
//! pointing at the overlay IP of the node the pod runs on, so replies to
//! remote clusters leave through the gateway they came in by. In node mode
//! it follows the active gateway replica and keeps the gateway table's
//! default route pointed at it.

use async_trait::async_trait;
use parking_lot::RwLock;
use peerlink_common::{PeerlinkError, PeerlinkResult, Reconciler, Requeue, WorkQueue};
use peerlink_overlay::{OverlayManager, VxlanPeers};
use peerlink_routing::{RoutingManager, SymmetricChange};
use peerlink_types::ClusterIdentity;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{LabelsConfig, NodeMode};
use crate::gate::LocalNetwork;
use crate::store::{ConnectionStore, PodRecord, TopologyStore};

/// The gateway replica remote-cluster traffic is currently steered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReplica {
    pub pod: String,
    pub node: String,
    pub overlay_ip: Ipv4Addr,
}

#[derive(Debug, Default)]
pub struct ActiveGateway {
    current: RwLock<Option<GatewayReplica>>,
}

impl ActiveGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<GatewayReplica> {
        self.current.read().clone()
    }

    pub fn overlay_ip(&self) -> Option<Ipv4Addr> {
        self.current.read().as_ref().map(|g| g.overlay_ip)
    }

    /// Returns true if the replica changed.
    pub fn set(&self, replica: GatewayReplica) -> bool {
        let mut current = self.current.write();
        if current.as_ref() == Some(&replica) {
            return false;
        }
        *current = Some(replica);
        true
    }

    /// Clears the active replica if it is `pod`. Returns true if cleared.
    pub fn clear_if(&self, pod: &str) -> bool {
        let mut current = self.current.write();
        if current.as_ref().map(|g| g.pod.as_str()) == Some(pod) {
            *current = None;
            return true;
        }
        false
    }
}

pub struct PodController {
    store: Arc<dyn TopologyStore>,
    peers: Arc<VxlanPeers>,
    overlay: Arc<OverlayManager>,
    routing: Arc<RoutingManager>,
    mode: NodeMode,
    local_node: String,
    local_network: LocalNetwork,
    labels: LabelsConfig,
    active: Arc<ActiveGateway>,

    /// pod name -> IP its symmetric route was installed for
    routed: Mutex<BTreeMap<String, Ipv4Addr>>,

    /// Connections to revisit when the active gateway changes.
    connections: Option<(Arc<dyn ConnectionStore>, Arc<WorkQueue<ClusterIdentity>>)>,
}

impl PodController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TopologyStore>,
        peers: Arc<VxlanPeers>,
        overlay: Arc<OverlayManager>,
        routing: Arc<RoutingManager>,
        mode: NodeMode,
        local_node: impl Into<String>,
        local_network: LocalNetwork,
        labels: LabelsConfig,
        active: Arc<ActiveGateway>,
    ) -> Self {
        Self {
            store,
            peers,
            overlay,
            routing,
            mode,
            local_node: local_node.into(),
            local_network,
            labels,
            active,
            routed: Mutex::new(BTreeMap::new()),
            connections: None,
        }
    }

    pub fn with_connection_queue(
        mut self,
        store: Arc<dyn ConnectionStore>,
        queue: Arc<WorkQueue<ClusterIdentity>>,
    ) -> Self {
        self.connections = Some((store, queue));
        self
    }

    fn is_gateway(&self, pod: &PodRecord) -> bool {
        pod.has_label(&self.labels.gateway_key, &self.labels.gateway_value)
    }

    async fn node_overlay_ip(&self, node: &str) -> PeerlinkResult<Ipv4Addr> {
        self.peers
            .get(node)
            .await
            .map(|host| self.overlay.overlay_ip_of(host))
            .ok_or_else(|| {
                PeerlinkError::not_ready(format!("node {}", node), "host IP not known yet")
            })
    }

    async fn sync_symmetric(&self, key: &str, pod: Option<PodRecord>) -> PeerlinkResult<Requeue> {
        let pod = pod.filter(|p| self.local_network.pod_cidr.contains(p.ip));

        let mut routed = self.routed.lock().await;
        let previous = routed.get(key).copied();
        if let Some(prev_ip) = previous.filter(|ip| pod.as_ref().map(|p| p.ip) != Some(*ip)) {
            if self.routing.remove_symmetric_route(prev_ip).await? {
                debug!(pod = key, ip = %prev_ip, "Symmetric route withdrawn");
            }
            routed.remove(key);
        }

        let Some(pod) = pod else {
            return Ok(Requeue::Done);
        };

        let via = if pod.node == self.local_node {
            None
        } else {
            Some(self.node_overlay_ip(&pod.node).await?)
        };
        match self.routing.sync_symmetric_route(pod.ip, via).await? {
            SymmetricChange::Unchanged => {}
            change => info!(pod = key, ip = %pod.ip, ?via, ?change, "Symmetric route synced"),
        }
        routed.insert(key.to_string(), pod.ip);
        Ok(Requeue::Done)
    }

    async fn sync_gateway(&self, key: &str, pod: Option<PodRecord>) -> PeerlinkResult<Requeue> {
        let changed = match pod.filter(|p| self.is_gateway(p)) {
            Some(pod) if pod.node == self.local_node => {
                warn!(pod = key, "Gateway replica runs on this node, not steering to it");
                false
            }
            Some(pod) => {
                let overlay_ip = self.node_overlay_ip(&pod.node).await?;
                self.routing.ensure_default_route(overlay_ip).await?;
                self.active.set(GatewayReplica {
                    pod: key.to_string(),
                    node: pod.node,
                    overlay_ip,
                })
            }
            None => {
                let cleared = self.active.clear_if(key);
                if cleared && self.routing.remove_default_route().await? {
                    info!(pod = key, "Active gateway gone, default route withdrawn");
                }
                cleared
            }
        };

        if changed {
            if let Some((store, queue)) = &self.connections {
                for descriptor in store.list_connections().await? {
                    queue.add(descriptor.identity().clone());
                }
            }
        }
        Ok(Requeue::Done)
    }
}

#[async_trait]
impl Reconciler for PodController {
    type Key = String;

    fn name(&self) -> &str {
        "pod"
    }

    #[instrument(skip(self), fields(pod = %key))]
    async fn reconcile(&self, key: &String) -> PeerlinkResult<Requeue> {
        let pod = self.store.get_pod(key).await?;
        match self.mode {
            NodeMode::Gateway => self.sync_symmetric(key, pod).await,
            NodeMode::Node => self.sync_gateway(key, pod).await,
        }
    }
}

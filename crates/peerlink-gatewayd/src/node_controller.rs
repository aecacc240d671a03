//! Node controller: node name -> host IP, and the overlay full mesh.

use async_trait::async_trait;
use peerlink_common::{PeerlinkResult, Reconciler, Requeue, WorkQueue};
use peerlink_overlay::{OverlayManager, VxlanPeers};
use peerlink_types::{MacAddress, Neighbor};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::store::{NodeRecord, TopologyStore};

pub struct NodeController {
    store: Arc<dyn TopologyStore>,
    peers: Arc<VxlanPeers>,
    overlay: Arc<OverlayManager>,
    local_node: String,
    mac_annotation: String,
    pods: Option<Arc<WorkQueue<String>>>,
}

impl NodeController {
    pub fn new(
        store: Arc<dyn TopologyStore>,
        peers: Arc<VxlanPeers>,
        overlay: Arc<OverlayManager>,
        local_node: impl Into<String>,
        mac_annotation: impl Into<String>,
    ) -> Self {
        Self {
            store,
            peers,
            overlay,
            local_node: local_node.into(),
            mac_annotation: mac_annotation.into(),
            pods: None,
        }
    }

    /// Queue of the pod controller, told about pods whose node moved.
    pub fn with_pod_queue(mut self, queue: Arc<WorkQueue<String>>) -> Self {
        self.pods = Some(queue);
        self
    }

    /// FDB entry for a node: the annotated MAC if present and valid, else
    /// the one derived from its overlay address.
    fn neighbor_for(&self, node: &NodeRecord) -> Neighbor {
        let derived = self.overlay.neighbor_for(node.ip);
        match node.annotations.get(&self.mac_annotation) {
            Some(value) => match value.parse::<MacAddress>() {
                Ok(mac) => Neighbor::new(mac, node.ip),
                Err(e) => {
                    warn!(node = %node.name, error = %e, "Ignoring malformed overlay MAC annotation");
                    derived
                }
            },
            None => derived,
        }
    }

    async fn requeue_pods_on(&self, node: &str) -> PeerlinkResult<()> {
        let Some(queue) = &self.pods else {
            return Ok(());
        };
        for pod in self.store.list_pods().await? {
            if pod.node == node {
                queue.add(pod.name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for NodeController {
    type Key = String;

    fn name(&self) -> &str {
        "node"
    }

    /// The peer map stays write-locked until the overlay matches it, so the
    /// pod controller never resolves a node whose FDB entry is half updated.
    #[instrument(skip(self), fields(node = %key))]
    async fn reconcile(&self, key: &String) -> PeerlinkResult<Requeue> {
        let Some(node) = self.store.get_node(key).await? else {
            let forgotten = {
                let mut nodes = self.peers.write().await;
                if self.overlay.remove_peer(key).await? {
                    info!("Node {} removed from the overlay", key);
                }
                nodes.remove(key)
            };
            if forgotten.is_some() {
                self.requeue_pods_on(key).await?;
            }
            return Ok(Requeue::Done);
        };

        let previous = {
            let mut nodes = self.peers.write().await;
            if *key != self.local_node {
                let neighbor = self.neighbor_for(&node);
                if self.overlay.add_peer(key, neighbor).await? {
                    info!("Node {} ({}) added to the overlay", key, node.ip);
                }
            }
            nodes.insert(key.clone(), node.ip)
        };
        if previous != Some(node.ip) {
            debug!(ip = %node.ip, ?previous, "Node address changed");
            self.requeue_pods_on(key).await?;
        }
        Ok(Requeue::Done)
    }
}

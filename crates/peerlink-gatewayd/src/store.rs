//! Resource store seam.
//!
//! Controllers read desired state through the traits below and write back
//! status and finalizers under optimistic concurrency: every write names the
//! `resource_version` it was computed from and fails with a
//! [`PeerlinkError::Conflict`] when the stored record has moved on.
//!
//! [`MemoryStore`] is the in-process implementation. It backs the daemon
//! when state is seeded from a JSON file and every test in this crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_common::{PeerlinkError, PeerlinkResult};
use peerlink_types::{
    ClusterIdentity, ConnectionDescriptor, ConnectionSpec, DescriptorStatus, NatMappingSet,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::gate::LocalNetwork;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub name: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            ip,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub name: String,
    pub ip: Ipv4Addr,
    /// Name of the node the pod is scheduled on.
    pub node: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl PodRecord {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr, node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip,
            node: node.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Adds a label (builder pattern).
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).map(String::as_str) == Some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "UDP".to_string()
}

impl ServicePort {
    pub fn udp(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            protocol: default_protocol(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    /// Address remote clusters reach the service at; unset while a load
    /// balancer is still being provisioned.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, ip: Option<Ipv4Addr>) -> Self {
        Self {
            name: name.into(),
            ip,
            ports: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Adds a port (builder pattern).
    pub fn with_port(mut self, port: ServicePort) -> Self {
        self.ports.push(port);
        self
    }

    /// Adds a label (builder pattern).
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).map(String::as_str) == Some(value)
    }

    pub fn port(&self, name: &str) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.name == name)
    }
}

/// Change notification emitted by the store's watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Connection(ClusterIdentity),
    NatMapping(ClusterIdentity),
    Node(String),
    Pod(String),
    Service(String),
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_connection(
        &self,
        id: &ClusterIdentity,
    ) -> PeerlinkResult<Option<ConnectionDescriptor>>;

    async fn list_connections(&self) -> PeerlinkResult<Vec<ConnectionDescriptor>>;

    /// Replaces the status of the descriptor at `resource_version`.
    async fn update_status(
        &self,
        id: &ClusterIdentity,
        resource_version: u64,
        status: DescriptorStatus,
    ) -> PeerlinkResult<ConnectionDescriptor>;

    /// Replaces the finalizer list at `resource_version`.
    ///
    /// Returns `None` when the write drained the finalizers of a descriptor
    /// whose deletion was requested and the store removed it.
    async fn update_finalizers(
        &self,
        id: &ClusterIdentity,
        resource_version: u64,
        finalizers: BTreeSet<String>,
    ) -> PeerlinkResult<Option<ConnectionDescriptor>>;
}

#[async_trait]
pub trait NatMappingStore: Send + Sync {
    async fn get_nat_mapping(&self, id: &ClusterIdentity) -> PeerlinkResult<Option<NatMappingSet>>;

    async fn list_nat_mappings(&self) -> PeerlinkResult<Vec<NatMappingSet>>;
}

#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn get_node(&self, name: &str) -> PeerlinkResult<Option<NodeRecord>>;

    async fn list_nodes(&self) -> PeerlinkResult<Vec<NodeRecord>>;

    async fn get_pod(&self, name: &str) -> PeerlinkResult<Option<PodRecord>>;

    async fn list_pods(&self) -> PeerlinkResult<Vec<PodRecord>>;

    async fn get_service(&self, name: &str) -> PeerlinkResult<Option<ServiceRecord>>;

    async fn list_services(&self) -> PeerlinkResult<Vec<ServiceRecord>>;
}

/// Initial store contents, read from the daemon's `--seed` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    #[serde(default)]
    pub nat_mappings: Vec<NatMappingSet>,
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub pods: Vec<PodRecord>,
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
    #[serde(default)]
    pub local_network: Option<LocalNetwork>,
}

#[derive(Default)]
struct Inner {
    connections: BTreeMap<ClusterIdentity, ConnectionDescriptor>,
    nat_mappings: BTreeMap<ClusterIdentity, NatMappingSet>,
    nodes: BTreeMap<String, NodeRecord>,
    pods: BTreeMap<String, PodRecord>,
    services: BTreeMap<String, ServiceRecord>,
    last_version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn connection_mut(
        &mut self,
        id: &ClusterIdentity,
        resource_version: u64,
    ) -> PeerlinkResult<&mut ConnectionDescriptor> {
        let descriptor = self
            .connections
            .get_mut(id)
            .ok_or_else(|| PeerlinkError::store("update", format!("connection {} not found", id)))?;
        if descriptor.resource_version != resource_version {
            return Err(PeerlinkError::conflict(
                format!("connection {}", id),
                format!(
                    "resource version {} is stale (current {})",
                    resource_version, descriptor.resource_version
                ),
            ));
        }
        Ok(descriptor)
    }
}

/// In-memory resource store with a broadcast watch.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ResourceEvent>,
    pending_conflicts: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            pending_conflicts: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn from_seed(seed: &Seed) -> Self {
        let store = Self::new();
        for spec in &seed.connections {
            store.apply_connection(spec.clone());
        }
        for set in &seed.nat_mappings {
            store.put_nat_mapping(set.clone());
        }
        for node in &seed.nodes {
            store.put_node(node.clone());
        }
        for pod in &seed.pods {
            store.put_pod(pod.clone());
        }
        for service in &seed.services {
            store.put_service(service.clone());
        }
        store
    }

    /// Watch stream of changes. Events sent before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: ResourceEvent) {
        // No receivers is fine: nothing is watching yet.
        let _ = self.events.send(event);
    }

    /// Makes the next `count` conditional writes fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Successful conditional writes (status and finalizers) so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn take_injected_conflict(&self, id: &ClusterIdentity) -> PeerlinkResult<()> {
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PeerlinkError::conflict(
                format!("connection {}", id),
                "the object has been modified",
            ));
        }
        Ok(())
    }

    /// Creates or updates the spec of a descriptor; returns the new version.
    pub fn apply_connection(&self, spec: ConnectionSpec) -> u64 {
        let id = spec.cluster.clone();
        let version = {
            let mut inner = self.inner.lock();
            let version = inner.next_version();
            let descriptor = inner
                .connections
                .entry(id.clone())
                .or_insert_with(|| ConnectionDescriptor::new(spec.clone()));
            descriptor.spec = spec;
            descriptor.resource_version = version;
            version
        };
        self.notify(ResourceEvent::Connection(id));
        version
    }

    /// Marks a descriptor for deletion. Without finalizers it is removed at once.
    pub fn request_deletion(&self, id: &ClusterIdentity) -> bool {
        let found = {
            let mut inner = self.inner.lock();
            let version = inner.next_version();
            let unfinalized = inner
                .connections
                .get(id)
                .map(|descriptor| descriptor.finalizers.is_empty());
            match unfinalized {
                Some(true) => {
                    inner.connections.remove(id);
                    true
                }
                Some(false) => {
                    if let Some(descriptor) = inner.connections.get_mut(id) {
                        descriptor.deletion_requested = true;
                        descriptor.resource_version = version;
                    }
                    true
                }
                None => false,
            }
        };
        if found {
            self.notify(ResourceEvent::Connection(id.clone()));
        }
        found
    }

    pub fn connection(&self, id: &ClusterIdentity) -> Option<ConnectionDescriptor> {
        self.inner.lock().connections.get(id).cloned()
    }

    pub fn put_nat_mapping(&self, set: NatMappingSet) {
        let id = set.cluster.clone();
        self.inner.lock().nat_mappings.insert(id.clone(), set);
        self.notify(ResourceEvent::NatMapping(id));
    }

    pub fn remove_nat_mapping(&self, id: &ClusterIdentity) -> bool {
        let removed = self.inner.lock().nat_mappings.remove(id).is_some();
        if removed {
            self.notify(ResourceEvent::NatMapping(id.clone()));
        }
        removed
    }

    pub fn put_node(&self, node: NodeRecord) {
        let name = node.name.clone();
        self.inner.lock().nodes.insert(name.clone(), node);
        self.notify(ResourceEvent::Node(name));
    }

    pub fn remove_node(&self, name: &str) -> bool {
        let removed = self.inner.lock().nodes.remove(name).is_some();
        if removed {
            self.notify(ResourceEvent::Node(name.to_string()));
        }
        removed
    }

    pub fn put_pod(&self, pod: PodRecord) {
        let name = pod.name.clone();
        self.inner.lock().pods.insert(name.clone(), pod);
        self.notify(ResourceEvent::Pod(name));
    }

    pub fn remove_pod(&self, name: &str) -> bool {
        let removed = self.inner.lock().pods.remove(name).is_some();
        if removed {
            self.notify(ResourceEvent::Pod(name.to_string()));
        }
        removed
    }

    pub fn put_service(&self, service: ServiceRecord) {
        let name = service.name.clone();
        self.inner.lock().services.insert(name.clone(), service);
        self.notify(ResourceEvent::Service(name));
    }

    pub fn remove_service(&self, name: &str) -> bool {
        let removed = self.inner.lock().services.remove(name).is_some();
        if removed {
            self.notify(ResourceEvent::Service(name.to_string()));
        }
        removed
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn get_connection(
        &self,
        id: &ClusterIdentity,
    ) -> PeerlinkResult<Option<ConnectionDescriptor>> {
        Ok(self.connection(id))
    }

    async fn list_connections(&self) -> PeerlinkResult<Vec<ConnectionDescriptor>> {
        Ok(self.inner.lock().connections.values().cloned().collect())
    }

    async fn update_status(
        &self,
        id: &ClusterIdentity,
        resource_version: u64,
        status: DescriptorStatus,
    ) -> PeerlinkResult<ConnectionDescriptor> {
        self.take_injected_conflict(id)?;
        let updated = {
            let mut inner = self.inner.lock();
            let version = inner.next_version();
            let descriptor = inner.connection_mut(id, resource_version)?;
            descriptor.status = status;
            descriptor.resource_version = version;
            descriptor.clone()
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(cluster = %id, phase = %updated.status.phase, "Status updated");
        Ok(updated)
    }

    async fn update_finalizers(
        &self,
        id: &ClusterIdentity,
        resource_version: u64,
        finalizers: BTreeSet<String>,
    ) -> PeerlinkResult<Option<ConnectionDescriptor>> {
        self.take_injected_conflict(id)?;
        let updated = {
            let mut inner = self.inner.lock();
            let version = inner.next_version();
            let descriptor = inner.connection_mut(id, resource_version)?;
            descriptor.finalizers = finalizers;
            descriptor.resource_version = version;
            let drained = descriptor.deletion_requested && descriptor.finalizers.is_empty();
            let snapshot = descriptor.clone();
            if drained {
                inner.connections.remove(id);
                None
            } else {
                Some(snapshot)
            }
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        if updated.is_none() {
            debug!(cluster = %id, "Finalizers drained, descriptor removed");
            self.notify(ResourceEvent::Connection(id.clone()));
        }
        Ok(updated)
    }
}

#[async_trait]
impl NatMappingStore for MemoryStore {
    async fn get_nat_mapping(&self, id: &ClusterIdentity) -> PeerlinkResult<Option<NatMappingSet>> {
        Ok(self.inner.lock().nat_mappings.get(id).cloned())
    }

    async fn list_nat_mappings(&self) -> PeerlinkResult<Vec<NatMappingSet>> {
        Ok(self.inner.lock().nat_mappings.values().cloned().collect())
    }
}

#[async_trait]
impl TopologyStore for MemoryStore {
    async fn get_node(&self, name: &str) -> PeerlinkResult<Option<NodeRecord>> {
        Ok(self.inner.lock().nodes.get(name).cloned())
    }

    async fn list_nodes(&self) -> PeerlinkResult<Vec<NodeRecord>> {
        Ok(self.inner.lock().nodes.values().cloned().collect())
    }

    async fn get_pod(&self, name: &str) -> PeerlinkResult<Option<PodRecord>> {
        Ok(self.inner.lock().pods.get(name).cloned())
    }

    async fn list_pods(&self) -> PeerlinkResult<Vec<PodRecord>> {
        Ok(self.inner.lock().pods.values().cloned().collect())
    }

    async fn get_service(&self, name: &str) -> PeerlinkResult<Option<ServiceRecord>> {
        Ok(self.inner.lock().services.get(name).cloned())
    }

    async fn list_services(&self) -> PeerlinkResult<Vec<ServiceRecord>> {
        Ok(self.inner.lock().services.values().cloned().collect())
    }
}

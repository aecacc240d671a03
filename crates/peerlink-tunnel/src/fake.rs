//! Scriptable [`TunnelDriver`] for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_common::{PeerlinkError, PeerlinkResult};
use peerlink_types::{ClusterIdentity, ConnectionDescriptor, ConnectionState, ConnectionStatus};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::TunnelDriver;

pub struct FakeTunnelDriver {
    backend: String,
    interface: String,
    state: Mutex<ConnectionState>,
    peers: Mutex<BTreeSet<ClusterIdentity>>,
    fail_connect: AtomicBool,
    fail_disconnect: AtomicBool,
    inits: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeTunnelDriver {
    /// A driver whose connections come up immediately.
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            interface: format!("{}0", backend),
            state: Mutex::new(ConnectionState::Connected),
            peers: Mutex::new(BTreeSet::new()),
            fail_connect: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            inits: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// State reported by subsequent connects.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn has_peer(&self, cluster: &ClusterIdentity) -> bool {
        self.peers.lock().contains(cluster)
    }
}

#[async_trait]
impl TunnelDriver for FakeTunnelDriver {
    fn backend(&self) -> &str {
        &self.backend
    }

    fn interface_name(&self) -> &str {
        &self.interface
    }

    async fn init(&self) -> PeerlinkResult<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect_to_endpoint(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> PeerlinkResult<ConnectionStatus> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(PeerlinkError::tunnel(&self.backend, "injected connect failure"));
        }
        self.peers.lock().insert(descriptor.identity().clone());
        let state = *self.state.lock();
        let mut status = ConnectionStatus::new(state, format!("fake {:?}", state));
        if let Some(ip) = descriptor.spec.endpoint_ip() {
            status = status.with_peer_value("endpointIP", ip.to_string());
        }
        Ok(status)
    }

    async fn disconnect_from_endpoint(&self, descriptor: &ConnectionDescriptor) -> PeerlinkResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(PeerlinkError::tunnel(&self.backend, "injected disconnect failure"));
        }
        self.peers.lock().remove(descriptor.identity());
        Ok(())
    }

    async fn close(&self) -> PeerlinkResult<()> {
        self.peers.lock().clear();
        Ok(())
    }
}

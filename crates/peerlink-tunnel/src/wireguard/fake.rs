//! In-memory [`WgControl`] for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use peerlink_common::{PeerlinkError, PeerlinkResult};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::control::{WgControl, WgPeer, WgPeerConfig};

/// Key returned by [`FakeWgControl::genkey`].
pub const FAKE_PRIVATE_KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
/// Public key reported for any private key file.
pub const FAKE_PUBLIC_KEY: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

#[derive(Debug, Default, Clone)]
pub struct FakeWgDevice {
    pub listen_port: u16,
    pub private_key_path: Option<PathBuf>,
    pub peers: BTreeMap<String, WgPeer>,
}

#[derive(Debug, Default)]
pub struct FakeWgControl {
    devices: Mutex<BTreeMap<String, FakeWgDevice>>,
    calls: AtomicUsize,
    mutations: AtomicUsize,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeWgControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call of `op` (the trait method name) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `set_peer` / `remove_peer` calls.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn device(&self, iface: &str) -> Option<FakeWgDevice> {
        self.devices.lock().get(iface).cloned()
    }

    pub fn peer(&self, iface: &str, public_key: &str) -> Option<WgPeer> {
        self.devices
            .lock()
            .get(iface)
            .and_then(|d| d.peers.get(public_key).cloned())
    }

    /// Simulates the remote side completing a handshake at `at`.
    pub fn set_handshake(&self, iface: &str, public_key: &str, at: DateTime<Utc>) {
        if let Some(peer) = self
            .devices
            .lock()
            .get_mut(iface)
            .and_then(|d| d.peers.get_mut(public_key))
        {
            peer.latest_handshake = Some(at);
        }
    }

    fn enter(&self, op: &'static str) -> PeerlinkResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(op) {
            return Err(PeerlinkError::ShellCommandFailed {
                command: op.to_string(),
                exit_code: 1,
                output: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WgControl for FakeWgControl {
    async fn genkey(&self) -> PeerlinkResult<String> {
        self.enter("genkey")?;
        Ok(FAKE_PRIVATE_KEY.to_string())
    }

    async fn public_key(&self, _private_key_path: &Path) -> PeerlinkResult<String> {
        self.enter("public_key")?;
        Ok(FAKE_PUBLIC_KEY.to_string())
    }

    async fn configure_device(
        &self,
        iface: &str,
        private_key_path: &Path,
        listen_port: u16,
    ) -> PeerlinkResult<()> {
        self.enter("configure_device")?;
        let mut devices = self.devices.lock();
        let device = devices.entry(iface.to_string()).or_default();
        device.listen_port = listen_port;
        device.private_key_path = Some(private_key_path.to_path_buf());
        Ok(())
    }

    async fn peers(&self, iface: &str) -> PeerlinkResult<Vec<WgPeer>> {
        self.enter("peers")?;
        Ok(self
            .devices
            .lock()
            .get(iface)
            .map(|d| d.peers.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_peer(&self, iface: &str, peer: &WgPeerConfig) -> PeerlinkResult<()> {
        self.enter("set_peer")?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let mut devices = self.devices.lock();
        let device = devices.entry(iface.to_string()).or_default();
        let handshake = device
            .peers
            .get(&peer.public_key)
            .and_then(|p| p.latest_handshake);
        device.peers.insert(
            peer.public_key.clone(),
            WgPeer {
                public_key: peer.public_key.clone(),
                endpoint: Some(peer.endpoint),
                allowed_ips: peer.allowed_ips.clone(),
                keepalive: peer.keepalive,
                latest_handshake: handshake,
            },
        );
        Ok(())
    }

    /// Like `wg`, removing an unknown peer succeeds.
    async fn remove_peer(&self, iface: &str, public_key: &str) -> PeerlinkResult<()> {
        self.enter("remove_peer")?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        if let Some(device) = self.devices.lock().get_mut(iface) {
            device.peers.remove(public_key);
        }
        Ok(())
    }
}

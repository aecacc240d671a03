//! OverlayManager - VXLAN device, FDB and overlay routes

use peerlink_common::shell::is_benign_race;
use peerlink_common::PeerlinkResult;
use peerlink_netlink::{idempotent, NetConfig};
use peerlink_types::{Ipv4Cidr, MacAddress, Neighbor, RouteEntry, TableId};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::addressing::overlay_mac;
use crate::device::{DeviceOutcome, OverlayDeviceConfig};

/// Manages this node's overlay device and its view of the other gateway
/// replicas.
///
/// Each peer owns two FDB entries towards its VTEP: its overlay MAC for
/// unicast, and the all-zero MAC so that broadcast and ARP reach it. Learning
/// is disabled on the device, so these entries are the only forwarding state.
///
/// Peer updates hold the peer map for their whole diff-and-apply, so two
/// peers sharing an entry never race each other's deletes.
pub struct OverlayManager {
    net: Arc<dyn NetConfig>,
    config: OverlayDeviceConfig,

    /// peer key -> neighbor currently installed for it
    peers: Mutex<BTreeMap<String, Neighbor>>,
}

fn used_by_other(peers: &BTreeMap<String, Neighbor>, key: &str, entry: &Neighbor) -> bool {
    peers
        .iter()
        .any(|(k, n)| k != key && fdb_entries(*n).contains(entry))
}

fn fdb_entries(neighbor: Neighbor) -> [Neighbor; 2] {
    [neighbor, Neighbor::new(MacAddress::ZERO, neighbor.ip)]
}

impl OverlayManager {
    pub fn new(net: Arc<dyn NetConfig>, config: OverlayDeviceConfig) -> Self {
        Self {
            net,
            config,
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &OverlayDeviceConfig {
        &self.config
    }

    pub fn device_name(&self) -> &str {
        &self.config.name
    }

    pub fn local_overlay_ip(&self) -> Ipv4Addr {
        self.config.overlay_ip()
    }

    /// Overlay IP of the node whose host IP is `host`.
    pub fn overlay_ip_of(&self, host: Ipv4Addr) -> Ipv4Addr {
        crate::addressing::overlay_ip(self.config.prefix, host)
    }

    /// FDB neighbor for the gateway replica running on host `host`.
    pub fn neighbor_for(&self, host: Ipv4Addr) -> Neighbor {
        Neighbor::new(overlay_mac(self.config.prefix, host), host)
    }

    /// Creates the overlay device, or reuses a matching one.
    ///
    /// A same-named device with a different VNI, source address or port is
    /// deleted and recreated. The MTU, overlay address and up state are then
    /// asserted whichever path was taken.
    #[instrument(skip(self), fields(device = %self.config.name))]
    pub async fn ensure_device(&self) -> PeerlinkResult<DeviceOutcome> {
        let spec = self.config.vxlan_spec();

        let outcome = match self.net.link_by_name(&spec.name).await? {
            Some(link) if spec.matches(&link) => {
                if link.mtu != spec.mtu {
                    self.net.set_mtu(&spec.name, spec.mtu).await?;
                }
                DeviceOutcome::Reused
            }
            Some(link) => {
                warn!(
                    "Overlay device {} has mismatched attributes {:?}, recreating",
                    spec.name, link.vxlan
                );
                self.net.delete_link(&spec.name).await?;
                self.net.add_vxlan_link(&spec).await?;
                DeviceOutcome::Replaced
            }
            None => {
                self.net.add_vxlan_link(&spec).await?;
                DeviceOutcome::Created
            }
        };

        self.ensure_address().await?;
        self.net.set_link_up(&spec.name).await?;

        info!(
            "Overlay device {} ready ({:?}, vni {}, address {})",
            spec.name,
            outcome,
            spec.vni,
            self.config.address()
        );
        Ok(outcome)
    }

    async fn ensure_address(&self) -> PeerlinkResult<()> {
        let want = self.config.address();
        let current = self.net.list_addrs(&self.config.name).await?;

        for stale in current.iter().filter(|a| **a != want) {
            debug!("Removing stale overlay address {}", stale);
            self.net.del_addr(&self.config.name, *stale).await?;
        }
        if !current.contains(&want) {
            match self.net.add_addr(&self.config.name, want).await {
                Ok(()) => {}
                Err(e) if is_benign_race(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Deletes the overlay device if present.
    pub async fn delete_device(&self) -> PeerlinkResult<bool> {
        let mut peers = self.peers.lock().await;
        if self.net.link_by_name(&self.config.name).await?.is_none() {
            return Ok(false);
        }
        self.net.delete_link(&self.config.name).await?;
        peers.clear();
        info!("Deleted overlay device {}", self.config.name);
        Ok(true)
    }

    /// Adds an FDB entry. Returns false if it was already present.
    #[instrument(skip(self))]
    pub async fn add_fdb(&self, neighbor: &Neighbor) -> PeerlinkResult<bool> {
        idempotent::add_fdb(self.net.as_ref(), &self.config.name, neighbor).await
    }

    /// Removes an FDB entry. Returns false if it was absent.
    #[instrument(skip(self))]
    pub async fn del_fdb(&self, neighbor: &Neighbor) -> PeerlinkResult<bool> {
        idempotent::del_fdb(self.net.as_ref(), &self.config.name, neighbor).await
    }

    /// Points peer `key` at `neighbor`, replacing whatever it pointed at
    /// before. Returns true if the FDB changed.
    #[instrument(skip(self))]
    pub async fn add_peer(&self, key: &str, neighbor: Neighbor) -> PeerlinkResult<bool> {
        let mut peers = self.peers.lock().await;
        let previous = peers.get(key).copied();
        let mut changed = false;

        if let Some(prev) = previous.filter(|p| *p != neighbor) {
            for entry in fdb_entries(prev) {
                if !used_by_other(&peers, key, &entry) {
                    changed |= self.del_fdb(&entry).await?;
                }
            }
        }
        for entry in fdb_entries(neighbor) {
            changed |= self.add_fdb(&entry).await?;
        }

        peers.insert(key.to_string(), neighbor);
        if changed {
            info!("Overlay peer {} -> {}", key, neighbor);
        }
        Ok(changed)
    }

    /// Removes peer `key`. A peer that was never added is a no-op returning
    /// false without touching the kernel.
    #[instrument(skip(self))]
    pub async fn remove_peer(&self, key: &str) -> PeerlinkResult<bool> {
        let mut peers = self.peers.lock().await;
        let Some(neighbor) = peers.get(key).copied() else {
            debug!("Overlay peer {} not known, nothing to remove", key);
            return Ok(false);
        };

        let mut changed = false;
        for entry in fdb_entries(neighbor) {
            if !used_by_other(&peers, key, &entry) {
                changed |= self.del_fdb(&entry).await?;
            }
        }
        peers.remove(key);
        info!("Removed overlay peer {} ({})", key, neighbor);
        Ok(changed)
    }

    pub async fn peer(&self, key: &str) -> Option<Neighbor> {
        self.peers.lock().await.get(key).copied()
    }

    pub async fn peers(&self) -> BTreeMap<String, Neighbor> {
        self.peers.lock().await.clone()
    }

    /// Routes `subnet` into the overlay towards next hop `via`.
    #[instrument(skip(self))]
    pub async fn add_subnet(
        &self,
        subnet: Ipv4Cidr,
        via: Ipv4Addr,
        table: TableId,
    ) -> PeerlinkResult<bool> {
        let route = RouteEntry::new(subnet, self.config.name.clone(), table)
            .via(via)
            .onlink();
        idempotent::add_route(self.net.as_ref(), &route).await
    }

    #[instrument(skip(self))]
    pub async fn remove_subnet(&self, subnet: Ipv4Cidr, table: TableId) -> PeerlinkResult<bool> {
        let route = RouteEntry::new(subnet, self.config.name.clone(), table);
        idempotent::del_route(self.net.as_ref(), &route).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DEFAULT_VXLAN_PORT;
    use peerlink_netlink::fake::FakeNetConfig;
    use peerlink_netlink::VxlanSpec;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    const DEV: &str = "vxlan.plk";

    fn config() -> OverlayDeviceConfig {
        OverlayDeviceConfig {
            name: DEV.to_string(),
            vni: 18,
            port: DEFAULT_VXLAN_PORT,
            mtu: 1450,
            prefix: "240.0.0.0/8".parse().unwrap(),
            host_ip: Ipv4Addr::new(10, 0, 0, 2),
            parent: None,
        }
    }

    async fn manager() -> (Arc<FakeNetConfig>, OverlayManager) {
        let fake = Arc::new(FakeNetConfig::new());
        let mgr = OverlayManager::new(fake.clone(), config());
        mgr.ensure_device().await.unwrap();
        (fake, mgr)
    }

    #[tokio::test]
    async fn test_device_created_then_reused() {
        let (fake, mgr) = manager().await;
        let link = fake.link(DEV).unwrap();
        assert!(link.up);
        assert_eq!(link.mtu, 1450);
        assert_eq!(
            fake.addrs(DEV).into_iter().collect::<Vec<_>>(),
            vec![config().address()]
        );
        let index = link.index;

        assert_eq!(mgr.ensure_device().await.unwrap(), DeviceOutcome::Reused);
        assert_eq!(fake.link(DEV).unwrap().index, index);
    }

    #[tokio::test]
    async fn test_mismatched_device_is_replaced() {
        let fake = Arc::new(FakeNetConfig::new());
        let stale = VxlanSpec {
            vni: 99,
            ..config().vxlan_spec()
        };
        fake.add_vxlan_link(&stale).await.unwrap();
        let before = fake.link(DEV).unwrap().index;

        let mgr = OverlayManager::new(fake.clone(), config());
        assert_eq!(mgr.ensure_device().await.unwrap(), DeviceOutcome::Replaced);
        let link = fake.link(DEV).unwrap();
        assert_ne!(link.index, before);
        assert_eq!(link.vxlan.unwrap().vni, 18);
    }

    #[tokio::test]
    async fn test_remove_never_added_peer() {
        let (fake, mgr) = manager().await;
        let calls = fake.call_count();
        assert!(!mgr.remove_peer("gateway-0").await.unwrap());
        assert_eq!(fake.call_count(), calls);
    }

    #[tokio::test]
    async fn test_peer_moves_to_new_replica() {
        let (fake, mgr) = manager().await;
        let first = mgr.neighbor_for(Ipv4Addr::new(10, 0, 0, 5));
        let second = mgr.neighbor_for(Ipv4Addr::new(10, 0, 0, 6));

        assert!(mgr.add_peer("gateway", first).await.unwrap());
        assert!(!mgr.add_peer("gateway", first).await.unwrap());
        assert!(mgr.add_peer("gateway", second).await.unwrap());

        let expected: BTreeSet<Neighbor> = fdb_entries(second).into_iter().collect();
        assert_eq!(fake.fdb(DEV), expected);

        assert!(mgr.remove_peer("gateway").await.unwrap());
        assert!(fake.fdb(DEV).is_empty());
        assert_eq!(mgr.peer("gateway").await, None);
    }

    #[tokio::test]
    async fn test_peer_removal_leaves_other_peers() {
        let (fake, mgr) = manager().await;
        let a = mgr.neighbor_for(Ipv4Addr::new(10, 0, 0, 5));
        let b = mgr.neighbor_for(Ipv4Addr::new(10, 0, 0, 6));
        mgr.add_peer("node-a", a).await.unwrap();
        mgr.add_peer("node-b", b).await.unwrap();
        let b_entries: BTreeSet<Neighbor> = fdb_entries(b).into_iter().collect();

        mgr.remove_peer("node-a").await.unwrap();
        assert_eq!(fake.fdb(DEV), b_entries);
    }

    #[tokio::test]
    async fn test_concurrent_peers_sharing_a_vtep() {
        let fake = Arc::new(FakeNetConfig::new().interleaved());
        let mgr = OverlayManager::new(fake.clone(), config());
        mgr.ensure_device().await.unwrap();
        let shared = mgr.neighbor_for(Ipv4Addr::new(10, 0, 0, 5));
        mgr.add_peer("node-a", shared).await.unwrap();

        // node-b takes over node-a's VTEP while node-a leaves
        let (removed, added) =
            tokio::join!(mgr.remove_peer("node-a"), mgr.add_peer("node-b", shared));
        removed.unwrap();
        added.unwrap();

        let expected: BTreeSet<Neighbor> = fdb_entries(shared).into_iter().collect();
        assert_eq!(fake.fdb(DEV), expected);
        assert_eq!(
            mgr.peers().await.into_iter().collect::<Vec<_>>(),
            vec![("node-b".to_string(), shared)]
        );
    }

    #[tokio::test]
    async fn test_fdb_ops_are_idempotent() {
        let (_fake, mgr) = manager().await;
        let n = mgr.neighbor_for(Ipv4Addr::new(10, 0, 0, 9));
        assert!(mgr.add_fdb(&n).await.unwrap());
        assert!(!mgr.add_fdb(&n).await.unwrap());
        assert!(mgr.del_fdb(&n).await.unwrap());
        assert!(!mgr.del_fdb(&n).await.unwrap());
    }

    #[tokio::test]
    async fn test_subnet_routes() {
        let (fake, mgr) = manager().await;
        let subnet: Ipv4Cidr = "10.50.0.0/16".parse().unwrap();
        let via = mgr.overlay_ip_of(Ipv4Addr::new(10, 0, 0, 5));

        assert!(mgr.add_subnet(subnet, via, TableId::MAIN).await.unwrap());
        assert!(!mgr.add_subnet(subnet, via, TableId::MAIN).await.unwrap());
        assert_eq!(fake.routes(TableId::MAIN)[0].gateway, Some(via));
        assert!(mgr.remove_subnet(subnet, TableId::MAIN).await.unwrap());
        assert!(!mgr.remove_subnet(subnet, TableId::MAIN).await.unwrap());
    }
}

//! Node-name to node-IP map shared between controllers.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tokio::sync::{RwLock, RwLockWriteGuard};

/// Known nodes and their host IPs.
///
/// Route computation reads this concurrently. A node update takes
/// [`VxlanPeers::write`] and keeps it until the overlay agrees with the map,
/// so readers see either the old node or the new one.
#[derive(Debug, Default)]
pub struct VxlanPeers {
    nodes: RwLock<BTreeMap<String, Ipv4Addr>>,
}

impl VxlanPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access for a multi-step update.
    pub async fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Ipv4Addr>> {
        self.nodes.write().await
    }

    /// Records `node` at `ip` and returns the previous IP, if any.
    pub async fn upsert(&self, node: &str, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        self.nodes.write().await.insert(node.to_string(), ip)
    }

    pub async fn remove(&self, node: &str) -> Option<Ipv4Addr> {
        self.nodes.write().await.remove(node)
    }

    pub async fn get(&self, node: &str) -> Option<Ipv4Addr> {
        self.nodes.read().await.get(node).copied()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Ipv4Addr> {
        self.nodes.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_upsert_returns_previous() {
        let peers = VxlanPeers::new();
        assert_eq!(peers.upsert("worker-1", Ipv4Addr::new(10, 0, 0, 5)).await, None);
        assert_eq!(
            peers.upsert("worker-1", Ipv4Addr::new(10, 0, 0, 6)).await,
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
        assert_eq!(peers.get("worker-1").await, Some(Ipv4Addr::new(10, 0, 0, 6)));
        assert_eq!(peers.remove("worker-1").await, Some(Ipv4Addr::new(10, 0, 0, 6)));
        assert!(peers.is_empty().await);
    }

    #[tokio::test]
    async fn test_reader_waits_for_held_update() {
        let peers = VxlanPeers::new();
        peers.upsert("worker-1", Ipv4Addr::new(10, 0, 0, 5)).await;

        let writer = async {
            let mut nodes = peers.write().await;
            nodes.remove("worker-1");
            tokio::time::sleep(Duration::from_millis(10)).await;
            nodes.insert("worker-1".to_string(), Ipv4Addr::new(10, 0, 0, 6));
        };
        let reader = async {
            tokio::task::yield_now().await;
            peers.get("worker-1").await
        };
        let ((), seen) = tokio::join!(writer, reader);
        assert_eq!(seen, Some(Ipv4Addr::new(10, 0, 0, 6)));
    }
}

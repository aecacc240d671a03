//! NAT Mapping Controller.
//!
//! Turns each cluster's mapping set into DNAT rules in that cluster's
//! `PLK-PRRT-EXT-CLS-<T>` chain, but only once the cluster's tunnel is
//! `Ready`: until then the reconcile fails with a retryable
//! [`PeerlinkError::NotReady`] and the key is retried with backoff.

use async_trait::async_trait;
use peerlink_common::{PeerlinkError, PeerlinkResult, Reconciler, Requeue};
use peerlink_netfilter::RuleEngine;
use peerlink_types::ClusterIdentity;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::store::{ConnectionStore, NatMappingStore};

pub struct NatMappingController {
    mappings: Arc<dyn NatMappingStore>,
    connections: Arc<dyn ConnectionStore>,
    rules: Arc<RuleEngine>,
}

impl NatMappingController {
    pub fn new(
        mappings: Arc<dyn NatMappingStore>,
        connections: Arc<dyn ConnectionStore>,
        rules: Arc<RuleEngine>,
    ) -> Self {
        Self {
            mappings,
            connections,
            rules,
        }
    }

    async fn ensure_tunnel_ready(&self, id: &ClusterIdentity) -> PeerlinkResult<()> {
        let reason = match self.connections.get_connection(id).await? {
            None => "no connection descriptor".to_string(),
            Some(d) if d.deletion_requested => "connection is being deleted".to_string(),
            Some(d) if !d.is_ready() => format!("phase is {}", d.status.phase),
            Some(_) => return Ok(()),
        };
        Err(PeerlinkError::not_ready(format!("tunnel to cluster {}", id), reason))
    }
}

#[async_trait]
impl Reconciler for NatMappingController {
    type Key = ClusterIdentity;

    fn name(&self) -> &str {
        "natmapping"
    }

    #[instrument(skip(self), fields(cluster = %key))]
    async fn reconcile(&self, key: &ClusterIdentity) -> PeerlinkResult<Requeue> {
        let Some(set) = self.mappings.get_nat_mapping(key).await? else {
            let stats = self.rules.clear_nat_mapping_rules(key).await?;
            if stats.removed > 0 {
                info!(removed = stats.removed, "NAT mappings cleared");
            }
            return Ok(Requeue::Done);
        };

        self.ensure_tunnel_ready(key).await?;

        let stats = self.rules.ensure_nat_mapping_rules(&set).await?;
        if stats.is_noop() {
            debug!(mappings = set.mappings.len(), "NAT mappings already in place");
        } else {
            info!(
                mappings = set.mappings.len(),
                added = stats.added,
                removed = stats.removed,
                "NAT mappings converged"
            );
        }
        Ok(Requeue::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::spec;
    use crate::store::MemoryStore;
    use peerlink_netfilter::fake::FakePacketFilter;
    use peerlink_netfilter::Table;
    use peerlink_types::{DescriptorStatus, NatMappingSet, Phase};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn east() -> ClusterIdentity {
        ClusterIdentity::new("east").unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<FakePacketFilter>, NatMappingController) {
        let store = Arc::new(MemoryStore::new());
        let filter = Arc::new(FakePacketFilter::new());
        let rules = Arc::new(RuleEngine::new(filter.clone()));
        rules.init().await.unwrap();
        let controller = NatMappingController::new(store.clone(), store.clone(), rules);
        (store, filter, controller)
    }

    async fn mark_ready(store: &MemoryStore, id: &ClusterIdentity) {
        let version = store.connection(id).unwrap().resource_version;
        let status = DescriptorStatus {
            phase: Phase::Ready,
            ..Default::default()
        };
        store.update_status(id, version, status).await.unwrap();
    }

    fn mapping() -> NatMappingSet {
        NatMappingSet::new(east())
            .with_mapping(Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(10, 0, 2, 4))
    }

    #[tokio::test]
    async fn test_not_ready_until_tunnel_ready() {
        let (store, filter, controller) = setup().await;
        store.apply_connection(spec("east"));
        store.put_nat_mapping(mapping());

        let err = controller.reconcile(&east()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("tunnel to cluster east not ready"));
        assert!(!filter.has_chain(Table::Nat, "PLK-PRRT-EXT-CLS-EAST"));

        mark_ready(&store, &east()).await;
        controller.reconcile(&east()).await.unwrap();
        let rules = filter.rules(Table::Nat, "PLK-PRRT-EXT-CLS-EAST");
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].as_str(),
            "-d 10.0.2.4/32 -j DNAT --to-destination 10.0.1.2"
        );
    }

    #[tokio::test]
    async fn test_missing_descriptor_is_not_ready() {
        let (store, _, controller) = setup().await;
        store.put_nat_mapping(mapping());
        let err = controller.reconcile(&east()).await.unwrap_err();
        assert!(err.to_string().contains("no connection descriptor"));
    }

    #[tokio::test]
    async fn test_deleted_set_clears_chain() {
        let (store, filter, controller) = setup().await;
        store.apply_connection(spec("east"));
        mark_ready(&store, &east()).await;
        store.put_nat_mapping(mapping());
        controller.reconcile(&east()).await.unwrap();

        assert!(store.remove_nat_mapping(&east()));
        controller.reconcile(&east()).await.unwrap();
        assert!(filter.rules(Table::Nat, "PLK-PRRT-EXT-CLS-EAST").is_empty());
    }

    #[tokio::test]
    async fn test_deleted_set_without_chain_is_noop() {
        let (_, filter, controller) = setup().await;
        assert_eq!(controller.reconcile(&east()).await.unwrap(), Requeue::Done);
        assert!(!filter.has_chain(Table::Nat, "PLK-PRRT-EXT-CLS-EAST"));
    }
}

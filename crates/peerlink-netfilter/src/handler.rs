//! Diff-and-converge rule engine.
//!
//! For a chain and a desired rule list, [`RuleEngine`] lists what the
//! kernel holds, deletes every owned rule that is not desired (and every
//! duplicate of one that is), then appends the desired rules that are
//! missing. Ownership matters for top-level chains, where only the jumps
//! into one cluster's chains are touched.

use peerlink_common::shell::is_benign_race;
use peerlink_common::PeerlinkResult;
use peerlink_types::{ClusterIdentity, ConnectionSpec, NatMappingSet};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::chains::{self, is_cluster_chain, ClusterChainKind, ClusterChains, TopLevelChain};
use crate::filter::PacketFilter;
use crate::rule::{RuleSpec, Table};
use crate::rules::{cluster_rules, nat_mapping_rules, Baseline};

/// Rules added and removed by one convergence pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub added: usize,
    pub removed: usize,
}

impl SyncStats {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }

    fn merge(&mut self, other: SyncStats) {
        self.added += other.added;
        self.removed += other.removed;
    }
}

pub struct RuleEngine {
    filter: Arc<dyn PacketFilter>,
}

impl RuleEngine {
    pub fn new(filter: Arc<dyn PacketFilter>) -> Self {
        Self { filter }
    }

    /// Creates the top-level chains and hooks each into its built-in chain.
    #[instrument(skip(self))]
    pub async fn init(&self) -> PeerlinkResult<()> {
        for top in chains::TOP_LEVEL {
            if self.filter.ensure_chain(top.table, top.name).await? {
                info!(table = %top.table, chain = top.name, "Created top-level chain");
            }
            self.ensure_hook(&top).await?;
        }
        Ok(())
    }

    /// Keeps exactly one unconditional jump into `top`, at position one of
    /// its built-in chain.
    async fn ensure_hook(&self, top: &TopLevelChain) -> PeerlinkResult<()> {
        let jump = RuleSpec::new(format!("-j {}", top.name));
        let rules = self.filter.list_rules(top.table, top.hook).await?;
        let positions: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| **rule == jump)
            .map(|(index, _)| index)
            .collect();
        if positions == [0] {
            return Ok(());
        }
        for _ in &positions {
            self.delete_rule(top.table, top.hook, &jump).await?;
        }
        self.filter.insert(top.table, top.hook, 1, &jump).await?;
        info!(
            chain = top.hook,
            target = top.name,
            replaced = positions.len(),
            "Hooked top-level chain"
        );
        Ok(())
    }

    async fn delete_rule(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<()> {
        match self.filter.delete(table, chain, rule).await {
            Err(e) if is_benign_race(&e) => {
                debug!(chain, rule = %rule, "Rule already gone");
                Ok(())
            }
            other => other,
        }
    }

    /// Converges the rules of `chain` selected by `owned` to `desired`.
    async fn converge(
        &self,
        table: Table,
        chain: &str,
        desired: &[RuleSpec],
        owned: impl Fn(&RuleSpec) -> bool + Send + Sync,
    ) -> PeerlinkResult<SyncStats> {
        let existing = self.filter.list_rules(table, chain).await?;
        let mut stats = SyncStats::default();

        let mut seen = HashSet::new();
        for rule in existing.iter().filter(|rule| owned(*rule)) {
            let duplicate = !seen.insert(rule);
            if duplicate || !desired.contains(rule) {
                if duplicate {
                    warn!(chain, rule = %rule, "Removing duplicate rule");
                }
                self.delete_rule(table, chain, rule).await?;
                stats.removed += 1;
            }
        }

        for rule in desired {
            if !existing.contains(rule) && self.filter.append_unique(table, chain, rule).await? {
                stats.added += 1;
            }
        }

        if !stats.is_noop() {
            debug!(
                table = %table,
                chain,
                added = stats.added,
                removed = stats.removed,
                "Chain converged"
            );
        }
        Ok(stats)
    }

    /// Creates every per-cluster chain of `cluster` that is missing.
    #[instrument(skip(self), fields(cluster = %cluster))]
    pub async fn ensure_chains_per_cluster(&self, cluster: &ClusterIdentity) -> PeerlinkResult<()> {
        for (_, chain) in ClusterChains::new(cluster).all() {
            if self.filter.ensure_chain(chain.table, &chain.name).await? {
                debug!(chain = %chain.name, "Created per-cluster chain");
            }
        }
        Ok(())
    }

    /// Converges the per-cluster chains of `spec.cluster` and their
    /// dispatch rules to the rules derived from `spec`.
    #[instrument(skip(self, spec), fields(cluster = %spec.cluster))]
    pub async fn ensure_rules_per_cluster(&self, spec: &ConnectionSpec) -> PeerlinkResult<SyncStats> {
        self.ensure_chains_per_cluster(&spec.cluster).await?;
        let names = ClusterChains::new(&spec.cluster);
        let desired = cluster_rules(spec);
        let mut stats = SyncStats::default();

        for (kind, rules) in &desired.chains {
            let chain = names.get(*kind);
            stats.merge(self.converge(chain.table, &chain.name, rules, |_| true).await?);
        }

        for top in chains::TOP_LEVEL {
            let owned = |rule: &RuleSpec| rule.jump_target().map_or(false, |t| names.owns(t));
            stats.merge(
                self.converge(top.table, top.name, desired.dispatch_for(&top), owned)
                    .await?,
            );
        }

        if !stats.is_noop() {
            info!(added = stats.added, removed = stats.removed, "Cluster rules updated");
        }
        Ok(stats)
    }

    /// Removes the dispatch rules of `cluster`, then its chains.
    #[instrument(skip(self), fields(cluster = %cluster))]
    pub async fn remove_per_cluster(&self, cluster: &ClusterIdentity) -> PeerlinkResult<()> {
        let names = ClusterChains::new(cluster);
        for top in chains::TOP_LEVEL {
            if !self.filter.chain_exists(top.table, top.name).await? {
                continue;
            }
            let owned = |rule: &RuleSpec| rule.jump_target().map_or(false, |t| names.owns(t));
            self.converge(top.table, top.name, &[], owned).await?;
        }
        for (_, chain) in names.all() {
            if self
                .filter
                .delete_chain_if_exists(chain.table, &chain.name)
                .await?
            {
                debug!(chain = %chain.name, "Deleted per-cluster chain");
            }
        }
        info!("Cluster rules removed");
        Ok(())
    }

    /// Converges the NAT mapping chain of `set.cluster` to one DNAT rule per
    /// mapping. Other clusters' chains are never read or written.
    #[instrument(skip(self, set), fields(cluster = %set.cluster, mappings = set.mappings.len()))]
    pub async fn ensure_nat_mapping_rules(&self, set: &NatMappingSet) -> PeerlinkResult<SyncStats> {
        let chain = ClusterChains::new(&set.cluster).get(ClusterChainKind::PreRoutingExt);
        self.filter.ensure_chain(chain.table, &chain.name).await?;
        self.converge(chain.table, &chain.name, &nat_mapping_rules(set), |_| true)
            .await
    }

    /// Empties the NAT mapping chain of `cluster`, if it exists.
    #[instrument(skip(self), fields(cluster = %cluster))]
    pub async fn clear_nat_mapping_rules(&self, cluster: &ClusterIdentity) -> PeerlinkResult<SyncStats> {
        let chain = ClusterChains::new(cluster).get(ClusterChainKind::PreRoutingExt);
        if !self.filter.chain_exists(chain.table, &chain.name).await? {
            return Ok(SyncStats::default());
        }
        self.converge(chain.table, &chain.name, &[], |_| true).await
    }

    /// Asserts the baseline accept rules. Returns how many were missing.
    pub async fn ensure_baseline(&self, baseline: &Baseline) -> PeerlinkResult<usize> {
        let mut added = 0;
        for (top, rule) in baseline.rules() {
            if self.filter.append_unique(top.table, top.name, &rule).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn remove_baseline(&self, baseline: &Baseline) -> PeerlinkResult<()> {
        for (top, rule) in baseline.rules() {
            if self.filter.chain_exists(top.table, top.name).await? {
                self.filter
                    .delete_if_exists(top.table, top.name, &rule)
                    .await?;
            }
        }
        Ok(())
    }

    /// Removes the chains and dispatch rules of every cluster found in the
    /// kernel.
    pub async fn remove_all_clusters(&self) -> PeerlinkResult<()> {
        for top in chains::TOP_LEVEL {
            if !self.filter.chain_exists(top.table, top.name).await? {
                continue;
            }
            let owned = |rule: &RuleSpec| rule.jump_target().map_or(false, is_cluster_chain);
            self.converge(top.table, top.name, &[], owned).await?;
        }
        for table in [Table::Filter, Table::Nat] {
            for chain in self.filter.list_chains(table).await? {
                if is_cluster_chain(&chain) {
                    self.filter.delete_chain_if_exists(table, &chain).await?;
                    debug!(chain = %chain, "Deleted per-cluster chain");
                }
            }
        }
        Ok(())
    }

    /// Final teardown at shutdown. Top-level chains that still hold rules
    /// not owned by the fabric are left in place, hooked.
    #[instrument(skip(self, baseline))]
    pub async fn terminate(&self, baseline: &Baseline) -> PeerlinkResult<()> {
        self.remove_baseline(baseline).await?;
        self.remove_all_clusters().await?;

        for top in chains::TOP_LEVEL {
            if !self.filter.chain_exists(top.table, top.name).await? {
                continue;
            }
            let remaining = self.filter.list_rules(top.table, top.name).await?;
            if !remaining.is_empty() {
                warn!(
                    chain = top.name,
                    rules = remaining.len(),
                    "Top-level chain not empty, keeping it"
                );
                continue;
            }
            let jump = RuleSpec::new(format!("-j {}", top.name));
            while self
                .filter
                .delete_if_exists(top.table, top.hook, &jump)
                .await?
            {}
            self.filter.delete_chain(top.table, top.name).await?;
            info!(chain = top.name, "Deleted top-level chain");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePacketFilter;
    use crate::testutil::spec;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn engine() -> (Arc<FakePacketFilter>, RuleEngine) {
        let fake = Arc::new(FakePacketFilter::new());
        let engine = RuleEngine::new(fake.clone());
        (fake, engine)
    }

    fn baseline() -> Baseline {
        Baseline {
            tunnel_interface: "wg.plk".to_string(),
            tunnel_port: 51840,
            vxlan_port: 4789,
        }
    }

    fn cluster_state(fake: &FakePacketFilter, cluster: &str) -> Vec<(String, Vec<RuleSpec>)> {
        let names = ClusterChains::new(&ClusterIdentity::new(cluster).unwrap());
        let mut state: Vec<_> = names
            .all()
            .map(|(_, chain)| (chain.name.clone(), fake.rules(chain.table, &chain.name)))
            .collect();
        for top in chains::TOP_LEVEL {
            let jumps = fake
                .rules(top.table, top.name)
                .into_iter()
                .filter(|r| r.jump_target().map_or(false, |t| names.owns(t)))
                .collect();
            state.push((top.name.to_string(), jumps));
        }
        state
    }

    #[tokio::test]
    async fn test_init_hooks_once_at_top() {
        let (fake, engine) = engine();
        fake.inject(Table::Filter, "FORWARD", "-j DROP");
        engine.init().await.unwrap();
        engine.init().await.unwrap();

        assert_eq!(
            fake.rules(Table::Filter, "FORWARD"),
            vec![RuleSpec::new("-j PLK-FORWARD"), RuleSpec::new("-j DROP")]
        );
        assert_eq!(
            fake.rules(Table::Nat, "POSTROUTING"),
            vec![RuleSpec::new("-j PLK-POSTROUTING")]
        );
    }

    #[tokio::test]
    async fn test_init_removes_duplicate_and_misplaced_hooks() {
        let (fake, engine) = engine();
        engine.init().await.unwrap();
        fake.inject(Table::Filter, "INPUT", "-j PLK-INPUT");
        fake.insert(Table::Filter, "INPUT", 1, &RuleSpec::new("-j ACCEPT"))
            .await
            .unwrap();

        engine.init().await.unwrap();
        let rules = fake.rules(Table::Filter, "INPUT");
        assert_eq!(rules[0], RuleSpec::new("-j PLK-INPUT"));
        assert_eq!(
            rules.iter().filter(|r| r.jumps_to("PLK-INPUT")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_identical() {
        let (fake, engine) = engine();
        engine.init().await.unwrap();
        let spec = spec("east");

        let first = engine.ensure_rules_per_cluster(&spec).await.unwrap();
        assert!(first.added > 0);
        let before = fake.snapshot();

        let second = engine.ensure_rules_per_cluster(&spec).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(fake.snapshot(), before);
    }

    #[tokio::test]
    async fn test_cidr_change_converges_to_new_set() {
        let (fake, engine) = engine();
        engine.init().await.unwrap();
        let mut spec = spec("east");
        engine.ensure_rules_per_cluster(&spec).await.unwrap();

        spec.remote_remapped_pod_cidr = "10.51.0.0/16".parse().unwrap();
        engine.ensure_rules_per_cluster(&spec).await.unwrap();

        let (fresh_fake, fresh_engine) = engine_with_init().await;
        fresh_engine.ensure_rules_per_cluster(&spec).await.unwrap();

        let mut converged = cluster_state(&fake, "east");
        let mut expected = cluster_state(&fresh_fake, "east");
        for (_, rules) in converged.iter_mut().chain(expected.iter_mut()) {
            rules.sort();
        }
        assert_eq!(converged, expected);
        assert!(!fake
            .rules(Table::Nat, "PLK-POSTROUTING")
            .iter()
            .any(|r| r.as_str().contains("10.50.0.0/16")));
    }

    async fn engine_with_init() -> (Arc<FakePacketFilter>, RuleEngine) {
        let (fake, engine) = engine();
        engine.init().await.unwrap();
        (fake, engine)
    }

    #[tokio::test]
    async fn test_clusters_are_isolated() {
        let (fake, engine) = engine_with_init().await;
        let mut east = spec("east");
        let mut west = spec("west");
        west.remote_remapped_pod_cidr = "10.52.0.0/16".parse().unwrap();
        west.remote_remapped_external_cidr = "10.62.0.0/16".parse().unwrap();
        engine.ensure_rules_per_cluster(&east).await.unwrap();
        engine.ensure_rules_per_cluster(&west).await.unwrap();
        let west_before = cluster_state(&fake, "west");

        east.remote_remapped_pod_cidr = "10.53.0.0/16".parse().unwrap();
        engine.ensure_rules_per_cluster(&east).await.unwrap();
        assert_eq!(cluster_state(&fake, "west"), west_before);

        engine
            .remove_per_cluster(&east.cluster)
            .await
            .unwrap();
        assert_eq!(cluster_state(&fake, "west"), west_before);
        assert!(!fake.has_chain(Table::Nat, "PLK-PSTRT-CLS-EAST"));
    }

    #[tokio::test]
    async fn test_duplicate_cluster_rules_are_collapsed() {
        let (fake, engine) = engine_with_init().await;
        let spec = spec("east");
        engine.ensure_rules_per_cluster(&spec).await.unwrap();
        fake.inject(
            Table::Filter,
            "PLK-FRWD-CLS-EAST",
            "-s 10.50.0.0/16 -j ACCEPT",
        );
        fake.inject(
            Table::Filter,
            "PLK-FORWARD",
            "-s 10.50.0.0/16 -j PLK-FRWD-CLS-EAST",
        );

        let stats = engine.ensure_rules_per_cluster(&spec).await.unwrap();
        assert_eq!(stats, SyncStats { added: 0, removed: 2 });
        let forward = fake.rules(Table::Filter, "PLK-FRWD-CLS-EAST");
        let unique: HashSet<_> = forward.iter().collect();
        assert_eq!(unique.len(), forward.len());
    }

    #[tokio::test]
    async fn test_foreign_rules_in_top_level_chain_survive() {
        let (fake, engine) = engine_with_init().await;
        fake.inject(Table::Filter, "PLK-FORWARD", "-s 192.168.0.0/24 -j ACCEPT");
        engine.ensure_rules_per_cluster(&spec("east")).await.unwrap();
        engine.remove_per_cluster(&spec("east").cluster).await.unwrap();
        assert_eq!(
            fake.rules(Table::Filter, "PLK-FORWARD"),
            vec![RuleSpec::new("-s 192.168.0.0/24 -j ACCEPT")]
        );
    }

    #[tokio::test]
    async fn test_nat_mappings_stay_in_their_cluster_chain() {
        let (fake, engine) = engine_with_init().await;
        let east = NatMappingSet::new(ClusterIdentity::new("east").unwrap())
            .with_mapping(Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(10, 0, 2, 4));
        let west = NatMappingSet::new(ClusterIdentity::new("west").unwrap())
            .with_mapping(Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(10, 0, 3, 7));

        engine.ensure_nat_mapping_rules(&east).await.unwrap();
        engine.ensure_nat_mapping_rules(&west).await.unwrap();

        assert_eq!(
            fake.rules(Table::Nat, "PLK-PRRT-EXT-CLS-EAST"),
            vec![RuleSpec::new("-d 10.0.2.4/32 -j DNAT --to-destination 10.0.1.2")]
        );
        assert_eq!(
            fake.rules(Table::Nat, "PLK-PRRT-EXT-CLS-WEST"),
            vec![RuleSpec::new("-d 10.0.3.7/32 -j DNAT --to-destination 10.0.1.2")]
        );
    }

    #[tokio::test]
    async fn test_terminate_keeps_non_empty_top_level_chain() {
        let (fake, engine) = engine_with_init().await;
        engine.ensure_baseline(&baseline()).await.unwrap();
        engine.ensure_rules_per_cluster(&spec("east")).await.unwrap();
        fake.inject(Table::Nat, "PLK-POSTROUTING", "-s 192.168.0.0/24 -j MASQUERADE");

        engine.terminate(&baseline()).await.unwrap();

        assert!(!fake.has_chain(Table::Filter, "PLK-FORWARD"));
        assert!(!fake.has_chain(Table::Filter, "PLK-INPUT"));
        assert!(!fake.has_chain(Table::Nat, "PLK-PSTRT-CLS-EAST"));
        assert!(fake.has_chain(Table::Nat, "PLK-POSTROUTING"));
        assert_eq!(
            fake.rules(Table::Nat, "POSTROUTING"),
            vec![RuleSpec::new("-j PLK-POSTROUTING")]
        );
        assert!(fake.rules(Table::Filter, "FORWARD").is_empty());
    }

    #[tokio::test]
    async fn test_baseline_is_idempotent() {
        let (fake, engine) = engine_with_init().await;
        assert_eq!(engine.ensure_baseline(&baseline()).await.unwrap(), 4);
        assert_eq!(engine.ensure_baseline(&baseline()).await.unwrap(), 0);
        assert_eq!(fake.rules(Table::Filter, "PLK-INPUT").len(), 2);
    }
}

//! In-memory [`PacketFilter`] for tests.
//!
//! Models the iptables behaviour the rule engine depends on: built-in chains
//! exist from the start, duplicate rules are allowed, deleting a non-empty
//! or still-referenced chain fails, and jumps must target an existing chain
//! or a standard target. Every call is counted.

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_common::{PeerlinkError, PeerlinkResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::filter::PacketFilter;
use crate::rule::{RuleSpec, Table};

const STANDARD_TARGETS: &[&str] = &[
    "ACCEPT",
    "DROP",
    "RETURN",
    "REJECT",
    "SNAT",
    "DNAT",
    "NETMAP",
    "MASQUERADE",
];

type Chains = BTreeMap<String, Vec<RuleSpec>>;

#[derive(Debug)]
pub struct FakePacketFilter {
    tables: Mutex<BTreeMap<Table, Chains>>,
    calls: AtomicUsize,
}

fn failed(command: String, output: &str) -> PeerlinkError {
    PeerlinkError::ShellCommandFailed {
        command,
        exit_code: 1,
        output: output.to_string(),
    }
}

impl Default for FakePacketFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePacketFilter {
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        for table in [Table::Filter, Table::Nat] {
            let chains: Chains = table
                .builtin_chains()
                .iter()
                .map(|c| (c.to_string(), Vec::new()))
                .collect();
            tables.insert(table, chains);
        }
        Self {
            tables: Mutex::new(tables),
            calls: AtomicUsize::new(0),
        }
    }

    /// Total number of calls made through the [`PacketFilter`] trait.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a chain's rules (empty if the chain does not exist).
    pub fn rules(&self, table: Table, chain: &str) -> Vec<RuleSpec> {
        self.tables
            .lock()
            .get(&table)
            .and_then(|chains| chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    /// Every chain of both tables with its rules.
    pub fn snapshot(&self) -> BTreeMap<(Table, String), Vec<RuleSpec>> {
        self.tables
            .lock()
            .iter()
            .flat_map(|(table, chains)| {
                chains
                    .iter()
                    .map(move |(name, rules)| ((*table, name.clone()), rules.clone()))
            })
            .collect()
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.tables
            .lock()
            .get(&table)
            .map_or(false, |chains| chains.contains_key(chain))
    }

    /// Adds a rule behind the engine's back, as an operator would.
    pub fn inject(&self, table: Table, chain: &str, rule: &str) {
        if let Some(rules) = self
            .tables
            .lock()
            .get_mut(&table)
            .and_then(|chains| chains.get_mut(chain))
        {
            rules.push(RuleSpec::new(rule));
        }
    }

    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn with_chain<T>(
        &self,
        table: Table,
        chain: &str,
        op: &str,
        f: impl FnOnce(&mut Vec<RuleSpec>) -> PeerlinkResult<T>,
    ) -> PeerlinkResult<T> {
        let mut tables = self.tables.lock();
        let rules = tables
            .get_mut(&table)
            .and_then(|chains| chains.get_mut(chain))
            .ok_or_else(|| {
                failed(
                    format!("iptables -t {} {} {}", table, op, chain),
                    "iptables: No chain/target/match by that name.",
                )
            })?;
        f(rules)
    }

    fn check_target(&self, table: Table, rule: &RuleSpec) -> PeerlinkResult<()> {
        let Some(target) = rule.jump_target() else {
            return Ok(());
        };
        if STANDARD_TARGETS.contains(&target) {
            return Ok(());
        }
        let tables = self.tables.lock();
        let known = tables
            .get(&table)
            .map_or(false, |chains| chains.contains_key(target));
        if known {
            Ok(())
        } else {
            Err(failed(
                format!("iptables -t {} -A ... -j {}", table, target),
                "iptables: No chain/target/match by that name.",
            ))
        }
    }
}

#[async_trait]
impl PacketFilter for FakePacketFilter {
    async fn list_chains(&self, table: Table) -> PeerlinkResult<Vec<String>> {
        self.enter();
        Ok(self
            .tables
            .lock()
            .get(&table)
            .map(|chains| chains.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn new_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()> {
        self.enter();
        let mut tables = self.tables.lock();
        let chains = tables.entry(table).or_default();
        if chains.contains_key(chain) {
            return Err(failed(
                format!("iptables -t {} -N {}", table, chain),
                "iptables: Chain already exists.",
            ));
        }
        chains.insert(chain.to_string(), Vec::new());
        Ok(())
    }

    async fn clear_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()> {
        self.enter();
        self.with_chain(table, chain, "-F", |rules| {
            rules.clear();
            Ok(())
        })
    }

    async fn delete_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()> {
        self.enter();
        let mut tables = self.tables.lock();
        let command = format!("iptables -t {} -X {}", table, chain);
        let chains = tables.entry(table).or_default();
        match chains.get(chain) {
            None => {
                return Err(failed(command, "iptables: No chain/target/match by that name."))
            }
            Some(rules) if !rules.is_empty() => {
                return Err(failed(command, "iptables: Directory not empty."))
            }
            Some(_) => {}
        }
        let referenced = chains
            .values()
            .flatten()
            .any(|rule| rule.jumps_to(chain));
        if referenced {
            return Err(failed(command, "iptables: Too many links."));
        }
        chains.remove(chain);
        Ok(())
    }

    async fn list_rules(&self, table: Table, chain: &str) -> PeerlinkResult<Vec<RuleSpec>> {
        self.enter();
        self.with_chain(table, chain, "-S", |rules| Ok(rules.clone()))
    }

    async fn exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<bool> {
        self.enter();
        self.with_chain(table, chain, "-C", |rules| Ok(rules.contains(rule)))
    }

    async fn append(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<()> {
        self.enter();
        self.check_target(table, rule)?;
        self.with_chain(table, chain, "-A", |rules| {
            rules.push(rule.clone());
            Ok(())
        })
    }

    async fn insert(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        rule: &RuleSpec,
    ) -> PeerlinkResult<()> {
        self.enter();
        self.check_target(table, rule)?;
        self.with_chain(table, chain, "-I", |rules| {
            let index = (position.max(1) as usize - 1).min(rules.len());
            rules.insert(index, rule.clone());
            Ok(())
        })
    }

    async fn delete(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<()> {
        self.enter();
        self.with_chain(table, chain, "-D", |rules| {
            match rules.iter().position(|r| r == rule) {
                Some(index) => {
                    rules.remove(index);
                    Ok(())
                }
                None => Err(failed(
                    format!("iptables -t {} -D {} {}", table, chain, rule),
                    "iptables: Bad rule (does a matching rule exist in that chain?).",
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_append_unique_to_missing_chain_fails_at_check() {
        let fake = FakePacketFilter::new();
        let err = assert_err!(
            fake.append_unique(Table::Filter, "PLK-INPUT", &RuleSpec::new("-j ACCEPT"))
                .await
        );
        assert!(err.to_string().contains("-C PLK-INPUT"), "{}", err);
        assert!(!peerlink_common::shell::is_benign_race(&err));
        assert!(!fake.has_chain(Table::Filter, "PLK-INPUT"));
    }

    #[tokio::test]
    async fn test_builtins_present() {
        let fake = FakePacketFilter::new();
        assert!(fake.chain_exists(Table::Nat, "POSTROUTING").await.unwrap());
        assert!(!fake.chain_exists(Table::Filter, "POSTROUTING").await.unwrap());
    }

    #[tokio::test]
    async fn test_referenced_chain_cannot_be_deleted() {
        let fake = FakePacketFilter::new();
        fake.new_chain(Table::Filter, "PLK-FORWARD").await.unwrap();
        fake.append(Table::Filter, "FORWARD", &RuleSpec::new("-j PLK-FORWARD"))
            .await
            .unwrap();
        assert_err!(fake.delete_chain(Table::Filter, "PLK-FORWARD").await);
    }

    #[tokio::test]
    async fn test_jump_to_missing_chain_fails() {
        let fake = FakePacketFilter::new();
        assert_err!(
            fake.append(Table::Filter, "FORWARD", &RuleSpec::new("-j PLK-MISSING"))
                .await
        );
    }

    #[tokio::test]
    async fn test_append_unique_and_delete_if_exists() {
        let fake = FakePacketFilter::new();
        let rule = RuleSpec::new("-i wg.plk -j ACCEPT");
        assert!(fake.append_unique(Table::Filter, "FORWARD", &rule).await.unwrap());
        assert!(!fake.append_unique(Table::Filter, "FORWARD", &rule).await.unwrap());
        assert!(fake.delete_if_exists(Table::Filter, "FORWARD", &rule).await.unwrap());
        assert!(!fake.delete_if_exists(Table::Filter, "FORWARD", &rule).await.unwrap());
        assert!(fake.rules(Table::Filter, "FORWARD").is_empty());
    }
}

//! The packet-filter kernel seam.

use async_trait::async_trait;
use peerlink_common::PeerlinkResult;

use crate::rule::{RuleSpec, Table};

/// Chain and rule manipulation against the `filter` and `nat` tables.
///
/// Required methods are raw kernel operations. The provided methods build
/// the idempotent forms the rule engine relies on.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Lists every chain of `table`, built-in chains included.
    async fn list_chains(&self, table: Table) -> PeerlinkResult<Vec<String>>;

    async fn new_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()>;

    /// Flushes every rule of `chain`.
    async fn clear_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()>;

    /// Deletes an empty, unreferenced chain.
    async fn delete_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()>;

    /// Lists the rules of `chain` in order, normalized.
    async fn list_rules(&self, table: Table, chain: &str) -> PeerlinkResult<Vec<RuleSpec>>;

    async fn exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<bool>;

    async fn append(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<()>;

    /// Inserts `rule` at 1-based `position`.
    async fn insert(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        rule: &RuleSpec,
    ) -> PeerlinkResult<()>;

    /// Deletes the first occurrence of `rule`.
    async fn delete(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<()>;

    async fn chain_exists(&self, table: Table, chain: &str) -> PeerlinkResult<bool> {
        Ok(self.list_chains(table).await?.iter().any(|c| c == chain))
    }

    /// Creates `chain` unless present. Returns true if it was created.
    async fn ensure_chain(&self, table: Table, chain: &str) -> PeerlinkResult<bool> {
        if self.chain_exists(table, chain).await? {
            return Ok(false);
        }
        self.new_chain(table, chain).await?;
        Ok(true)
    }

    /// Appends `rule` unless present. Returns true if it was appended.
    async fn append_unique(
        &self,
        table: Table,
        chain: &str,
        rule: &RuleSpec,
    ) -> PeerlinkResult<bool> {
        if self.exists(table, chain, rule).await? {
            return Ok(false);
        }
        self.append(table, chain, rule).await?;
        Ok(true)
    }

    /// Deletes `rule` if present. Returns true if it was deleted.
    async fn delete_if_exists(
        &self,
        table: Table,
        chain: &str,
        rule: &RuleSpec,
    ) -> PeerlinkResult<bool> {
        if !self.exists(table, chain, rule).await? {
            return Ok(false);
        }
        self.delete(table, chain, rule).await?;
        Ok(true)
    }

    /// Flushes and deletes `chain` if present. Returns true if it was deleted.
    async fn delete_chain_if_exists(&self, table: Table, chain: &str) -> PeerlinkResult<bool> {
        if !self.chain_exists(table, chain).await? {
            return Ok(false);
        }
        self.clear_chain(table, chain).await?;
        self.delete_chain(table, chain).await?;
        Ok(true)
    }
}

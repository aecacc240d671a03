//! Low-level network configuration for peerlink.
//!
//! [`NetConfig`] is the seam between fabric logic and the kernel. Its
//! operations are deliberately raw: adding an existing object or deleting
//! a missing one is an error here, and the [`idempotent`] wrappers decide
//! what counts as success.
//!
//! - [`ShellNetConfig`]: drives `ip` and `bridge`, parsing their JSON output
//! - [`idempotent`]: add-if-absent / delete-if-present wrappers
//! - [`fake::FakeNetConfig`]: in-memory kernel model used by tests

pub mod commands;
pub mod fake;
pub mod idempotent;
pub mod parse;
mod shell;
mod types;

pub use shell::ShellNetConfig;
pub use types::{IfAddr, Link, VxlanAttrs, VxlanSpec};

use async_trait::async_trait;
use peerlink_common::PeerlinkResult;
use peerlink_types::{Neighbor, PolicyRule, RouteEntry, TableId};

/// Kernel network configuration: links, addresses, FDB, routes and rules.
#[async_trait]
pub trait NetConfig: Send + Sync {
    /// Returns the link named `name`, or `None` if it does not exist.
    async fn link_by_name(&self, name: &str) -> PeerlinkResult<Option<Link>>;

    async fn add_vxlan_link(&self, spec: &VxlanSpec) -> PeerlinkResult<()>;

    /// Creates a link of a kind that needs no extra attributes (e.g. `wireguard`).
    async fn add_link(&self, name: &str, kind: &str) -> PeerlinkResult<()>;

    async fn delete_link(&self, name: &str) -> PeerlinkResult<()>;

    async fn set_link_up(&self, name: &str) -> PeerlinkResult<()>;

    async fn set_mtu(&self, name: &str, mtu: u32) -> PeerlinkResult<()>;

    async fn list_addrs(&self, name: &str) -> PeerlinkResult<Vec<IfAddr>>;

    async fn add_addr(&self, name: &str, addr: IfAddr) -> PeerlinkResult<()>;

    async fn del_addr(&self, name: &str, addr: IfAddr) -> PeerlinkResult<()>;

    /// Lists remote FDB entries of `dev`.
    async fn list_fdb(&self, dev: &str) -> PeerlinkResult<Vec<Neighbor>>;

    async fn append_fdb(&self, dev: &str, neighbor: &Neighbor) -> PeerlinkResult<()>;

    async fn del_fdb(&self, dev: &str, neighbor: &Neighbor) -> PeerlinkResult<()>;

    async fn list_routes(&self, table: TableId) -> PeerlinkResult<Vec<RouteEntry>>;

    async fn add_route(&self, route: &RouteEntry) -> PeerlinkResult<()>;

    async fn del_route(&self, route: &RouteEntry) -> PeerlinkResult<()>;

    async fn list_rules(&self) -> PeerlinkResult<Vec<PolicyRule>>;

    async fn add_rule(&self, rule: &PolicyRule) -> PeerlinkResult<()>;

    async fn del_rule(&self, rule: &PolicyRule) -> PeerlinkResult<()>;
}

//! Idempotent forms of the raw [`NetConfig`] operations.
//!
//! Each helper returns whether it changed the kernel. Adding something
//! already present or deleting something absent yields `Ok(false)`, and so
//! does losing an exists/not-exists race against another writer.

use peerlink_common::shell::is_benign_race;
use peerlink_common::PeerlinkResult;
use peerlink_types::{Neighbor, PolicyRule, RouteEntry};
use tracing::debug;

use crate::NetConfig;

fn absorb_race(result: PeerlinkResult<()>) -> PeerlinkResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if is_benign_race(&e) => {
            debug!(error = %e, "Lost race against concurrent change");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

pub async fn add_fdb(net: &dyn NetConfig, dev: &str, neighbor: &Neighbor) -> PeerlinkResult<bool> {
    if net.list_fdb(dev).await?.contains(neighbor) {
        return Ok(false);
    }
    absorb_race(net.append_fdb(dev, neighbor).await)
}

pub async fn del_fdb(net: &dyn NetConfig, dev: &str, neighbor: &Neighbor) -> PeerlinkResult<bool> {
    if !net.list_fdb(dev).await?.contains(neighbor) {
        return Ok(false);
    }
    absorb_race(net.del_fdb(dev, neighbor).await)
}

/// Installs `route`. An identical route is left alone; a route to the same
/// destination in the same table with different attributes is replaced.
pub async fn add_route(net: &dyn NetConfig, route: &RouteEntry) -> PeerlinkResult<bool> {
    let existing = net.list_routes(route.table).await?;
    if existing.contains(route) {
        return Ok(false);
    }
    for stale in existing.iter().filter(|r| r.same_destination(route)) {
        debug!(stale = %stale, wanted = %route, "Replacing stale route");
        absorb_race(net.del_route(stale).await)?;
    }
    absorb_race(net.add_route(route).await)
}

/// Removes the route to `route.dst` in `route.table`, whatever its next hop.
pub async fn del_route(net: &dyn NetConfig, route: &RouteEntry) -> PeerlinkResult<bool> {
    let existing = net.list_routes(route.table).await?;
    let mut removed = false;
    for r in existing.iter().filter(|r| r.same_destination(route)) {
        removed |= absorb_race(net.del_route(r).await)?;
    }
    Ok(removed)
}

pub async fn add_rule(net: &dyn NetConfig, rule: &PolicyRule) -> PeerlinkResult<bool> {
    if net.list_rules().await?.contains(rule) {
        return Ok(false);
    }
    absorb_race(net.add_rule(rule).await)
}

/// Removes every copy of `rule`.
pub async fn del_rule(net: &dyn NetConfig, rule: &PolicyRule) -> PeerlinkResult<bool> {
    let copies = net.list_rules().await?.iter().filter(|r| *r == rule).count();
    let mut removed = false;
    for _ in 0..copies {
        removed |= absorb_race(net.del_rule(rule).await)?;
    }
    Ok(removed)
}

//! Routing table manager for peerlink.
//!
//! Two custom tables carry fabric traffic:
//!
//! - the **gateway table** holds routes towards remote clusters, selected by
//!   destination policy rules
//! - the **symmetric table** holds /32 routes to local pods hosted on other
//!   nodes, selected by source policy rules for traffic arriving from a
//!   peer, so replies leave over the overlay instead of the CNI default path
//!   and survive strict reverse-path filtering

mod manager;

pub use manager::{RouteTarget, RoutingConfig, RoutingManager, SymmetricChange};

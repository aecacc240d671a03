//! Kernel routing records: routes, policy rules and table IDs.

use crate::{Ipv4Cidr, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A kernel routing table identifier.
///
/// Valid IDs are `1..=0x7FFF_FFFF`. Custom tables created by the fabric must
/// additionally avoid the reserved `default`, `main` and `local` tables
/// (253, 254, 255).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct TableId(u32);

impl TableId {
    pub const MAX: u32 = 0x7FFF_FFFF;

    /// The kernel's main table.
    pub const MAIN: TableId = TableId(254);

    const RESERVED: [u32; 3] = [253, 254, 255];

    pub fn new(id: u32) -> Result<Self, ParseError> {
        if id == 0 || id > Self::MAX {
            return Err(ParseError::InvalidTableId(id));
        }
        Ok(TableId(id))
    }

    /// Validates an ID for a table the fabric owns.
    pub fn custom(id: u32) -> Result<Self, ParseError> {
        if Self::RESERVED.contains(&id) {
            return Err(ParseError::InvalidTableId(id));
        }
        Self::new(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for TableId {
    type Error = ParseError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<TableId> for u32 {
    fn from(id: TableId) -> u32 {
        id.0
    }
}

/// A unicast IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteEntry {
    pub dst: Ipv4Cidr,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    /// Output interface.
    pub device: String,
    pub table: TableId,
    /// Install with `onlink`, required when the gateway is not on a
    /// directly-connected subnet of `device`.
    #[serde(default)]
    pub onlink: bool,
}

impl RouteEntry {
    pub fn new(dst: Ipv4Cidr, device: impl Into<String>, table: TableId) -> Self {
        Self {
            dst,
            gateway: None,
            device: device.into(),
            table,
            onlink: false,
        }
    }

    /// Sets the next hop (builder pattern).
    pub fn via(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn onlink(mut self) -> Self {
        self.onlink = true;
        self
    }

    /// Returns true if `other` targets the same destination in the same
    /// table, whatever its next hop.
    pub fn same_destination(&self, other: &RouteEntry) -> bool {
        self.dst == other.dst && self.table == other.table
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev {} table {}", self.device, self.table)?;
        if self.onlink {
            f.write_str(" onlink")?;
        }
        Ok(())
    }
}

/// A policy-routing rule selecting `table` by source and/or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyRule {
    pub priority: u32,
    #[serde(default)]
    pub src: Option<Ipv4Cidr>,
    #[serde(default)]
    pub dst: Option<Ipv4Cidr>,
    pub table: TableId,
}

impl PolicyRule {
    pub fn to_destination(dst: Ipv4Cidr, table: TableId, priority: u32) -> Self {
        Self {
            priority,
            src: None,
            dst: Some(dst),
            table,
        }
    }

    pub fn from_source(src: Ipv4Cidr, table: TableId, priority: u32) -> Self {
        Self {
            priority,
            src: Some(src),
            dst: None,
            table,
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pref {}", self.priority)?;
        if let Some(src) = self.src {
            write!(f, " from {}", src)?;
        }
        if let Some(dst) = self.dst {
            write!(f, " to {}", dst)?;
        }
        write!(f, " lookup {}", self.table)
    }
}

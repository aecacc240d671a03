//! Chain layout: four top-level chains hooked into the kernel built-ins,
//! and per-cluster chains dispatched to from them.

use peerlink_types::ClusterIdentity;

use crate::rule::Table;

/// Longest chain name accepted by the kernel.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// A chain owned by the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainRef {
    pub table: Table,
    pub name: String,
}

impl ChainRef {
    pub fn new(table: Table, name: impl Into<String>) -> Self {
        Self {
            table,
            name: name.into(),
        }
    }
}

/// A top-level chain and the built-in chain that jumps into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopLevelChain {
    pub table: Table,
    pub name: &'static str,
    pub hook: &'static str,
}

pub const INPUT: TopLevelChain = TopLevelChain {
    table: Table::Filter,
    name: "PLK-INPUT",
    hook: "INPUT",
};

pub const FORWARD: TopLevelChain = TopLevelChain {
    table: Table::Filter,
    name: "PLK-FORWARD",
    hook: "FORWARD",
};

pub const PREROUTING: TopLevelChain = TopLevelChain {
    table: Table::Nat,
    name: "PLK-PREROUTING",
    hook: "PREROUTING",
};

pub const POSTROUTING: TopLevelChain = TopLevelChain {
    table: Table::Nat,
    name: "PLK-POSTROUTING",
    hook: "POSTROUTING",
};

pub const TOP_LEVEL: [TopLevelChain; 4] = [INPUT, FORWARD, PREROUTING, POSTROUTING];

/// Kind of per-cluster chain, each living under one top-level chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterChainKind {
    Input,
    Forward,
    PreRouting,
    PostRouting,
    /// DNAT rules derived from the cluster's NAT mapping set.
    PreRoutingExt,
}

impl ClusterChainKind {
    pub const ALL: [ClusterChainKind; 5] = [
        ClusterChainKind::Input,
        ClusterChainKind::Forward,
        ClusterChainKind::PreRouting,
        ClusterChainKind::PostRouting,
        ClusterChainKind::PreRoutingExt,
    ];

    pub const fn prefix(&self) -> &'static str {
        match self {
            ClusterChainKind::Input => "PLK-INPT-CLS-",
            ClusterChainKind::Forward => "PLK-FRWD-CLS-",
            ClusterChainKind::PreRouting => "PLK-PRRT-CLS-",
            ClusterChainKind::PostRouting => "PLK-PSTRT-CLS-",
            ClusterChainKind::PreRoutingExt => "PLK-PRRT-EXT-CLS-",
        }
    }

    pub const fn parent(&self) -> TopLevelChain {
        match self {
            ClusterChainKind::Input => INPUT,
            ClusterChainKind::Forward => FORWARD,
            ClusterChainKind::PreRouting | ClusterChainKind::PreRoutingExt => PREROUTING,
            ClusterChainKind::PostRouting => POSTROUTING,
        }
    }

    /// Kinds whose chains live under `parent`.
    pub fn under(parent: &TopLevelChain) -> impl Iterator<Item = ClusterChainKind> + '_ {
        Self::ALL
            .into_iter()
            .filter(move |kind| kind.parent() == *parent)
    }
}

/// Per-cluster chain names of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterChains {
    token: String,
}

impl ClusterChains {
    pub fn new(cluster: &ClusterIdentity) -> Self {
        Self {
            token: cluster.chain_token(),
        }
    }

    pub fn get(&self, kind: ClusterChainKind) -> ChainRef {
        ChainRef::new(
            kind.parent().table,
            format!("{}{}", kind.prefix(), self.token),
        )
    }

    pub fn all(&self) -> impl Iterator<Item = (ClusterChainKind, ChainRef)> + '_ {
        ClusterChainKind::ALL
            .into_iter()
            .map(move |kind| (kind, self.get(kind)))
    }

    /// Returns true if `chain` is one of this cluster's chains.
    pub fn owns(&self, chain: &str) -> bool {
        ClusterChainKind::ALL
            .iter()
            .any(|kind| chain.strip_prefix(kind.prefix()) == Some(self.token.as_str()))
    }
}

/// Returns true if `chain` is a per-cluster chain of any cluster.
pub fn is_cluster_chain(chain: &str) -> bool {
    ClusterChainKind::ALL
        .iter()
        .any(|kind| chain.starts_with(kind.prefix()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_short_identity_names() {
        let chains = ClusterChains::new(&ClusterIdentity::new("east").unwrap());
        assert_eq!(
            chains.get(ClusterChainKind::PostRouting),
            ChainRef::new(Table::Nat, "PLK-PSTRT-CLS-EAST")
        );
        assert_eq!(
            chains.get(ClusterChainKind::Forward),
            ChainRef::new(Table::Filter, "PLK-FRWD-CLS-EAST")
        );
    }

    #[test]
    fn test_names_fit_kernel_limit() {
        let id = ClusterIdentity::new("b0c4a0e2-9d3f-4f5e-91a7-2d8c5e6f7a8b").unwrap();
        for (_, chain) in ClusterChains::new(&id).all() {
            assert!(chain.name.len() <= MAX_CHAIN_NAME_LEN, "{}", chain.name);
        }
    }

    #[test]
    fn test_owns_is_exact() {
        let east = ClusterChains::new(&ClusterIdentity::new("east").unwrap());
        assert!(east.owns("PLK-PRRT-EXT-CLS-EAST"));
        assert!(!east.owns("PLK-PRRT-CLS-EAST2"));
        assert!(!east.owns("PLK-PREROUTING"));
        assert!(is_cluster_chain("PLK-PRRT-CLS-WEST"));
        assert!(!is_cluster_chain("PLK-PREROUTING"));
    }

    #[test]
    fn test_prerouting_has_two_kinds() {
        let kinds: Vec<_> = ClusterChainKind::under(&PREROUTING).collect();
        assert_eq!(
            kinds,
            vec![ClusterChainKind::PreRouting, ClusterChainKind::PreRoutingExt]
        );
    }
}

//! Desired rule computation.
//!
//! Everything here is pure: given a connection spec or a NAT mapping set it
//! returns the complete rule set the kernel should hold, in the canonical
//! listing form. Rules inside one chain are mutually exclusive or all
//! `ACCEPT`, so their relative order carries no meaning.

use peerlink_types::{ConnectionSpec, Ipv4Cidr, NatMappingSet};
use std::collections::BTreeMap;

use crate::chains::{self, ClusterChainKind, ClusterChains, TopLevelChain};
use crate::rule::RuleSpec;

/// The desired state of one cluster, excluding its NAT mapping chain
/// contents (owned by the NAT mapping controller).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterRuleSet {
    /// Jump rules into the cluster's chains, per top-level chain.
    pub dispatch: BTreeMap<&'static str, Vec<RuleSpec>>,
    /// Contents of the cluster's own chains.
    pub chains: BTreeMap<ClusterChainKind, Vec<RuleSpec>>,
}

impl ClusterRuleSet {
    pub fn dispatch_for(&self, parent: &TopLevelChain) -> &[RuleSpec] {
        self.dispatch.get(parent.name).map_or(&[], Vec::as_slice)
    }
}

fn push_unique(rules: &mut Vec<RuleSpec>, rule: String) {
    let rule = RuleSpec::new(rule);
    if !rules.contains(&rule) {
        rules.push(rule);
    }
}

/// Computes the rules implementing connectivity to the cluster of `spec`.
///
/// Remote CIDRs are matched in their effective (remapped when set) form.
/// Local pod traffic is NETMAPped onto the remapped local pod CIDR when one
/// is set; any other source is SNATed to the first host of the local pod
/// CIDR as the remote cluster sees it.
pub fn cluster_rules(spec: &ConnectionSpec) -> ClusterRuleSet {
    let names = ClusterChains::new(&spec.cluster);
    let remote_pod = spec.remote_pod_cidr_effective();
    let remote_ext = spec.remote_external_cidr_effective();
    let remote = [remote_pod, remote_ext];
    let local_pod = spec.local_pod_cidr;
    let local_pod_seen = spec.local_pod_cidr_effective();
    let local_ext_seen = spec.local_external_cidr_effective();

    let mut set = ClusterRuleSet::default();
    let jump = |kind: ClusterChainKind| names.get(kind).name;

    let post = set.dispatch.entry(chains::POSTROUTING.name).or_default();
    for cidr in remote {
        push_unique(post, format!("-d {} -j {}", cidr, jump(ClusterChainKind::PostRouting)));
    }

    let pre = set.dispatch.entry(chains::PREROUTING.name).or_default();
    for cidr in remote {
        push_unique(
            pre,
            format!(
                "-s {} -d {} -j {}",
                cidr,
                local_pod_seen,
                jump(ClusterChainKind::PreRouting)
            ),
        );
    }
    push_unique(
        pre,
        format!(
            "-s {} -d {} -j {}",
            remote_pod,
            local_ext_seen,
            jump(ClusterChainKind::PreRoutingExt)
        ),
    );

    let fwd = set.dispatch.entry(chains::FORWARD.name).or_default();
    for cidr in remote {
        push_unique(fwd, format!("-s {} -j {}", cidr, jump(ClusterChainKind::Forward)));
        push_unique(fwd, format!("-d {} -j {}", cidr, jump(ClusterChainKind::Forward)));
    }

    let input = set.dispatch.entry(chains::INPUT.name).or_default();
    for cidr in remote {
        push_unique(input, format!("-s {} -j {}", cidr, jump(ClusterChainKind::Input)));
    }

    let mut postrouting = Vec::new();
    if local_pod_seen != local_pod {
        push_unique(
            &mut postrouting,
            format!("-s {} -j NETMAP --to {}", local_pod, local_pod_seen),
        );
    }
    push_unique(
        &mut postrouting,
        format!(
            "! -s {} -j SNAT --to-source {}",
            local_pod,
            local_pod_seen.first_host()
        ),
    );
    set.chains.insert(ClusterChainKind::PostRouting, postrouting);

    let mut prerouting = Vec::new();
    if local_pod_seen != local_pod {
        push_unique(
            &mut prerouting,
            format!("-d {} -j NETMAP --to {}", local_pod_seen, local_pod),
        );
    }
    set.chains.insert(ClusterChainKind::PreRouting, prerouting);

    let mut forward = Vec::new();
    for cidr in remote {
        push_unique(&mut forward, format!("-s {} -j ACCEPT", cidr));
        push_unique(&mut forward, format!("-d {} -j ACCEPT", cidr));
    }
    set.chains.insert(ClusterChainKind::Forward, forward);

    let mut input_rules = Vec::new();
    for cidr in remote {
        push_unique(&mut input_rules, format!("-s {} -j ACCEPT", cidr));
    }
    set.chains.insert(ClusterChainKind::Input, input_rules);

    set
}

/// One DNAT rule per mapping: traffic for the remapped IP goes to the real one.
pub fn nat_mapping_rules(set: &NatMappingSet) -> Vec<RuleSpec> {
    set.mappings
        .iter()
        .map(|(old_ip, new_ip)| {
            RuleSpec::new(format!(
                "-d {} -j DNAT --to-destination {}",
                Ipv4Cidr::host(*new_ip),
                old_ip
            ))
        })
        .collect()
}

/// Accept rules the firewall loop keeps asserted in the top-level chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub tunnel_interface: String,
    pub tunnel_port: u16,
    pub vxlan_port: u16,
}

impl Baseline {
    pub fn rules(&self) -> Vec<(TopLevelChain, RuleSpec)> {
        vec![
            (
                chains::FORWARD,
                RuleSpec::new(format!("-i {} -j ACCEPT", self.tunnel_interface)),
            ),
            (
                chains::FORWARD,
                RuleSpec::new(format!("-o {} -j ACCEPT", self.tunnel_interface)),
            ),
            (
                chains::INPUT,
                RuleSpec::new(format!("-p udp -m udp --dport {} -j ACCEPT", self.tunnel_port)),
            ),
            (
                chains::INPUT,
                RuleSpec::new(format!("-p udp -m udp --dport {} -j ACCEPT", self.vxlan_port)),
            ),
        ]
    }
}

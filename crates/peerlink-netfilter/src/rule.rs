//! Tables and normalized rule specifications.

use std::fmt;

/// Kernel packet-filter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }

    /// Chains the kernel provides in this table.
    pub const fn builtin_chains(&self) -> &'static [&'static str] {
        match self {
            Table::Filter => &["INPUT", "FORWARD", "OUTPUT"],
            Table::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule specification in the canonical form `iptables -S` prints,
/// without the leading `-A <chain>`.
///
/// Rules are compared by this string, so desired rules must be written the
/// way the kernel lists them back (`-m udp` after `-p udp`, `/32` on host
/// addresses, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleSpec(String);

impl RuleSpec {
    /// Builds a spec, collapsing runs of whitespace.
    pub fn new(spec: impl AsRef<str>) -> Self {
        RuleSpec(spec.as_ref().split_whitespace().collect::<Vec<_>>().join(" "))
    }

    /// Parses one line of `iptables -S <chain>` output. Returns `None` for
    /// lines that are not rules of `chain` (policy and chain declarations).
    pub fn from_listing(line: &str, chain: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "-A" || tokens.next()? != chain {
            return None;
        }
        let rest: Vec<&str> = tokens.collect();
        if rest.is_empty() {
            return None;
        }
        Some(RuleSpec(rest.join(" ")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split_whitespace()
    }

    /// Target of the `-j` option, if any.
    pub fn jump_target(&self) -> Option<&str> {
        let mut tokens = self.tokens();
        while let Some(token) = tokens.next() {
            if token == "-j" {
                return tokens.next();
            }
        }
        None
    }

    /// Returns true if this rule jumps to `chain`.
    pub fn jumps_to(&self, chain: &str) -> bool {
        self.jump_target() == Some(chain)
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleSpec {
    fn from(s: &str) -> Self {
        RuleSpec::new(s)
    }
}

impl From<String> for RuleSpec {
    fn from(s: String) -> Self {
        RuleSpec::new(s)
    }
}

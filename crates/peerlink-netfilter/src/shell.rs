//! [`PacketFilter`] over the `iptables` command.

use async_trait::async_trait;
use peerlink_common::shell::{self, shellquote, IPTABLES_CMD};
use peerlink_common::{Netns, PeerlinkError, PeerlinkResult};

use crate::filter::PacketFilter;
use crate::rule::{RuleSpec, Table};

/// Runs `iptables` on the host or inside a network namespace.
///
/// Every invocation passes `-w` so concurrent writers wait for the xtables
/// lock instead of failing.
#[derive(Debug, Clone, Default)]
pub struct ShellPacketFilter {
    netns: Netns,
}

impl ShellPacketFilter {
    pub fn new(netns: Netns) -> Self {
        Self { netns }
    }

    pub fn netns(&self) -> &Netns {
        &self.netns
    }

    fn command(&self, table: Table, args: &str) -> String {
        self.netns
            .wrap(format!("{} -w -t {} {}", IPTABLES_CMD, table, args))
    }

    async fn exec(&self, table: Table, args: &str) -> PeerlinkResult<String> {
        shell::exec_or_throw(&self.command(table, args)).await
    }
}

fn quote_rule(rule: &RuleSpec) -> String {
    rule.tokens().map(shellquote).collect::<Vec<_>>().join(" ")
}

/// Chain names declared in `iptables -S` output (`-P` for built-ins,
/// `-N` for user chains).
pub fn parse_chain_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("-P") | Some("-N") => tokens.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

/// What `iptables -C` said about a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Present,
    Absent,
    /// The chain, or a chain the rule jumps to, does not exist.
    MissingChain,
    Failed,
}

/// `iptables -C` exits 1 both for "no such rule" and for "no such chain";
/// only the message tells them apart.
fn classify_check(exit_code: i32, output: &str) -> CheckOutcome {
    match exit_code {
        0 => CheckOutcome::Present,
        1 if output.to_ascii_lowercase().contains("no chain/target/match") => {
            CheckOutcome::MissingChain
        }
        1 => CheckOutcome::Absent,
        _ => CheckOutcome::Failed,
    }
}

pub fn parse_rule_listing(output: &str, chain: &str) -> Vec<RuleSpec> {
    output
        .lines()
        .filter_map(|line| RuleSpec::from_listing(line, chain))
        .collect()
}

#[async_trait]
impl PacketFilter for ShellPacketFilter {
    async fn list_chains(&self, table: Table) -> PeerlinkResult<Vec<String>> {
        let out = self.exec(table, "-S").await?;
        Ok(parse_chain_listing(&out))
    }

    async fn new_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()> {
        self.exec(table, &format!("-N {}", shellquote(chain)))
            .await
            .map(drop)
    }

    async fn clear_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()> {
        self.exec(table, &format!("-F {}", shellquote(chain)))
            .await
            .map(drop)
    }

    async fn delete_chain(&self, table: Table, chain: &str) -> PeerlinkResult<()> {
        self.exec(table, &format!("-X {}", shellquote(chain)))
            .await
            .map(drop)
    }

    async fn list_rules(&self, table: Table, chain: &str) -> PeerlinkResult<Vec<RuleSpec>> {
        let out = self.exec(table, &format!("-S {}", shellquote(chain))).await?;
        Ok(parse_rule_listing(&out, chain))
    }

    async fn exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<bool> {
        let cmd = self.command(
            table,
            &format!("-C {} {}", shellquote(chain), quote_rule(rule)),
        );
        let result = shell::exec(&cmd).await?;
        let output = result.combined_output();
        match classify_check(result.exit_code, &output) {
            CheckOutcome::Present => Ok(true),
            CheckOutcome::Absent => Ok(false),
            CheckOutcome::MissingChain => Err(PeerlinkError::kernel(
                format!("check rule in {} chain {}", table, chain),
                format!("chain or jump target does not exist: {}", output),
            )),
            CheckOutcome::Failed => Err(PeerlinkError::ShellCommandFailed {
                command: cmd,
                exit_code: result.exit_code,
                output,
            }),
        }
    }

    async fn append(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<()> {
        self.exec(
            table,
            &format!("-A {} {}", shellquote(chain), quote_rule(rule)),
        )
        .await
        .map(drop)
    }

    async fn insert(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        rule: &RuleSpec,
    ) -> PeerlinkResult<()> {
        self.exec(
            table,
            &format!("-I {} {} {}", shellquote(chain), position, quote_rule(rule)),
        )
        .await
        .map(drop)
    }

    async fn delete(&self, table: Table, chain: &str, rule: &RuleSpec) -> PeerlinkResult<()> {
        self.exec(
            table,
            &format!("-D {} {}", shellquote(chain), quote_rule(rule)),
        )
        .await
        .map(drop)
    }
}

//! `wg` command builders.

use peerlink_common::shell::{shellquote, WG_CMD};
use std::path::Path;

use super::control::WgPeerConfig;

pub fn build_genkey_cmd() -> String {
    format!("{} genkey", WG_CMD)
}

/// Derives the public key from a private key file.
pub fn build_pubkey_cmd(private_key_path: &Path) -> String {
    format!(
        "{} pubkey < {}",
        WG_CMD,
        shellquote(&private_key_path.to_string_lossy())
    )
}

pub fn build_configure_device_cmd(iface: &str, private_key_path: &Path, listen_port: u16) -> String {
    format!(
        "{} set {} listen-port {} private-key {}",
        WG_CMD,
        shellquote(iface),
        listen_port,
        shellquote(&private_key_path.to_string_lossy())
    )
}

pub fn build_dump_cmd(iface: &str) -> String {
    format!("{} show {} dump", WG_CMD, shellquote(iface))
}

/// `wg set` replaces the peer's allowed-ips with exactly the given list.
pub fn build_set_peer_cmd(iface: &str, peer: &WgPeerConfig) -> String {
    let allowed: Vec<String> = peer.allowed_ips.iter().map(|c| c.to_string()).collect();
    let mut cmd = format!(
        "{} set {} peer {} endpoint {} allowed-ips {}",
        WG_CMD,
        shellquote(iface),
        shellquote(&peer.public_key),
        peer.endpoint,
        allowed.join(",")
    );
    if let Some(keepalive) = peer.keepalive {
        cmd.push_str(&format!(" persistent-keepalive {}", keepalive));
    }
    cmd
}

pub fn build_remove_peer_cmd(iface: &str, public_key: &str) -> String {
    format!(
        "{} set {} peer {} remove",
        WG_CMD,
        shellquote(iface),
        shellquote(public_key)
    )
}

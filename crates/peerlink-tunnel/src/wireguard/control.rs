//! WireGuard control seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peerlink_common::shell::{self, Netns};
use peerlink_common::{PeerlinkError, PeerlinkResult};
use peerlink_types::Ipv4Cidr;
use std::collections::BTreeSet;
use std::net::SocketAddrV4;
use std::path::Path;
use tracing::instrument;

use super::commands::{
    build_configure_device_cmd, build_dump_cmd, build_genkey_cmd, build_pubkey_cmd,
    build_remove_peer_cmd, build_set_peer_cmd,
};

/// Desired configuration of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeerConfig {
    pub public_key: String,
    pub endpoint: SocketAddrV4,
    pub allowed_ips: BTreeSet<Ipv4Cidr>,
    /// Persistent keepalive in seconds.
    pub keepalive: Option<u16>,
}

/// A peer as reported by `wg show <if> dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeer {
    pub public_key: String,
    pub endpoint: Option<SocketAddrV4>,
    pub allowed_ips: BTreeSet<Ipv4Cidr>,
    pub keepalive: Option<u16>,
    pub latest_handshake: Option<DateTime<Utc>>,
}

impl WgPeer {
    /// Returns true if the peer already carries `config`.
    pub fn matches(&self, config: &WgPeerConfig) -> bool {
        self.public_key == config.public_key
            && self.endpoint == Some(config.endpoint)
            && self.allowed_ips == config.allowed_ips
            && self.keepalive == config.keepalive
    }
}

#[async_trait]
pub trait WgControl: Send + Sync {
    async fn genkey(&self) -> PeerlinkResult<String>;

    async fn public_key(&self, private_key_path: &Path) -> PeerlinkResult<String>;

    async fn configure_device(
        &self,
        iface: &str,
        private_key_path: &Path,
        listen_port: u16,
    ) -> PeerlinkResult<()>;

    async fn peers(&self, iface: &str) -> PeerlinkResult<Vec<WgPeer>>;

    /// Creates or updates a peer.
    async fn set_peer(&self, iface: &str, peer: &WgPeerConfig) -> PeerlinkResult<()>;

    async fn remove_peer(&self, iface: &str, public_key: &str) -> PeerlinkResult<()>;
}

/// [`WgControl`] over the `wg` utility.
#[derive(Debug, Clone, Default)]
pub struct ShellWgControl {
    netns: Netns,
}

impl ShellWgControl {
    pub fn new(netns: Netns) -> Self {
        Self { netns }
    }

    async fn run(&self, cmd: String) -> PeerlinkResult<String> {
        shell::exec_or_throw(&self.netns.wrap(cmd)).await
    }
}

#[async_trait]
impl WgControl for ShellWgControl {
    async fn genkey(&self) -> PeerlinkResult<String> {
        Ok(self.run(build_genkey_cmd()).await?.trim().to_string())
    }

    async fn public_key(&self, private_key_path: &Path) -> PeerlinkResult<String> {
        Ok(self
            .run(build_pubkey_cmd(private_key_path))
            .await?
            .trim()
            .to_string())
    }

    #[instrument(skip(self))]
    async fn configure_device(
        &self,
        iface: &str,
        private_key_path: &Path,
        listen_port: u16,
    ) -> PeerlinkResult<()> {
        self.run(build_configure_device_cmd(iface, private_key_path, listen_port))
            .await?;
        Ok(())
    }

    async fn peers(&self, iface: &str) -> PeerlinkResult<Vec<WgPeer>> {
        parse_dump(&self.run(build_dump_cmd(iface)).await?)
    }

    #[instrument(skip(self, peer), fields(peer = %peer.public_key))]
    async fn set_peer(&self, iface: &str, peer: &WgPeerConfig) -> PeerlinkResult<()> {
        self.run(build_set_peer_cmd(iface, peer)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_peer(&self, iface: &str, public_key: &str) -> PeerlinkResult<()> {
        self.run(build_remove_peer_cmd(iface, public_key)).await?;
        Ok(())
    }
}

fn dump_error(line: &str, what: &str) -> PeerlinkError {
    PeerlinkError::tunnel("wireguard", format!("unparsable dump line ({}): {}", what, line))
}

/// Parses `wg show <if> dump`.
///
/// The first line describes the interface and is skipped. Peer lines are
/// tab-separated: public key, preshared key, endpoint, allowed IPs, latest
/// handshake (unix seconds, 0 = never), rx, tx, keepalive (`off` or seconds).
/// IPv6 allowed IPs are ignored.
pub fn parse_dump(output: &str) -> PeerlinkResult<Vec<WgPeer>> {
    let mut peers = Vec::new();
    for line in output.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(dump_error(line, "field count"));
        }

        let endpoint = match fields[2] {
            "(none)" => None,
            ep => ep.parse::<SocketAddrV4>().ok(),
        };
        let allowed_ips = fields[3]
            .split(',')
            .filter_map(|c| c.parse::<Ipv4Cidr>().ok())
            .collect();
        let secs: i64 = fields[4]
            .parse()
            .map_err(|_| dump_error(line, "latest handshake"))?;
        let latest_handshake = if secs == 0 {
            None
        } else {
            DateTime::<Utc>::from_timestamp(secs, 0)
        };
        let keepalive = match fields[7] {
            "off" => None,
            k => Some(k.parse().map_err(|_| dump_error(line, "keepalive"))?),
        };

        peers.push(WgPeer {
            public_key: fields[0].to_string(),
            endpoint,
            allowed_ips,
            keepalive,
            latest_handshake,
        });
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use tokio_test::assert_err;

    const DUMP: &str = "cHJpdmF0ZQ==\txTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\t51820\toff\n\
HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=\t(none)\t172.18.0.9:51820\t10.50.0.0/16,10.60.0.0/16,fd00::/64\t1760400000\t1024\t2048\t25\n\
yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\t(none)\t(none)\t(none)\t0\t0\t0\toff\n";

    #[test]
    fn test_parse_dump() {
        let peers = parse_dump(DUMP).unwrap();
        assert_eq!(peers.len(), 2);

        let first = &peers[0];
        assert_eq!(
            first.endpoint,
            Some(SocketAddrV4::new(Ipv4Addr::new(172, 18, 0, 9), 51820))
        );
        assert_eq!(first.allowed_ips.len(), 2);
        assert_eq!(first.keepalive, Some(25));
        assert_eq!(first.latest_handshake.unwrap().timestamp(), 1_760_400_000);

        let second = &peers[1];
        assert_eq!(second.endpoint, None);
        assert!(second.allowed_ips.is_empty());
        assert_eq!(second.latest_handshake, None);
        assert_eq!(second.keepalive, None);
    }

    #[test]
    fn test_parse_dump_rejects_short_lines() {
        assert_err!(parse_dump("iface line\nshort\tline\n"));
    }

    #[test]
    fn test_interface_only_dump_has_no_peers() {
        assert!(parse_dump("priv\tpub\t51820\toff").unwrap().is_empty());
    }
}

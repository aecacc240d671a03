//! IPv4 network prefixes and the remapping sentinel.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network in CIDR notation (e.g., `10.0.0.0/16`).
///
/// The address is always stored in network form: host bits are cleared on
/// construction, so `10.0.3.7/16` and `10.0.0.0/16` compare equal. This is
/// the same canonical form the kernel prints back in packet-filter listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// `0.0.0.0/0`.
    pub const DEFAULT: Ipv4Cidr = Ipv4Cidr {
        network: Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
    };

    /// Creates a new prefix, clearing any host bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidCidr(format!(
                "{}/{}: prefix length exceeds 32",
                address, prefix_len
            )));
        }
        let network = Ipv4Addr::from(u32::from(address) & Self::mask_bits(prefix_len));
        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// Creates a /32 host prefix.
    pub const fn host(address: Ipv4Addr) -> Self {
        Self {
            network: address,
            prefix_len: 32,
        }
    }

    const fn mask_bits(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len as u32)
        }
    }

    /// Returns the network address.
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns true if this is a host route (/32).
    pub const fn is_host(&self) -> bool {
        self.prefix_len == 32
    }

    /// Returns the last address covered by this prefix.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask_bits(self.prefix_len))
    }

    /// Returns true if `ip` falls inside this prefix.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix_len) == u32::from(self.network)
    }

    /// Returns true if the two prefixes share at least one address.
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other.network) || other.contains(self.network)
    }

    /// Returns the first usable host address.
    ///
    /// For /31 and /32 prefixes this is the network address itself.
    pub fn first_host(&self) -> Ipv4Addr {
        if self.prefix_len >= 31 {
            self.network
        } else {
            Ipv4Addr::from(u32::from(self.network) + 1)
        }
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ParseError;

    /// Parses `a.b.c.d/len`; a bare address is read as a /32 host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = match s.rsplit_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };

        let address: Ipv4Addr = addr_str
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidCidr(s.to_string()))?;
        let prefix_len = match len_str {
            Some(len) => len
                .trim()
                .parse::<u8>()
                .map_err(|_| ParseError::InvalidCidr(s.to_string()))?,
            None => 32,
        };

        Ipv4Cidr::new(address, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> String {
        cidr.to_string()
    }
}

/// Marker string meaning "this CIDR is not remapped".
const NO_REMAP: &str = "None";

/// A remapped CIDR field: either the "no remap" sentinel or a CIDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Remap {
    #[default]
    None,
    Cidr(Ipv4Cidr),
}

impl Remap {
    /// Returns the remapped CIDR if one is set, else `original`.
    pub fn effective(&self, original: Ipv4Cidr) -> Ipv4Cidr {
        match self {
            Remap::None => original,
            Remap::Cidr(cidr) => *cidr,
        }
    }

    /// Returns the remapped CIDR, if any.
    pub fn as_option(&self) -> Option<Ipv4Cidr> {
        match self {
            Remap::None => None,
            Remap::Cidr(cidr) => Some(*cidr),
        }
    }

    pub fn is_remapped(&self) -> bool {
        matches!(self, Remap::Cidr(_))
    }
}

impl fmt::Display for Remap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remap::None => f.write_str(NO_REMAP),
            Remap::Cidr(cidr) => cidr.fmt(f),
        }
    }
}

impl FromStr for Remap {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == NO_REMAP {
            Ok(Remap::None)
        } else {
            s.parse().map(Remap::Cidr)
        }
    }
}

impl TryFrom<String> for Remap {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Remap> for String {
    fn from(remap: Remap) -> String {
        remap.to_string()
    }
}

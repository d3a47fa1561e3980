use crate::policy::ConfigError;
use ipnet::{IpNet, Ipv4Net};
use serde::Deserialize;
use std::net::IpAddr;
use std::str::FromStr;

/// Source addresses that bypass rate limiting entirely.
///
/// Entries are either a single address (`10.0.0.7`, `::1`) or a CIDR block
/// (`192.168.1.0/24`, `2001:db8::/32`). Blocks are matched by network containment, so
/// `192.168.1.0/24` covers `192.168.1.100` but not `192.168.10.1`.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are treated as their IPv4 form on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct Whitelist {
    entries: Vec<WhitelistEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistEntry {
    Address(IpAddr),
    Network(IpNet),
}

impl Whitelist {
    pub fn new(entries: Vec<WhitelistEntry>) -> Self {
        Self { entries }
    }

    /// Parse every entry, failing on the first one that is neither an address nor a CIDR block.
    pub fn parse<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| entry.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        self.entries.iter().any(|entry| entry.matches(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }
}

impl TryFrom<Vec<String>> for Whitelist {
    type Error = ConfigError;

    fn try_from(entries: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(entries)
    }
}

impl WhitelistEntry {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            WhitelistEntry::Address(address) => *address == ip,
            WhitelistEntry::Network(network) => network.contains(&ip),
        }
    }
}

impl FromStr for WhitelistEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: String| ConfigError::InvalidWhitelistEntry {
            entry: s.to_owned(),
            reason,
        };
        if s.contains('/') {
            let network = s.parse::<IpNet>().map_err(|e| invalid(e.to_string()))?;
            Ok(WhitelistEntry::Network(canonical_network(network)))
        } else {
            let address = s.parse::<IpAddr>().map_err(|e| invalid(e.to_string()))?;
            Ok(WhitelistEntry::Address(canonical(address)))
        }
    }
}

pub(crate) fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

// A mapped block with a v6 prefix of at least 96 is shifted onto the v4 range.
fn canonical_network(network: IpNet) -> IpNet {
    let IpNet::V6(v6) = network else {
        return network;
    };
    match v6.addr().to_ipv4_mapped() {
        Some(v4) if v6.prefix_len() >= 96 => Ipv4Net::new(v4, v6.prefix_len() - 96)
            .map(IpNet::V4)
            .unwrap_or(network),
        _ => network,
    }
}

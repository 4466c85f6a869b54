// ── Wire-level value types ──
//
// Plain data returned by transports. Interface, route, and ARP rows
// look the same whichever protocol produced them.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// ifType: other(1).
pub const IFTYPE_OTHER: u32 = 1;
/// ifType: ethernetCsmacd(6).
pub const IFTYPE_ETHERNET: u32 = 6;
/// ifType: softwareLoopback(24).
pub const IFTYPE_SOFTWARE_LOOPBACK: u32 = 24;
/// Synthetic type for the pseudo-interface of a node behind NAT.
pub const IFTYPE_NAT_ADAPTER: u32 = 0xFFFF;

// ── MacAddress ──────────────────────────────────────────────────────

/// MAC address, normalized to lowercase colon-separated format (aa:bb:cc:dd:ee:ff).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddress(String);

impl MacAddress {
    /// Create a normalized MAC address from colon, dash, or dot separated text.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let hex: String = raw
            .as_ref()
            .chars()
            .filter(char::is_ascii_hexdigit)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if hex.len() == 12 {
            let pairs: Vec<&str> = (0..6).filter_map(|i| hex.get(i * 2..i * 2 + 2)).collect();
            Self(pairs.join(":"))
        } else {
            Self(raw.as_ref().to_lowercase().replace('-', ":"))
        }
    }

    /// Build from raw octets, as carried in ifPhysAddress.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 6 {
            return None;
        }
        let parts: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Some(Self(parts.join(":")))
    }

    /// All-zero addresses are what agents report for tunnels and loopbacks.
    pub fn is_zero(&self) -> bool {
        self.0.chars().all(|c| c == '0' || c == ':')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MacAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

// ── Discovery rows ──────────────────────────────────────────────────

/// One discovered (interface, address) pair.
///
/// An interface carrying several addresses shows up as several rows
/// sharing the same `index`; one without any address has `address: None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub index: u32,
    pub name: String,
    pub if_type: u32,
    pub mac: Option<MacAddress>,
    /// Address plus mask; prefix 0 means the mask is unknown.
    pub address: Option<IpNetwork>,
}

impl InterfaceInfo {
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.map(|net| net.ip())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: IpNetwork,
    pub next_hop: IpAddr,
    pub if_index: u32,
    pub route_type: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub address: IpAddr,
    pub mac: MacAddress,
    pub if_index: u32,
}

/// A metric the agent says it can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub description: String,
    pub data_type: String,
}

/// A layer-2 neighbor seen on a local port (LLDP remote table row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkNeighbor {
    pub local_port: u32,
    pub remote_system: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_normalizes_dashes() {
        let mac = MacAddress::new("AA-BB-CC-DD-EE-FF");
        assert_eq!(mac.as_str(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn mac_address_normalizes_cisco_dots() {
        let mac = MacAddress::new("aabb.ccdd.eeff");
        assert_eq!(mac.as_str(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn mac_address_from_octets() {
        let mac = MacAddress::from_bytes(&[0, 0x1b, 0x21, 0x3c, 0x4d, 0x5e]).unwrap();
        assert_eq!(mac.to_string(), "00:1b:21:3c:4d:5e");
        assert!(MacAddress::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn zero_mac_detection() {
        assert!(MacAddress::new("00:00:00:00:00:00").is_zero());
        assert!(!MacAddress::new("00:00:00:00:00:01").is_zero());
    }

    #[test]
    fn interface_info_ip() {
        let info = InterfaceInfo {
            index: 1,
            name: "eth0".into(),
            if_type: IFTYPE_ETHERNET,
            mac: None,
            address: Some("10.0.0.1/24".parse().unwrap()),
        };
        assert_eq!(info.ip(), Some("10.0.0.1".parse().unwrap()));
    }
}

// ── Interface (node child) ──

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use netpoll_transport::{IFTYPE_NAT_ADAPTER, InterfaceInfo, MacAddress};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::status::ObjectStatus;

/// ifAdminStatus / ifOperStatus values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
    Testing,
    #[default]
    Unknown,
}

impl LinkState {
    /// Map the numeric MIB encoding.
    pub fn from_mib(value: i64) -> Self {
        match value {
            1 => Self::Up,
            2 => Self::Down,
            3 => Self::Testing,
            _ => Self::Unknown,
        }
    }
}

/// Status implied by an admin/oper state pair.
pub fn link_status(admin: LinkState, oper: LinkState) -> ObjectStatus {
    match (admin, oper) {
        (LinkState::Down, _) => ObjectStatus::Disabled,
        (LinkState::Up, LinkState::Up) => ObjectStatus::Normal,
        (LinkState::Up, LinkState::Down) => ObjectStatus::Critical,
        (LinkState::Up | LinkState::Testing, LinkState::Testing) => ObjectStatus::Warning,
        _ => ObjectStatus::Unknown,
    }
}

/// One (ifIndex, address) pair owned by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub id: u32,
    pub if_index: u32,
    pub name: String,
    pub if_type: u32,
    pub mac: Option<MacAddress>,
    /// Address with the mask actually in use; `None` for unnumbered links.
    pub address: Option<IpNetwork>,
    /// The mask was inferred because the source did not report one.
    #[serde(default)]
    pub synthetic_mask: bool,
    /// Address lies in one of the owning cluster's sync networks.
    #[serde(default)]
    pub cluster_sync: bool,
    #[serde(default)]
    pub subnet_id: Option<u32>,
    #[serde(default)]
    pub admin_state: LinkState,
    #[serde(default)]
    pub oper_state: LinkState,
    #[serde(default)]
    pub status: ObjectStatus,
    #[serde(default = "managed_default")]
    pub managed: bool,
}

fn managed_default() -> bool {
    true
}

impl Interface {
    pub fn from_discovered(id: u32, info: &InterfaceInfo) -> Self {
        Self {
            id,
            if_index: info.index,
            name: info.name.clone(),
            if_type: info.if_type,
            mac: info.mac.clone(),
            address: info.address,
            synthetic_mask: false,
            cluster_sync: false,
            subnet_id: None,
            admin_state: LinkState::Unknown,
            oper_state: LinkState::Unknown,
            status: ObjectStatus::Unknown,
            managed: true,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.address.map(|net| net.ip())
    }

    pub fn prefix(&self) -> u8 {
        self.address.map_or(0, |net| net.prefix())
    }

    pub fn is_nat_adapter(&self) -> bool {
        self.if_type == IFTYPE_NAT_ADAPTER
    }

    /// Same (ifIndex, address, mask) triple as a discovered row.
    ///
    /// A row without a mask matches an interface whose mask was inferred.
    pub fn matches(&self, info: &InterfaceInfo) -> bool {
        if self.if_index != info.index {
            return false;
        }
        match (self.address, info.address) {
            (None, None) => true,
            (Some(have), Some(seen)) => {
                have.ip() == seen.ip()
                    && (have.prefix() == seen.prefix() || (seen.prefix() == 0 && self.synthetic_mask))
            }
            _ => false,
        }
    }

    /// Whether this child takes part in status polling.
    pub fn is_pollable(&self) -> bool {
        self.managed && !self.cluster_sync
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use netpoll_transport::IFTYPE_ETHERNET;

    fn row(index: u32, address: &str) -> InterfaceInfo {
        InterfaceInfo {
            index,
            name: format!("eth{index}"),
            if_type: IFTYPE_ETHERNET,
            mac: None,
            address: Some(address.parse().unwrap()),
        }
    }

    #[test]
    fn matches_requires_same_triple() {
        let iface = Interface::from_discovered(10, &row(1, "10.0.0.1/24"));
        assert!(iface.matches(&row(1, "10.0.0.1/24")));
        assert!(!iface.matches(&row(1, "10.0.0.1/16")));
        assert!(!iface.matches(&row(2, "10.0.0.1/24")));
    }

    #[test]
    fn maskless_row_matches_synthetic_mask() {
        let mut iface = Interface::from_discovered(10, &row(1, "10.0.0.1/24"));
        iface.synthetic_mask = true;
        assert!(iface.matches(&row(1, "10.0.0.1/0")));
        iface.synthetic_mask = false;
        assert!(!iface.matches(&row(1, "10.0.0.1/0")));
    }

    #[test]
    fn admin_down_means_disabled() {
        assert_eq!(link_status(LinkState::Down, LinkState::Up), ObjectStatus::Disabled);
        assert_eq!(link_status(LinkState::Up, LinkState::Down), ObjectStatus::Critical);
        assert_eq!(link_status(LinkState::Up, LinkState::Up), ObjectStatus::Normal);
        assert_eq!(LinkState::from_mib(7), LinkState::Unknown);
    }
}

// ── Network service (node child) ──

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::status::ObjectStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceType {
    Custom,
    Ssh,
    Pop3,
    Smtp,
    Ftp,
    Http,
    Https,
    Telnet,
}

impl ServiceType {
    /// Code used by the agent's service checker.
    pub fn code(self) -> u8 {
        match self {
            Self::Custom => 0,
            Self::Ssh => 1,
            Self::Pop3 => 2,
            Self::Smtp => 3,
            Self::Ftp => 4,
            Self::Http => 5,
            Self::Https => 6,
            Self::Telnet => 7,
        }
    }
}

/// A TCP service checked from the node's poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkService {
    pub id: u32,
    pub name: String,
    pub service_type: ServiceType,
    /// Target address; the node's primary address when unset.
    #[serde(default)]
    pub address: Option<IpAddr>,
    pub port: u16,
    #[serde(default)]
    pub status: ObjectStatus,
    #[serde(default = "managed_default")]
    pub managed: bool,
}

fn managed_default() -> bool {
    true
}

impl NetworkService {
    /// Agent parameter that runs the check and returns "0" on success.
    pub fn check_parameter(&self, primary: IpAddr) -> String {
        let address = self.address.unwrap_or(primary);
        format!(
            "Net.Service.Check({},{},{})",
            self.service_type.code(),
            address,
            self.port
        )
    }
}

// ── Local host introspection ──
//
// Interface discovery for the management server's own node, read
// straight from the OS instead of going through SNMP or an agent.

use ipnetwork::IpNetwork;
use pnet::datalink;
use tracing::debug;

use crate::error::Error;
use crate::types::{IFTYPE_ETHERNET, IFTYPE_SOFTWARE_LOOPBACK, InterfaceInfo, MacAddress};

/// A source of interface rows that needs no network round-trip.
pub trait InterfaceSource: Send + Sync {
    fn interface_list(&self) -> Result<Vec<InterfaceInfo>, Error>;
}

/// Reads the interface table of the host this process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalHost;

impl InterfaceSource for LocalHost {
    fn interface_list(&self) -> Result<Vec<InterfaceInfo>, Error> {
        let interfaces = datalink::interfaces();
        if interfaces.is_empty() {
            return Err(Error::Local("no interfaces reported by the OS".into()));
        }
        debug!(count = interfaces.len(), "enumerated local interfaces");

        let mut rows = Vec::new();
        for iface in &interfaces {
            let if_type = if iface.is_loopback() {
                IFTYPE_SOFTWARE_LOOPBACK
            } else {
                IFTYPE_ETHERNET
            };
            let mac = iface
                .mac
                .map(|m| MacAddress::new(m.to_string()))
                .filter(|m| !m.is_zero());

            let addresses: Vec<IpNetwork> = iface
                .ips
                .iter()
                .filter_map(|net| IpNetwork::new(net.ip(), net.prefix()).ok())
                .collect();

            if addresses.is_empty() {
                rows.push(InterfaceInfo {
                    index: iface.index,
                    name: iface.name.clone(),
                    if_type,
                    mac,
                    address: None,
                });
                continue;
            }
            rows.extend(addresses.into_iter().map(|address| InterfaceInfo {
                index: iface.index,
                name: iface.name.clone(),
                if_type,
                mac: mac.clone(),
                address: Some(address),
            }));
        }
        Ok(rows)
    }
}

// ── SNMP transport ──
//
// `SnmpTransport` is the per-target request surface the engine uses.
// `UdpSnmpTransport` implements it over a lazily opened `snmp2`
// session; every request is bounded by the target's timeout.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use snmp2::{AsyncSession, Oid, Value};
use strum::{Display, EnumString};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::trace;

use crate::agent::AgentEndpoint;
use crate::error::SnmpError;

/// SNMP v1 noSuchName error status.
const ERR_NO_SUCH_NAME: u32 = 2;

// ── Values ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SnmpVersion {
    V1,
    #[default]
    V2c,
}

impl SnmpVersion {
    /// The other version, tried during negotiation.
    pub fn fallback(self) -> Self {
        match self {
            Self::V1 => Self::V2c,
            Self::V2c => Self::V1,
        }
    }
}

/// An owned SNMP variable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpValue {
    Integer(i64),
    Unsigned(u64),
    Timeticks(u32),
    OctetString(Vec<u8>),
    ObjectId(String),
    IpAddress(Ipv4Addr),
    Null,
}

impl SnmpValue {
    /// Numeric view; octet strings holding decimal text are accepted too.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Unsigned(v) => i64::try_from(*v).ok(),
            Self::Timeticks(v) => Some(i64::from(*v)),
            Self::OctetString(bytes) => String::from_utf8_lossy(bytes).trim().parse().ok(),
            _ => None,
        }
    }

    /// Text view used for sysDescr, sysName, ifDescr.
    pub fn as_text(&self) -> String {
        match self {
            Self::OctetString(bytes) => String::from_utf8_lossy(bytes)
                .trim_end_matches('\0')
                .to_owned(),
            Self::ObjectId(oid) => oid.clone(),
            Self::Integer(v) => v.to_string(),
            Self::Unsigned(v) => v.to_string(),
            Self::Timeticks(v) => v.to_string(),
            Self::IpAddress(ip) => ip.to_string(),
            Self::Null => String::new(),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::OctetString(bytes) => Some(bytes),
            _ => None,
        }
    }
}

// ── Contract ────────────────────────────────────────────────────────

/// Addressing and credentials for one SNMP agent.
#[derive(Debug, Clone)]
pub struct SnmpTarget {
    pub address: IpAddr,
    pub port: u16,
    pub version: SnmpVersion,
    pub community: SecretString,
    /// Tunnel requests through this agent instead of sending UDP directly.
    pub proxy: Option<AgentEndpoint>,
    pub timeout: Duration,
    pub retries: u32,
}

/// Request surface for one SNMP agent.
#[async_trait]
pub trait SnmpTransport: Send + Sync {
    async fn get(&self, oid: &str) -> Result<SnmpValue, SnmpError>;

    /// Walk the subtree under `root`, calling `handler` for each variable
    /// until the subtree ends or the handler breaks.
    async fn enumerate(
        &self,
        root: &str,
        handler: &mut (dyn for<'a, 'b> FnMut(&'a str, &'b SnmpValue) -> ControlFlow<()> + Send),
    ) -> Result<(), SnmpError>;

    /// Collect a whole subtree.
    async fn walk(&self, root: &str) -> Result<Vec<(String, SnmpValue)>, SnmpError> {
        let mut rows = Vec::new();
        self.enumerate(root, &mut |oid, value| {
            rows.push((oid.to_owned(), value.clone()));
            ControlFlow::Continue(())
        })
        .await?;
        Ok(rows)
    }
}

/// Factory for SNMP transports.
pub trait SnmpConnector: Send + Sync {
    fn open(&self, target: &SnmpTarget) -> Result<Box<dyn SnmpTransport>, SnmpError>;
}

// ── UDP implementation ──────────────────────────────────────────────

/// Opens direct UDP transports.
///
/// Targets with an agent proxy fail with [`SnmpError::Unsupported`];
/// tunnelling SNMP needs the agent wire protocol, which is not part of
/// this crate. Nodes behind an SNMP proxy therefore have no SNMP path
/// when this connector is the only one configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpSnmpConnector;

impl SnmpConnector for UdpSnmpConnector {
    fn open(&self, target: &SnmpTarget) -> Result<Box<dyn SnmpTransport>, SnmpError> {
        if target.proxy.is_some() {
            return Err(SnmpError::Unsupported("SNMP through an agent proxy"));
        }
        Ok(Box::new(UdpSnmpTransport::new(target)))
    }
}

pub struct UdpSnmpTransport {
    destination: SocketAddr,
    community: Vec<u8>,
    version: SnmpVersion,
    timeout: Duration,
    retries: u32,
    session: Mutex<Option<AsyncSession>>,
}

impl UdpSnmpTransport {
    pub fn new(target: &SnmpTarget) -> Self {
        Self {
            destination: SocketAddr::new(target.address, target.port),
            community: target.community.expose_secret().as_bytes().to_vec(),
            version: target.version,
            timeout: target.timeout,
            retries: target.retries,
            session: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<MutexGuard<'_, Option<AsyncSession>>, SnmpError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let opened = match self.version {
                SnmpVersion::V1 => AsyncSession::new_v1(self.destination, &self.community, 0).await,
                SnmpVersion::V2c => {
                    AsyncSession::new_v2c(self.destination, &self.community, 0).await
                }
            }
            .map_err(|e| SnmpError::Comm {
                reason: e.to_string(),
            })?;
            *guard = Some(opened);
        }
        Ok(guard)
    }
}

#[async_trait]
impl SnmpTransport for UdpSnmpTransport {
    async fn get(&self, oid: &str) -> Result<SnmpValue, SnmpError> {
        let arcs = parse_oid(oid)?;
        let request = Oid::from(arcs.as_slice()).map_err(|_| SnmpError::InvalidOid(oid.into()))?;
        let mut guard = self.session().await?;
        let Some(session) = guard.as_mut() else {
            return Err(SnmpError::Comm {
                reason: "session not open".into(),
            });
        };

        let mut last = SnmpError::Timeout;
        for attempt in 0..=self.retries {
            match timeout(self.timeout, session.get(&request)).await {
                Ok(Ok(mut pdu)) => {
                    if pdu.error_status == ERR_NO_SUCH_NAME {
                        return Err(SnmpError::NoSuchObject);
                    }
                    if pdu.error_status != 0 {
                        return Err(SnmpError::Comm {
                            reason: format!("error status {}", pdu.error_status),
                        });
                    }
                    return match pdu.varbinds.next() {
                        Some((_, value)) => convert(&value),
                        None => Err(SnmpError::NoSuchObject),
                    };
                }
                Ok(Err(e)) => {
                    last = SnmpError::Comm {
                        reason: e.to_string(),
                    };
                }
                Err(_) => last = SnmpError::Timeout,
            }
            trace!(oid, attempt, "SNMP GET retry");
        }
        Err(last)
    }

    async fn enumerate(
        &self,
        root: &str,
        handler: &mut (dyn for<'a, 'b> FnMut(&'a str, &'b SnmpValue) -> ControlFlow<()> + Send),
    ) -> Result<(), SnmpError> {
        let root_arcs = parse_oid(root)?;
        let mut current = root_arcs.clone();
        let mut guard = self.session().await?;
        let Some(session) = guard.as_mut() else {
            return Err(SnmpError::Comm {
                reason: "session not open".into(),
            });
        };

        loop {
            let request = Oid::from(current.as_slice())
                .map_err(|_| SnmpError::InvalidOid(format_oid(&current)))?;
            let row = match timeout(self.timeout, session.getnext(&request)).await {
                Ok(Ok(mut pdu)) if pdu.error_status == 0 => match pdu.varbinds.next() {
                    Some((next, value)) => convert(&value).ok().map(|v| (next.to_string(), v)),
                    None => None,
                },
                Ok(Ok(_)) => None,
                Ok(Err(e)) => {
                    return Err(SnmpError::Comm {
                        reason: e.to_string(),
                    });
                }
                Err(_) => return Err(SnmpError::Timeout),
            };

            let Some((name, value)) = row else { break };
            let arcs = parse_oid(&name)?;
            // Stop at the end of the subtree or if the agent goes backwards.
            if !arcs.starts_with(&root_arcs) || arcs <= current {
                break;
            }
            if handler(&format_oid(&arcs), &value).is_break() {
                break;
            }
            current = arcs;
        }
        Ok(())
    }
}

fn convert(value: &Value<'_>) -> Result<SnmpValue, SnmpError> {
    Ok(match value {
        Value::Integer(v) => SnmpValue::Integer(*v),
        Value::Counter32(v) | Value::Unsigned32(v) => SnmpValue::Unsigned(u64::from(*v)),
        Value::Counter64(v) => SnmpValue::Unsigned(*v),
        Value::Timeticks(v) => SnmpValue::Timeticks(*v),
        Value::OctetString(bytes) => SnmpValue::OctetString(bytes.to_vec()),
        Value::ObjectIdentifier(oid) => SnmpValue::ObjectId(format!(".{oid}")),
        Value::IpAddress(octets) => SnmpValue::IpAddress(Ipv4Addr::from(*octets)),
        Value::EndOfMibView | Value::NoSuchObject | Value::NoSuchInstance => {
            return Err(SnmpError::NoSuchObject);
        }
        _ => SnmpValue::Null,
    })
}

// ── OID text helpers ────────────────────────────────────────────────

/// Parse dotted OID text, with or without the leading dot.
pub fn parse_oid(text: &str) -> Result<Vec<u64>, SnmpError> {
    let trimmed = text.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return Err(SnmpError::InvalidOid(text.into()));
    }
    trimmed
        .split('.')
        .map(|arc| arc.parse::<u64>().map_err(|_| SnmpError::InvalidOid(text.into())))
        .collect()
}

/// Render arcs in the leading-dot form used throughout the engine.
pub fn format_oid(arcs: &[u64]) -> String {
    arcs.iter().map(|a| format!(".{a}")).collect()
}

/// Last arc of an OID, which is the table index for single-index tables.
pub fn oid_suffix(oid: &str, root: &str) -> Option<String> {
    let rest = oid.strip_prefix(root)?;
    Some(rest.trim_start_matches('.').to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn parses_with_and_without_leading_dot() {
        assert_eq!(parse_oid(".1.3.6.1").unwrap(), vec![1, 3, 6, 1]);
        assert_eq!(parse_oid("1.3.6.1").unwrap(), vec![1, 3, 6, 1]);
        assert_err!(parse_oid(""));
        assert_err!(parse_oid(".1.x.3"));
    }

    #[test]
    fn formats_with_leading_dot() {
        assert_eq!(format_oid(&[1, 3, 6, 1, 2, 1, 1, 2, 0]), ".1.3.6.1.2.1.1.2.0");
    }

    #[test]
    fn suffix_extracts_table_index() {
        let idx = oid_suffix(".1.3.6.1.2.1.4.20.1.2.10.0.0.1", ".1.3.6.1.2.1.4.20.1.2");
        assert_eq!(idx.as_deref(), Some("10.0.0.1"));
        assert!(oid_suffix(".1.3.6.2", ".1.3.6.1").is_none());
    }

    #[test]
    fn value_views() {
        assert_eq!(SnmpValue::OctetString(b"42 ".to_vec()).as_i64(), Some(42));
        assert_eq!(SnmpValue::Timeticks(100).as_i64(), Some(100));
        assert_eq!(SnmpValue::OctetString(b"router\0".to_vec()).as_text(), "router");
        assert!(SnmpValue::Null.as_i64().is_none());
    }

    #[test]
    fn version_fallback_alternates() {
        assert_eq!(SnmpVersion::V2c.fallback(), SnmpVersion::V1);
        assert_eq!("v1".parse::<SnmpVersion>().unwrap(), SnmpVersion::V1);
    }

    #[test]
    fn udp_connector_rejects_proxy_targets() {
        let target = SnmpTarget {
            address: "192.0.2.1".parse().unwrap(),
            port: 161,
            version: SnmpVersion::V2c,
            community: SecretString::from("public".to_owned()),
            proxy: Some(AgentEndpoint {
                address: "192.0.2.254".parse().unwrap(),
                port: 4700,
                auth: crate::AgentAuth::None,
                secret: SecretString::from(String::new()),
            }),
            timeout: Duration::from_secs(1),
            retries: 0,
        };
        assert!(matches!(
            UdpSnmpConnector.open(&target),
            Err(SnmpError::Unsupported(_))
        ));
    }
}

//! Configuration for the netpoll daemon.
//!
//! A TOML file layered over built-in defaults and `NETPOLL_` environment
//! variables, translated into `netpoll_core::PollerConfig` plus a static
//! node inventory that is provisioned on startup.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use netpoll_core::{
    AgentDefaults, DemotionPolicy, NameSettings, NodeFlags, NodeRecord, NodeType, OidTypeRule,
    PollerConfig, SnmpDefaults, StatusAlgorithm,
};
use netpoll_transport::{AgentAuth, SnmpVersion};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub poller: PollerSection,

    #[serde(default)]
    pub names: NamesSection,

    #[serde(default)]
    pub snmp: SnmpSection,

    #[serde(default)]
    pub agent: AgentSection,

    /// Node that runs service checks for nodes without a poller node.
    pub management_node_id: Option<u32>,

    /// JSON state file; defaults to the platform data directory.
    pub state_file: Option<PathBuf>,

    /// Nodes provisioned at startup when they are not already known.
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,

    /// Extra sysObjectID prefix rules, consulted before the built-in table.
    #[serde(default)]
    pub oid_types: Vec<OidTypeEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollerSection {
    pub status_interval_secs: u64,
    pub configuration_interval_secs: u64,
    pub scheduler_tick_secs: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub capability_expiration_secs: u64,
    pub demotion_policy: DemotionPolicy,
    pub cache_ttl_secs: u64,
    pub status: StatusAlgorithm,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            status_interval_secs: 60,
            configuration_interval_secs: 3600,
            scheduler_tick_secs: 5,
            workers: 10,
            queue_capacity: 250,
            capability_expiration_secs: 604_800,
            demotion_policy: DemotionPolicy::default(),
            cache_ttl_secs: 300,
            status: StatusAlgorithm::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NamesSection {
    pub resolve_by_ip: bool,
    pub sync_with_dns: bool,
    pub use_fqdn: bool,
    pub resolve_address_each_poll: bool,
    pub dns_timeout_ms: u64,
}

impl Default for NamesSection {
    fn default() -> Self {
        Self {
            resolve_by_ip: true,
            sync_with_dns: false,
            use_fqdn: false,
            resolve_address_each_poll: false,
            dns_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SnmpSection {
    pub port: u16,
    /// Plaintext; prefer `NETPOLL_SNMP__COMMUNITIES` in production.
    pub communities: Vec<String>,
    pub timeout_ms: u64,
    pub retries: u32,
    pub checkpoint_port: u16,
    pub enable_checkpoint: bool,
    pub test_oid: String,
}

impl Default for SnmpSection {
    fn default() -> Self {
        Self {
            port: 161,
            communities: vec!["public".into()],
            timeout_ms: 1500,
            retries: 1,
            checkpoint_port: 260,
            enable_checkpoint: true,
            test_oid: ".1.3.6.1.2.1.1.2.0".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSection {
    pub port: u16,
    pub default_secret: String,
    pub timeout_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            port: 4700,
            default_secret: "netxms".into(),
            timeout_ms: 5000,
        }
    }
}

/// One statically configured node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeEntry {
    /// Zero lets the engine allocate one.
    #[serde(default)]
    pub id: u32,
    pub name: String,
    pub address: IpAddr,
    /// DNS name re-resolved into the primary address.
    pub hostname: Option<String>,
    #[serde(default)]
    pub zone: u32,
    pub snmp_community: Option<String>,
    pub snmp_version: Option<SnmpVersion>,
    pub snmp_port: Option<u16>,
    pub agent_port: Option<u16>,
    pub agent_auth: Option<AgentAuth>,
    pub agent_secret: Option<String>,
    pub proxy_node: Option<u32>,
    pub snmp_proxy_node: Option<u32>,
    pub poller_node: Option<u32>,
    #[serde(default)]
    pub disable_snmp: bool,
    #[serde(default)]
    pub disable_agent: bool,
    #[serde(default)]
    pub custom_attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OidTypeEntry {
    pub prefix: String,
    pub node_type: NodeType,
    /// Capability flag names such as `IS_ROUTER`.
    #[serde(default)]
    pub flags: Vec<String>,
}

// ── Config file path ────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "netpoll", "netpoll")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("netpoll.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn default_state_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("netpoll-state.json"),
        |dirs| dirs.data_dir().join("state.json"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file at `path` (missing is fine), then
/// `NETPOLL_` variables with `__` separating nested keys.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("NETPOLL_").split("__"))
}

/// Load and validate the configuration. `None` uses [`config_path`].
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    config.validate()?;
    Ok(config)
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Validation and translation ──────────────────────────────────────

fn secs(field: &str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn millis(field: &str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn parse_flags(field: &str, names: &[String]) -> Result<NodeFlags, ConfigError> {
    names.iter().try_fold(NodeFlags::empty(), |acc, name| {
        NodeFlags::from_name(&name.to_ascii_uppercase())
            .map(|flag| acc | flag)
            .ok_or_else(|| invalid(field, format!("unknown flag '{name}'")))
    })
}

fn valid_oid(oid: &str) -> bool {
    oid.strip_prefix('.')
        .is_some_and(|rest| !rest.is_empty() && rest.split('.').all(|arc| arc.parse::<u32>().is_ok()))
}

impl Config {
    /// Check everything that translation would otherwise reject later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poller_config()?;
        self.inventory()?;
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(default_state_path)
    }

    /// Runtime settings for the engine.
    pub fn poller_config(&self) -> Result<PollerConfig, ConfigError> {
        let p = &self.poller;
        if p.workers == 0 {
            return Err(invalid("poller.workers", "must be greater than zero"));
        }
        if p.queue_capacity == 0 {
            return Err(invalid("poller.queue_capacity", "must be greater than zero"));
        }
        if let StatusAlgorithm::SingleThreshold { percent } = p.status {
            if percent == 0 || percent > 100 {
                return Err(invalid("poller.status.percent", "expected 1..=100"));
            }
        }
        if self.snmp.communities.is_empty() {
            return Err(invalid("snmp.communities", "at least one community is required"));
        }
        if !valid_oid(&self.snmp.test_oid) {
            return Err(invalid(
                "snmp.test_oid",
                format!("'{}' is not a dotted numeric OID", self.snmp.test_oid),
            ));
        }

        let oid_types = self
            .oid_types
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                if !valid_oid(&rule.prefix) {
                    return Err(invalid(
                        format!("oid_types[{i}].prefix"),
                        format!("'{}' is not a dotted numeric OID", rule.prefix),
                    ));
                }
                Ok(OidTypeRule {
                    prefix: rule.prefix.clone(),
                    node_type: rule.node_type,
                    flags: parse_flags(&format!("oid_types[{i}].flags"), &rule.flags)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PollerConfig {
            status_interval: secs("poller.status_interval_secs", p.status_interval_secs)?,
            configuration_interval: secs(
                "poller.configuration_interval_secs",
                p.configuration_interval_secs,
            )?,
            scheduler_tick: secs("poller.scheduler_tick_secs", p.scheduler_tick_secs)?,
            workers: p.workers,
            queue_capacity: p.queue_capacity,
            capability_expiration: secs(
                "poller.capability_expiration_secs",
                p.capability_expiration_secs,
            )?,
            demotion_policy: p.demotion_policy,
            cache_ttl: secs("poller.cache_ttl_secs", p.cache_ttl_secs)?,
            status_algorithm: p.status,
            management_node: self.management_node_id,
            names: NameSettings {
                resolve_by_ip: self.names.resolve_by_ip,
                sync_with_dns: self.names.sync_with_dns,
                use_fqdn: self.names.use_fqdn,
                resolve_address_each_poll: self.names.resolve_address_each_poll,
                dns_timeout: millis("names.dns_timeout_ms", self.names.dns_timeout_ms)?,
            },
            snmp: SnmpDefaults {
                port: self.snmp.port,
                communities: self
                    .snmp
                    .communities
                    .iter()
                    .map(|c| SecretString::from(c.clone()))
                    .collect(),
                timeout: millis("snmp.timeout_ms", self.snmp.timeout_ms)?,
                retries: self.snmp.retries,
                checkpoint_port: self.snmp.checkpoint_port,
                enable_checkpoint: self.snmp.enable_checkpoint,
                test_oid: self.snmp.test_oid.clone(),
            },
            agent: AgentDefaults {
                port: self.agent.port,
                default_secret: SecretString::from(self.agent.default_secret.clone()),
                timeout: millis("agent.timeout_ms", self.agent.timeout_ms)?,
            },
            oid_types,
        })
    }

    /// Node records for the `[[nodes]]` inventory.
    ///
    /// Ids and `(zone, address)` pairs must be unique across the
    /// inventory; proxies may point at nodes outside it.
    pub fn inventory(&self) -> Result<Vec<NodeRecord>, ConfigError> {
        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        let mut records = Vec::with_capacity(self.nodes.len());

        for (i, entry) in self.nodes.iter().enumerate() {
            let field = |name: &str| format!("nodes[{i}].{name}");
            if entry.name.trim().is_empty() {
                return Err(invalid(field("name"), "must not be empty"));
            }
            if entry.id != 0 && !ids.insert(entry.id) {
                return Err(invalid(field("id"), format!("duplicate node id {}", entry.id)));
            }
            if !addresses.insert((entry.zone, entry.address)) {
                return Err(invalid(
                    field("address"),
                    format!("{} already used in zone {}", entry.address, entry.zone),
                ));
            }
            if entry.proxy_node.is_some_and(|p| p == entry.id && p != 0) {
                return Err(invalid(field("proxy_node"), "a node cannot proxy itself"));
            }

            let mut record = NodeRecord::new(entry.id, entry.name.clone(), entry.address);
            record.primary_name = entry.hostname.clone().unwrap_or_default();
            record.zone_id = entry.zone;
            if let Some(version) = entry.snmp_version {
                record.snmp_version = version;
            }
            record.snmp_port = entry.snmp_port.unwrap_or(self.snmp.port);
            record.snmp_community = entry.snmp_community.clone().unwrap_or_default();
            record.agent_port = entry.agent_port.unwrap_or(self.agent.port);
            if let Some(auth) = entry.agent_auth {
                record.agent_auth = auth;
            }
            record.agent_secret = entry.agent_secret.clone().unwrap_or_default();
            record.proxy_node = entry.proxy_node;
            record.snmp_proxy_node = entry.snmp_proxy_node;
            record.poller_node = entry.poller_node;
            record.flags.set(NodeFlags::DISABLE_SNMP, entry.disable_snmp);
            record.flags.set(NodeFlags::DISABLE_AGENT, entry.disable_agent);
            record.custom_attributes.clone_from(&entry.custom_attributes);
            records.push(record);
        }

        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use figment::Jail;
    use pretty_assertions::assert_eq;

    use super::*;

    // Every loader test runs in a jail so environment overrides set by
    // one test never leak into another.
    fn load_in(jail: &mut Jail, contents: &str) -> Result<Config, ConfigError> {
        jail.create_file("netpoll.toml", contents).unwrap();
        load_config(Some(Path::new("netpoll.toml")))
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_| {
            let config = load_config(Some(Path::new("absent.toml"))).unwrap();
            let poller = config.poller_config().unwrap();

            assert_eq!(poller.status_interval, Duration::from_secs(60));
            assert_eq!(poller.capability_expiration, Duration::from_secs(604_800));
            assert_eq!(poller.demotion_policy, DemotionPolicy::SuppressWhileUnreachable);
            assert_eq!(poller.snmp.communities.len(), 1);
            assert!(config.inventory().unwrap().is_empty());
            Ok(())
        });
    }

    #[test]
    fn file_values_reach_the_engine() {
        Jail::expect_with(|jail| {
            let config = load_in(
                jail,
                r#"
                management_node_id = 1
                state_file = "/var/lib/netpoll/state.json"

                [poller]
                workers = 4
                demotion_policy = "always"
                status = { algorithm = "single-threshold", percent = 60 }

                [snmp]
                communities = ["private", "public"]

                [[nodes]]
                id = 7
                name = "core-sw"
                address = "10.0.0.2"
                snmp_version = "v1"
                snmp_proxy_node = 1
                disable_agent = true

                [[oid_types]]
                prefix = ".1.3.6.1.4.1.9"
                node_type = "router"
                flags = ["is_router"]
                "#,
            )
            .unwrap();

            let poller = config.poller_config().unwrap();
            assert_eq!(poller.workers, 4);
            assert_eq!(poller.demotion_policy, DemotionPolicy::Always);
            assert_eq!(poller.status_algorithm, StatusAlgorithm::SingleThreshold { percent: 60 });
            assert_eq!(poller.management_node, Some(1));
            assert_eq!(poller.snmp.communities.len(), 2);
            assert_eq!(poller.oid_types[0].node_type, NodeType::Router);
            assert_eq!(poller.oid_types[0].flags, NodeFlags::IS_ROUTER);
            assert_eq!(config.state_path(), PathBuf::from("/var/lib/netpoll/state.json"));

            let nodes = config.inventory().unwrap();
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, 7);
            assert_eq!(nodes[0].snmp_version, SnmpVersion::V1);
            assert_eq!(nodes[0].snmp_proxy_node, Some(1));
            assert!(nodes[0].flags.contains(NodeFlags::DISABLE_AGENT));
            assert!(!nodes[0].flags.contains(NodeFlags::DISABLE_SNMP));
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_the_file() {
        Jail::expect_with(|jail| {
            jail.set_env("NETPOLL_POLLER__WORKERS", "16");
            jail.set_env("NETPOLL_NAMES__USE_FQDN", "true");

            let config = load_in(jail, "[poller]\nworkers = 4\n").unwrap();
            assert_eq!(config.poller.workers, 16);
            assert!(config.names.use_fqdn);
            Ok(())
        });
    }

    #[test]
    fn zero_interval_is_rejected() {
        Jail::expect_with(|jail| {
            let err = load_in(jail, "[poller]\nstatus_interval_secs = 0\n").unwrap_err();
            assert!(
                matches!(&err, ConfigError::Validation { field, .. } if field == "poller.status_interval_secs"),
                "{err}"
            );
            Ok(())
        });
    }

    #[test]
    fn duplicate_inventory_addresses_are_rejected() {
        Jail::expect_with(|jail| {
            let err = load_in(
                jail,
                r#"
                [[nodes]]
                name = "a"
                address = "10.0.0.1"

                [[nodes]]
                name = "b"
                address = "10.0.0.1"
                zone = 2

                [[nodes]]
                name = "c"
                address = "10.0.0.1"
                "#,
            )
            .unwrap_err();
            assert!(
                matches!(&err, ConfigError::Validation { field, .. } if field == "nodes[2].address"),
                "{err}"
            );
            Ok(())
        });
    }

    #[test]
    fn unknown_flag_names_are_rejected() {
        Jail::expect_with(|jail| {
            let err = load_in(
                jail,
                "[[oid_types]]\nprefix = \".1.3.6.1.4.1.9\"\nnode_type = \"switch\"\nflags = [\"IS_TOASTER\"]\n",
            )
            .unwrap_err();
            assert!(err.to_string().contains("IS_TOASTER"), "{err}");
            Ok(())
        });
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.poller.workers = 3;
        config.management_node_id = Some(9);
        save_config(&config, &path).unwrap();

        Jail::expect_with(|_| {
            let loaded = load_config(Some(&path)).unwrap();
            assert_eq!(loaded.poller.workers, 3);
            assert_eq!(loaded.management_node_id, Some(9));
            Ok(())
        });
    }

    #[test]
    fn oid_validation() {
        assert!(valid_oid(".1.3.6.1.2.1.1.2.0"));
        assert!(!valid_oid("1.3.6"));
        assert!(!valid_oid("."));
        assert!(!valid_oid(".1.x.3"));
    }
}

// Shared test doubles: a scripted network of SNMP and agent devices, a
// recording event sink and a table-driven name resolver.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ipnetwork::IpNetwork;
use secrecy::ExposeSecret;
use netpoll_core::{
    ConfigPollOutcome, Event, EventCode, EventSink, ManualClock, MemoryStore, NameResolver, Node,
    NodeRecord, Poller, PollerConfig, Transports,
};
use netpoll_transport::{
    AgentConnector, AgentError, AgentSession, AgentTarget, ArpEntry, IFTYPE_ETHERNET,
    InterfaceInfo, InterfaceSource, ParameterInfo, RouteEntry, SnmpConnector, SnmpError, SnmpTarget,
    SnmpTransport, SnmpValue,
};

pub const SYS_OBJECT_ID: &str = ".1.3.6.1.2.1.1.2.0";
pub const SYS_DESCR: &str = ".1.3.6.1.2.1.1.1.0";

const IF_INDEX: &str = ".1.3.6.1.2.1.2.2.1.1";
const IF_DESCR: &str = ".1.3.6.1.2.1.2.2.1.2";
const IF_TYPE: &str = ".1.3.6.1.2.1.2.2.1.3";
const IF_ADMIN_STATUS: &str = ".1.3.6.1.2.1.2.2.1.7";
const IF_OPER_STATUS: &str = ".1.3.6.1.2.1.2.2.1.8";
const IP_AD_ENT_IF_INDEX: &str = ".1.3.6.1.2.1.4.20.1.2";
const IP_AD_ENT_NET_MASK: &str = ".1.3.6.1.2.1.4.20.1.3";

pub fn ip(text: &str) -> IpAddr {
    text.parse().unwrap()
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

// ── Devices ─────────────────────────────────────────────────────────

/// One simulated host. SNMP answers on port 161 only.
#[derive(Default)]
pub struct Device {
    pub snmp_up: AtomicBool,
    pub agent_up: AtomicBool,
    snmp: Mutex<BTreeMap<String, SnmpValue>>,
    agent_params: Mutex<BTreeMap<String, String>>,
    agent_interfaces: Mutex<Vec<InterfaceInfo>>,
    agent_secret: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl Device {
    /// An SNMP-only host with the given interfaces.
    pub fn snmp(interfaces: &[(u32, &str, &str)]) -> Arc<Self> {
        let device = Arc::new(Self::default());
        device.snmp_up.store(true, Ordering::SeqCst);
        device.set_oid(SYS_OBJECT_ID, SnmpValue::ObjectId(".1.3.6.1.4.1.8072.3.2.10".into()));
        device.set_oid(SYS_DESCR, SnmpValue::OctetString(b"Linux test 6.1".to_vec()));
        device.set_interfaces(interfaces);
        device
    }

    /// An agent-only host.
    pub fn agent(interfaces: Vec<InterfaceInfo>) -> Arc<Self> {
        let device = Arc::new(Self::default());
        device.agent_up.store(true, Ordering::SeqCst);
        device.set_param("Agent.Version", "3.9.1");
        device.set_param("System.PlatformName", "linux-x64");
        *device.agent_interfaces.lock().unwrap() = interfaces;
        device
    }

    pub fn set_oid(&self, oid: &str, value: SnmpValue) {
        self.snmp.lock().unwrap().insert(oid.to_owned(), value);
    }

    pub fn set_param(&self, name: &str, value: &str) {
        self.agent_params.lock().unwrap().insert(name.to_owned(), value.to_owned());
    }

    /// Replace the interface and address tables. Each entry is
    /// (ifIndex, name, "address/prefix").
    pub fn set_interfaces(&self, interfaces: &[(u32, &str, &str)]) {
        let mut table = self.snmp.lock().unwrap();
        table.retain(|oid, _| {
            ![IF_INDEX, IF_DESCR, IF_TYPE, IP_AD_ENT_IF_INDEX, IP_AD_ENT_NET_MASK]
                .iter()
                .any(|root| oid.starts_with(&format!("{root}.")))
        });
        for &(index, name, address) in interfaces {
            table.insert(format!("{IF_INDEX}.{index}"), SnmpValue::Integer(i64::from(index)));
            table.insert(format!("{IF_DESCR}.{index}"), SnmpValue::OctetString(name.as_bytes().to_vec()));
            table.insert(format!("{IF_TYPE}.{index}"), SnmpValue::Integer(i64::from(IFTYPE_ETHERNET)));
            let net: IpNetwork = address.parse().unwrap();
            let IpNetwork::V4(v4) = net else {
                continue;
            };
            table.insert(
                format!("{IP_AD_ENT_IF_INDEX}.{}", v4.ip()),
                SnmpValue::Integer(i64::from(index)),
            );
            table.insert(format!("{IP_AD_ENT_NET_MASK}.{}", v4.ip()), SnmpValue::IpAddress(v4.mask()));
        }
    }

    /// Script ifAdminStatus/ifOperStatus for one interface.
    pub fn set_link(&self, index: u32, admin: i64, oper: i64) {
        self.set_oid(&format!("{IF_ADMIN_STATUS}.{index}"), SnmpValue::Integer(admin));
        self.set_oid(&format!("{IF_OPER_STATUS}.{index}"), SnmpValue::Integer(oper));
    }

    pub fn set_snmp_up(&self, up: bool) {
        self.snmp_up.store(up, Ordering::SeqCst);
    }

    pub fn set_agent_up(&self, up: bool) {
        self.agent_up.store(up, Ordering::SeqCst);
    }

    /// Refuse agent logins that do not present this secret.
    pub fn require_secret(&self, secret: &str) {
        *self.agent_secret.lock().unwrap() = Some(secret.to_owned());
    }

    /// Make every SNMP request take this long.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Network ─────────────────────────────────────────────────────────

/// Address-keyed set of devices, serving as both connectors.
#[derive(Default)]
pub struct Network {
    devices: Mutex<HashMap<IpAddr, Arc<Device>>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, address: IpAddr, device: Arc<Device>) {
        self.devices.lock().unwrap().insert(address, device);
    }

    fn device(&self, address: IpAddr) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }
}

struct DeviceSnmp {
    network: Arc<Network>,
    device: Option<Arc<Device>>,
    port: u16,
}

impl DeviceSnmp {
    fn live(&self) -> Option<&Arc<Device>> {
        self.device
            .as_ref()
            .filter(|d| self.port == 161 && d.snmp_up.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl SnmpTransport for DeviceSnmp {
    async fn get(&self, oid: &str) -> Result<SnmpValue, SnmpError> {
        let device = self.live().ok_or(SnmpError::Timeout)?;
        let total = self.network.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.network.max_in_flight.fetch_max(total, Ordering::SeqCst);
        device.enter().await;
        let value = device.snmp.lock().unwrap().get(oid).cloned();
        device.leave();
        self.network.in_flight.fetch_sub(1, Ordering::SeqCst);
        value.ok_or(SnmpError::NoSuchObject)
    }

    async fn enumerate(
        &self,
        root: &str,
        handler: &mut (dyn for<'a, 'b> FnMut(&'a str, &'b SnmpValue) -> ControlFlow<()> + Send),
    ) -> Result<(), SnmpError> {
        let device = self.live().ok_or(SnmpError::Timeout)?;
        let prefix = format!("{root}.");
        let rows: Vec<(String, SnmpValue)> = device
            .snmp
            .lock()
            .unwrap()
            .iter()
            .filter(|(oid, _)| oid.starts_with(&prefix))
            .map(|(oid, value)| (oid.clone(), value.clone()))
            .collect();
        for (oid, value) in &rows {
            if handler(oid, value).is_break() {
                break;
            }
        }
        Ok(())
    }
}

/// Connector handle over a shared network.
#[derive(Clone)]
pub struct Connector(pub Arc<Network>);

impl SnmpConnector for Connector {
    fn open(&self, target: &SnmpTarget) -> Result<Box<dyn SnmpTransport>, SnmpError> {
        Ok(Box::new(DeviceSnmp {
            network: Arc::clone(&self.0),
            device: self.0.device(target.address),
            port: target.port,
        }))
    }
}

struct DeviceAgent {
    device: Arc<Device>,
}

impl DeviceAgent {
    fn check(&self) -> Result<(), AgentError> {
        if self.device.agent_up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AgentError::ConnectionBroken)
        }
    }
}

#[async_trait]
impl AgentSession for DeviceAgent {
    async fn nop(&self) -> Result<(), AgentError> {
        self.check()
    }

    async fn get_parameter(&self, name: &str) -> Result<String, AgentError> {
        self.check()?;
        self.device
            .agent_params
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownParameter(name.to_owned()))
    }

    async fn interface_list(&self) -> Result<Vec<InterfaceInfo>, AgentError> {
        self.check()?;
        Ok(self.device.agent_interfaces.lock().unwrap().clone())
    }

    async fn routing_table(&self) -> Result<Vec<RouteEntry>, AgentError> {
        self.check()?;
        Ok(vec![RouteEntry {
            destination: "0.0.0.0/0".parse().unwrap(),
            next_hop: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254)),
            if_index: 1,
            route_type: 4,
        }])
    }

    async fn arp_cache(&self) -> Result<Vec<ArpEntry>, AgentError> {
        Err(AgentError::Unsupported("ARP cache"))
    }

    async fn supported_parameters(&self) -> Result<Vec<ParameterInfo>, AgentError> {
        self.check()?;
        Ok(self
            .device
            .agent_params
            .lock()
            .unwrap()
            .keys()
            .map(|name| ParameterInfo {
                name: name.clone(),
                description: String::new(),
                data_type: "string".into(),
            })
            .collect())
    }

    async fn disconnect(&self) {}
}

#[async_trait]
impl AgentConnector for Connector {
    async fn connect(&self, target: &AgentTarget) -> Result<Box<dyn AgentSession>, AgentError> {
        match self.0.device(target.endpoint.address) {
            Some(device) if device.agent_up.load(Ordering::SeqCst) => {
                let required = device.agent_secret.lock().unwrap().clone();
                if required.is_some_and(|r| r != target.endpoint.secret.expose_secret()) {
                    return Err(AgentError::AuthFailed);
                }
                Ok(Box::new(DeviceAgent { device }))
            }
            _ => Err(AgentError::Transport("connection refused".into())),
        }
    }
}

/// Stands in for the interface table of the host running the poller.
pub struct LocalTable(pub Vec<InterfaceInfo>);

impl InterfaceSource for LocalTable {
    fn interface_list(&self) -> Result<Vec<InterfaceInfo>, netpoll_transport::Error> {
        Ok(self.0.clone())
    }
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn codes(&self) -> Vec<EventCode> {
        self.events.lock().unwrap().iter().map(|e| e.code).collect()
    }

    pub fn count(&self, code: EventCode) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.code == code).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for RecordingSink {
    fn post(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

// ── Names ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct TableResolver {
    reverse: Mutex<HashMap<IpAddr, String>>,
    forward: Mutex<HashMap<String, IpAddr>>,
}

impl TableResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_reverse(&self, address: IpAddr, name: &str) {
        self.reverse.lock().unwrap().insert(address, name.to_owned());
    }

    pub fn set_forward(&self, name: &str, address: IpAddr) {
        self.forward.lock().unwrap().insert(name.to_owned(), address);
    }
}

#[async_trait]
impl NameResolver for TableResolver {
    async fn reverse(&self, ip: IpAddr) -> Option<String> {
        self.reverse.lock().unwrap().get(&ip).cloned()
    }

    async fn forward(&self, name: &str) -> Option<IpAddr> {
        self.forward.lock().unwrap().get(name).copied()
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// A poller wired to fakes, with handles on every fake.
pub struct Harness {
    pub poller: Poller,
    pub network: Arc<Network>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub resolver: Arc<TableResolver>,
    pub store: Arc<MemoryStore>,
}

pub fn test_config() -> PollerConfig {
    let mut config = PollerConfig::default();
    config.snmp.enable_checkpoint = false;
    config.snmp.timeout = Duration::from_millis(50);
    config.agent.timeout = Duration::from_millis(50);
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), Arc::new(MemoryStore::new()))
    }

    pub fn with(config: PollerConfig, store: Arc<MemoryStore>) -> Self {
        Self::build(config, store, None)
    }

    /// A poller running on a host whose own interfaces are `local`.
    pub fn with_local(config: PollerConfig, local: Vec<InterfaceInfo>) -> Self {
        Self::build(config, Arc::new(MemoryStore::new()), Some(Arc::new(LocalTable(local))))
    }

    fn build(config: PollerConfig, store: Arc<MemoryStore>, local: Option<Arc<dyn InterfaceSource>>) -> Self {
        let network = Network::new();
        let connector = Connector(Arc::clone(&network));
        let transports = Transports {
            snmp: Arc::new(connector.clone()),
            agent: Some(Arc::new(connector)),
            local,
        };
        let sink = RecordingSink::new();
        let clock = Arc::new(ManualClock::new(epoch()));
        let resolver = TableResolver::new();
        let poller = Poller::builder(config, transports)
            .sink(Arc::clone(&sink) as Arc<dyn EventSink>)
            .clock(Arc::clone(&clock) as Arc<dyn netpoll_core::Clock>)
            .resolver(Arc::clone(&resolver) as Arc<dyn NameResolver>)
            .store(Arc::clone(&store) as Arc<dyn netpoll_core::NodeStore>)
            .build();
        Self {
            poller,
            network,
            sink,
            clock,
            resolver,
            store,
        }
    }

    /// Put `device` on the network at `address`, add a node for it and
    /// run its first configuration poll.
    pub async fn provision(&self, address: &str, device: Arc<Device>) -> Arc<Node> {
        self.network.add(ip(address), device);
        let node = self
            .poller
            .add_node(NodeRecord::new(0, address, ip(address)))
            .await
            .unwrap();
        let outcome = self.poller.configuration_poll(node.id()).await.unwrap();
        assert!(matches!(outcome, ConfigPollOutcome::Completed { .. }));
        node
    }

    /// Move the clock forward and run one status poll.
    pub async fn status_poll_after(&self, node: &Node, seconds: i64) {
        self.clock.advance(chrono::TimeDelta::seconds(seconds));
        self.poller.status_poll(node.id()).await.unwrap();
    }
}

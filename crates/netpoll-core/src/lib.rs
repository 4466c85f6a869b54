// netpoll-core: node status and configuration polling engine.
//
// A `Poller` keeps every monitored node in an id-keyed registry and
// runs two recurring cycles per node: the status poll (reachability
// probes, child status, compound status) and the configuration poll
// (capability detection, interface reconciliation, subnet and template
// membership). Cycles of one node never overlap; different nodes poll
// in parallel.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod persistence;
pub mod poll;
pub mod poller;
pub mod scheduler;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentDefaults, DemotionPolicy, NameSettings, OidTypeRule, PollerConfig, SnmpDefaults};
pub use error::{CoreError, ErrorClass};
pub use events::{BroadcastSink, DeferredEvents, EventSink};
pub use persistence::{MemoryStore, NodeStore};
pub use poll::capability::{CapabilityState, Transition};
pub use poll::config_poll::ConfigPollOutcome;
pub use poll::{DnsResolver, NameResolver, Transports};
pub use poller::{LoadReport, Poller, PollerBuilder};
pub use scheduler::PollKind;
pub use store::Registry;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    // Node
    AgentSettings, DynamicFlags, FailureTimes, Node, NodeData, NodeFlags, NodeRecord, NodeType,
    Protocol, SnmpSettings,
    // Children
    Interface, LinkState, NetworkService, ServiceType,
    // Shared objects
    Cluster, DciCleanup, SYSTEM_AGENT_TEMPLATE, SYSTEM_SNMP_TEMPLATE, Subnet, SubnetRecord, Template,
    // Status and events
    Event, EventCode, ObjectStatus, StatusAlgorithm, compound_status,
    // Caching
    CacheSlot, Cached,
};

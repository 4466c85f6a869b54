// ── Domain model ──
//
// Nodes, their children, and the shared objects they point at by id.

pub mod cached;
pub mod event;
pub mod flags;
pub mod group;
pub mod interface;
pub mod node;
pub mod node_type;
pub mod service;
pub mod status;
pub mod subnet;

pub use cached::{CacheSlot, Cached};
pub use event::{Event, EventCode};
pub use flags::{DynamicFlags, NodeFlags, Protocol};
pub use group::{Cluster, DciCleanup, SYSTEM_AGENT_TEMPLATE, SYSTEM_SNMP_TEMPLATE, Template};
pub use interface::{Interface, LinkState};
pub use node::{AgentSettings, FailureTimes, Node, NodeData, NodeRecord, SnmpSettings};
pub use node_type::NodeType;
pub use service::{NetworkService, ServiceType};
pub use status::{ObjectStatus, StatusAlgorithm, compound_status};
pub use subnet::{Subnet, SubnetRecord};

//! Transport layer for the netpoll node polling engine.
//!
//! This crate defines the contracts the engine uses to talk to the
//! outside world, plus the concrete implementations that ship with it:
//!
//! - **[`SnmpTransport`] / [`SnmpConnector`]**: `Get` and `Enumerate`
//!   against one SNMP agent. [`UdpSnmpConnector`] speaks SNMP v1/v2c
//!   over UDP via `snmp2`.
//!
//! - **[`AgentSession`] / [`AgentConnector`]**: the native management
//!   agent RPC surface (`Nop`, `GetParameter`, interface/route/ARP
//!   tables, parameter catalog). The wire protocol lives outside this
//!   workspace; implementations plug in through the trait.
//!
//! - **[`InterfaceSource`]**: local host introspection, used when the
//!   polled node is the management server itself. [`LocalHost`] reads
//!   the OS interface table through `pnet`.
//!
//! Every transport call carries its own timeout; callers never see a
//! hung future.

pub mod agent;
pub mod error;
pub mod local;
pub mod snmp;
pub mod types;

pub use agent::{AgentAuth, AgentConnector, AgentEndpoint, AgentSession, AgentTarget};
pub use error::{AgentError, Error, SnmpError};
pub use local::{InterfaceSource, LocalHost};
pub use snmp::{SnmpConnector, SnmpTarget, SnmpTransport, SnmpValue, SnmpVersion, UdpSnmpConnector};
pub use types::{
    ArpEntry, IFTYPE_ETHERNET, IFTYPE_NAT_ADAPTER, IFTYPE_OTHER, IFTYPE_SOFTWARE_LOOPBACK,
    InterfaceInfo, LinkNeighbor, MacAddress, ParameterInfo, RouteEntry,
};

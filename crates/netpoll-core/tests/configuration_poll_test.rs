#![allow(clippy::unwrap_used)]
// Configuration poll against scripted devices: detection, interface
// reconciliation, subnet binding, naming and system templates.

mod common;

use std::collections::BTreeSet;

use netpoll_core::{
    Cluster, ConfigPollOutcome, DynamicFlags, EventCode, NodeFlags, NodeRecord, NodeStore, NodeType,
};
use netpoll_transport::{IFTYPE_ETHERNET, InterfaceInfo};
use pretty_assertions::assert_eq;

use common::{Device, Harness, ip, test_config};

fn interface_names(node: &netpoll_core::Node) -> Vec<String> {
    let mut names: Vec<String> = node.read(|d| d.interfaces.iter().map(|i| i.name.clone()).collect());
    names.sort();
    names
}

// ── First poll ──────────────────────────────────────────────────────

#[tokio::test]
async fn first_poll_builds_the_node() {
    let h = Harness::new();
    h.resolver.set_reverse(ip("10.0.0.5"), "web01.example.net");
    let node = h
        .provision("10.0.0.5", Device::snmp(&[(1, "eth0", "10.0.0.5/24")]))
        .await;

    let flags = node.flags();
    assert!(flags.contains(NodeFlags::IS_SNMP));
    assert!(!flags.contains(NodeFlags::IS_NATIVE_AGENT));
    assert!(!flags.contains(NodeFlags::BEHIND_NAT));

    let (interfaces, subnets, node_type, description) = node.read(|d| {
        (
            d.interfaces.clone(),
            d.subnets.clone(),
            d.node_type,
            d.sys_description.clone(),
        )
    });
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].name, "eth0");
    assert_eq!(interfaces[0].address, Some("10.0.0.5/24".parse().unwrap()));
    assert_eq!(node_type, NodeType::Server);
    assert_eq!(description, "Linux test 6.1");

    assert_eq!(subnets.len(), 1);
    let subnet = h.poller.registry().subnet(*subnets.first().unwrap()).unwrap();
    assert_eq!(subnet.network(), "10.0.0.0/24".parse().unwrap());
    assert!(subnet.has_node(node.id()));

    assert_eq!(node.name(), "web01");
    assert!(node.dynamic().contains(DynamicFlags::CONFIG_POLL_PASSED));
    assert!(node.read(|d| d.last_config_poll.is_some()));

    assert_eq!(h.sink.count(EventCode::InterfaceAdded), 1);
    assert_eq!(h.sink.count(EventCode::NodeFlagsChanged), 1);
    assert_eq!(h.sink.count(EventCode::TemplateAutoapply), 1);
    assert_eq!(h.store.node_count(), 1);
    assert_eq!(h.store.subnet_count(), 1);
}

#[tokio::test]
async fn second_poll_without_changes_is_quiet() {
    let h = Harness::new();
    let node = h
        .provision(
            "10.0.0.5",
            Device::snmp(&[(1, "eth0", "10.0.0.5/24"), (2, "eth1", "192.168.7.1/24")]),
        )
        .await;
    let before = node.read(|d| (d.interfaces.clone(), d.subnets.clone(), d.flags));
    h.sink.clear();

    let outcome = h.poller.configuration_poll(node.id()).await.unwrap();

    assert_eq!(outcome, ConfigPollOutcome::Completed { changed: false });
    assert_eq!(node.read(|d| (d.interfaces.clone(), d.subnets.clone(), d.flags)), before);
    assert!(h.sink.events().is_empty(), "unexpected events: {:?}", h.sink.codes());
}

#[tokio::test]
async fn feature_oids_set_capability_flags() {
    let h = Harness::new();
    let device = Device::snmp(&[(1, "eth0", "10.0.0.5/24")]);
    device.set_oid(".1.3.6.1.2.1.4.1.0", netpoll_transport::SnmpValue::Integer(1));
    device.set_oid(".1.3.6.1.2.1.17.1.1.0", netpoll_transport::SnmpValue::OctetString(vec![0; 6]));
    device.set_oid(".1.0.8802.1.1.2.1.3.2.0", netpoll_transport::SnmpValue::Integer(4));

    let node = h.provision("10.0.0.5", device).await;

    let flags = node.flags();
    assert!(flags.contains(NodeFlags::IS_ROUTER));
    assert!(flags.contains(NodeFlags::IS_BRIDGE));
    assert!(flags.contains(NodeFlags::IS_LLDP));
    assert!(!flags.contains(NodeFlags::IS_CDP));
    assert!(!flags.contains(NodeFlags::IS_OSPF));
}

// ── Interface changes ───────────────────────────────────────────────

#[tokio::test]
async fn removed_interface_is_deleted_and_new_one_added() {
    let h = Harness::new();
    let device = Device::snmp(&[(1, "eth0", "10.0.0.5/24"), (2, "eth1", "192.168.7.1/24")]);
    let node = h.provision("10.0.0.5", device.clone()).await;
    h.sink.clear();

    device.set_interfaces(&[(1, "eth0", "10.0.0.5/24"), (3, "eth2", "172.16.0.1/16")]);
    let outcome = h.poller.configuration_poll(node.id()).await.unwrap();

    assert_eq!(outcome, ConfigPollOutcome::Completed { changed: true });
    let names: Vec<String> = node.read(|d| d.interfaces.iter().map(|i| i.name.clone()).collect());
    assert_eq!(names, vec!["eth0".to_owned(), "eth2".to_owned()]);
    assert_eq!(h.sink.count(EventCode::InterfaceDeleted), 1);
    assert_eq!(h.sink.count(EventCode::InterfaceAdded), 1);

    // The 192.168.7.0/24 subnet lost its only member.
    let networks: Vec<String> = h
        .poller
        .registry()
        .subnets()
        .iter()
        .map(|s| s.network().to_string())
        .collect();
    assert!(!networks.contains(&"192.168.7.0/24".to_owned()), "{networks:?}");
    assert!(networks.contains(&"172.16.0.0/16".to_owned()), "{networks:?}");
}

#[tokio::test]
async fn nat_adapter_follows_the_primary_address() {
    let h = Harness::new();
    let device = Device::snmp(&[(1, "eth0", "192.168.1.10/24")]);
    let node = h.provision("203.0.113.7", device.clone()).await;

    assert!(node.flags().contains(NodeFlags::BEHIND_NAT));
    let nat: Vec<_> = node.read(|d| d.interfaces.iter().filter(|i| i.is_nat_adapter()).cloned().collect());
    assert_eq!(nat.len(), 1);
    assert_eq!(nat[0].ip(), Some(ip("203.0.113.7")));
    assert_eq!(nat[0].subnet_id, None);

    // The public address shows up on a real interface.
    h.sink.clear();
    device.set_interfaces(&[(1, "eth0", "192.168.1.10/24"), (2, "wan0", "203.0.113.7/24")]);
    h.poller.configuration_poll(node.id()).await.unwrap();

    assert!(!node.flags().contains(NodeFlags::BEHIND_NAT));
    assert!(node.read(|d| d.interfaces.iter().all(|i| !i.is_nat_adapter())));
    assert_eq!(node.read(|d| d.interfaces.len()), 2);
    assert_eq!(h.sink.count(EventCode::InterfaceDeleted), 1);
}

#[tokio::test]
async fn nat_flag_clears_after_a_failed_recheck() {
    let h = Harness::new();
    let device = Device::snmp(&[(1, "eth0", "192.168.1.10/24")]);
    let node = h.provision("203.0.113.7", device.clone()).await;
    assert!(node.flags().contains(NodeFlags::BEHIND_NAT));

    // Nothing answers during the recheck: every interface goes, the NAT
    // adapter included, and the placeholder carries the primary address.
    device.set_snmp_up(false);
    h.poller.recheck_capabilities(node.id()).await.unwrap();
    assert_eq!(interface_names(&node), vec!["unknown".to_owned()]);
    assert!(!node.flags().contains(NodeFlags::BEHIND_NAT));

    device.set_snmp_up(true);
    device.set_interfaces(&[(1, "eth0", "192.168.1.10/24"), (2, "wan0", "203.0.113.7/24")]);
    h.poller.configuration_poll(node.id()).await.unwrap();

    assert_eq!(interface_names(&node), vec!["eth0".to_owned(), "wan0".to_owned()]);
    assert!(!node.flags().contains(NodeFlags::BEHIND_NAT));
    assert!(node.read(|d| d.interfaces.iter().all(|i| !i.is_nat_adapter())));
}

#[tokio::test]
async fn cluster_sync_interface_stays_out_of_subnets() {
    let h = Harness::new();
    h.poller.registry().insert_cluster(Cluster {
        id: 900,
        name: "fw-pair".into(),
        sync_networks: vec!["192.168.255.0/24".parse().unwrap()],
        members: BTreeSet::new(),
    });
    h.network.add(
        ip("10.0.0.5"),
        Device::snmp(&[(1, "eth0", "10.0.0.5/24"), (2, "sync0", "192.168.255.1/24")]),
    );
    let mut record = NodeRecord::new(0, "fw-a", ip("10.0.0.5"));
    record.cluster = Some(900);
    let node = h.poller.add_node(record).await.unwrap();

    h.poller.configuration_poll(node.id()).await.unwrap();

    let sync = node
        .read(|d| d.interfaces.iter().find(|i| i.name == "sync0").cloned())
        .unwrap();
    assert!(sync.cluster_sync);
    assert_eq!(sync.subnet_id, None);
    assert_eq!(node.read(|d| d.subnets.len()), 1);
    let networks: Vec<String> = h
        .poller
        .registry()
        .subnets()
        .iter()
        .map(|s| s.network().to_string())
        .collect();
    assert_eq!(networks, vec!["10.0.0.0/24".to_owned()]);
}

#[tokio::test]
async fn silent_node_gets_a_placeholder_interface() {
    let h = Harness::new();
    let node = h
        .poller
        .add_node(NodeRecord::new(0, "10.9.9.9", ip("10.9.9.9")))
        .await
        .unwrap();

    let outcome = h.poller.configuration_poll(node.id()).await.unwrap();

    assert_eq!(outcome, ConfigPollOutcome::Completed { changed: true });
    let interfaces = node.read(|d| d.interfaces.clone());
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].name, "unknown");
    assert_eq!(interfaces[0].ip(), Some(ip("10.9.9.9")));
    assert!(interfaces[0].synthetic_mask);
    assert!(node.flags().intersection(NodeFlags::DETECTED).is_empty());
}

// ── Skipping and rechecks ───────────────────────────────────────────

#[tokio::test]
async fn unreachable_node_is_skipped() {
    let h = Harness::new();
    let node = h
        .provision("10.0.0.5", Device::snmp(&[(1, "eth0", "10.0.0.5/24")]))
        .await;
    node.set_dynamic(DynamicFlags::UNREACHABLE);
    h.sink.clear();

    let outcome = h.poller.configuration_poll(node.id()).await.unwrap();

    assert_eq!(outcome, ConfigPollOutcome::Skipped);
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn recheck_restores_a_lost_capability() {
    let h = Harness::new();
    let node = h
        .provision("10.0.0.5", Device::snmp(&[(1, "eth0", "10.0.0.5/24")]))
        .await;
    node.update(|d| {
        d.flags.remove(NodeFlags::IS_SNMP);
        d.flags.insert(NodeFlags::SNMP_LOST);
    });

    // A plain poll leaves the lost protocol alone.
    h.poller.configuration_poll(node.id()).await.unwrap();
    assert!(node.flags().contains(NodeFlags::SNMP_LOST));

    let outcome = h.poller.recheck_capabilities(node.id()).await.unwrap();

    assert_eq!(outcome, ConfigPollOutcome::Completed { changed: true });
    let flags = node.flags();
    assert!(flags.contains(NodeFlags::IS_SNMP));
    assert!(!flags.contains(NodeFlags::SNMP_LOST));
    assert!(!node.dynamic().contains(DynamicFlags::RECHECK_CAPABILITIES));
}

// ── Local management node ───────────────────────────────────────────

#[tokio::test]
async fn management_node_reads_the_local_interface_table() {
    let mut config = test_config();
    config.management_node = Some(500);
    let h = Harness::with_local(
        config,
        vec![InterfaceInfo {
            index: 2,
            name: "enp1s0".into(),
            if_type: IFTYPE_ETHERNET,
            mac: None,
            address: Some("10.0.0.2/24".parse().unwrap()),
        }],
    );
    // SNMP would report a different table; the local one wins.
    h.network.add(ip("10.0.0.2"), Device::snmp(&[(1, "eth0", "10.0.0.2/24")]));
    h.network.add(ip("10.0.0.3"), Device::snmp(&[(1, "eth0", "10.0.0.3/24")]));
    let server = h
        .poller
        .add_node(NodeRecord::new(500, "netpoll-server", ip("10.0.0.2")))
        .await
        .unwrap();
    let other = h
        .poller
        .add_node(NodeRecord::new(0, "10.0.0.3", ip("10.0.0.3")))
        .await
        .unwrap();

    h.poller.configuration_poll(server.id()).await.unwrap();
    h.poller.configuration_poll(other.id()).await.unwrap();

    assert!(server.flags().contains(NodeFlags::IS_LOCAL_MGMT));
    assert_eq!(interface_names(&server), vec!["enp1s0".to_owned()]);
    assert!(!other.flags().contains(NodeFlags::IS_LOCAL_MGMT));
    assert_eq!(interface_names(&other), vec!["eth0".to_owned()]);
}

// ── Native agent ────────────────────────────────────────────────────

#[tokio::test]
async fn agent_node_is_detected_and_catalog_cached() {
    let h = Harness::new();
    let device = Device::agent(vec![netpoll_transport::InterfaceInfo {
        index: 1,
        name: "ens3".into(),
        if_type: netpoll_transport::IFTYPE_ETHERNET,
        mac: None,
        address: Some("10.0.0.8/24".parse().unwrap()),
    }]);
    device.set_param("Net.IP.Forwarding", "1");
    let node = h.provision("10.0.0.8", device).await;

    let flags = node.flags();
    assert!(flags.contains(NodeFlags::IS_NATIVE_AGENT));
    assert!(flags.contains(NodeFlags::IS_ROUTER));
    assert!(!flags.contains(NodeFlags::IS_SNMP));
    assert_eq!(node.read(|d| d.agent_version.clone()), "3.9.1");
    assert_eq!(node.read(|d| d.platform_name.clone()), "linux-x64");
    assert_eq!(node.read(|d| d.interfaces.len()), 1);

    let catalog = h.poller.parameters(node.id()).await.unwrap();
    assert!(catalog.iter().any(|p| p.name == "Agent.Version"));

    let routes = h.poller.routing_table(node.id()).await.unwrap();
    let again = h.poller.routing_table(node.id()).await.unwrap();
    assert_eq!(routes.len(), 1);
    assert!(std::sync::Arc::ptr_eq(&routes, &again));
}

#[tokio::test]
async fn rejected_secret_falls_back_to_the_default() {
    let h = Harness::new();
    let device = Device::agent(vec![]);
    device.require_secret("netxms");
    h.network.add(ip("10.0.0.8"), device);
    let mut record = NodeRecord::new(0, "10.0.0.8", ip("10.0.0.8"));
    record.agent_secret = "stale".into();
    let node = h.poller.add_node(record).await.unwrap();

    h.poller.configuration_poll(node.id()).await.unwrap();

    assert!(node.flags().contains(NodeFlags::IS_NATIVE_AGENT));
    let stored = h.store.load_node(node.id()).unwrap();
    assert_eq!(stored.agent_secret, "netxms");
}

#[tokio::test]
async fn losing_a_protocol_unbinds_its_system_template() {
    let h = Harness::new();
    let node = h
        .provision("10.0.0.5", Device::snmp(&[(1, "eth0", "10.0.0.5/24")]))
        .await;
    assert_eq!(node.read(|d| d.templates.len()), 1);

    node.update(|d| d.flags.remove(NodeFlags::IS_SNMP));
    node.update(|d| d.flags.insert(NodeFlags::DISABLE_SNMP));
    h.sink.clear();
    h.poller.configuration_poll(node.id()).await.unwrap();

    assert!(node.read(|d| d.templates.is_empty()));
    assert_eq!(h.sink.count(EventCode::TemplateAutoremove), 1);
    let cleanup = h.poller.drain_dci_cleanup();
    assert_eq!(cleanup.len(), 1);
    assert_eq!(cleanup[0].node_id, node.id());
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! End-to-end scenarios driving real nodes over an in-memory wire with a
//! fully deterministic injected clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use zerotier_node::error::ResultCode;
use zerotier_node::event::Event;
use zerotier_node::host::HostSystem;
use zerotier_node::node::Node;
use zerotier_node::state::StateObjectType;
use zerotier_node::trace::{TraceEvent, TracePacketDropReason};
use zerotier_node::util::buffer::Buf;
use zerotier_node::vl1::identity::Identity;
use zerotier_node::vl1::mac::Mac;
use zerotier_node::vl1::{Address, Endpoint};
use zerotier_node::vl2::network::{VirtualNetworkConfigOperation, VirtualNetworkStatus};
use zerotier_node::vl2::networkconfig::{InetCidr, NetworkConfig};
use zerotier_node::vl2::networkid::NetworkId;
use zerotier_node::vl2::rules::{Rule, RuleValue};
use zerotier_node::vl2::MulticastGroup;

type ConfigCall = (NetworkId, VirtualNetworkConfigOperation, VirtualNetworkStatus, Option<NetworkConfig>);

/// In-memory host: records every callback, queues outbound wire packets for
/// the test pump, and can serve network configs as a controller.
#[derive(Default)]
struct TestHost {
    state: Mutex<HashMap<(u32, Vec<u64>), Vec<u8>>>,
    wire_out: Mutex<Vec<(Endpoint, Vec<u8>)>>,
    events: Mutex<Vec<Event>>,
    frames: Mutex<Vec<(NetworkId, Mac, Mac, u16, Vec<u8>)>>,
    config_calls: Mutex<Vec<ConfigCall>>,
    directory: Mutex<HashMap<Address, Endpoint>>,
    controller_networks: Mutex<HashMap<NetworkId, Vec<Rule>>>,
}

impl TestHost {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn event_codes(&self) -> Vec<u32> {
        self.events.lock().unwrap().iter().map(|e| e.code()).collect()
    }

    fn has_state(&self, t: StateObjectType, id: &[u64]) -> bool {
        self.state.lock().unwrap().contains_key(&(t.to_u32(), id.to_vec()))
    }
}

impl HostSystem for TestHost {
    fn state_put(&self, object_type: StateObjectType, id: &[u64], data: &[u8]) {
        self.state.lock().unwrap().insert((object_type.to_u32(), id.to_vec()), data.to_vec());
    }

    fn state_delete(&self, object_type: StateObjectType, id: &[u64]) {
        self.state.lock().unwrap().remove(&(object_type.to_u32(), id.to_vec()));
    }

    fn state_get(&self, object_type: StateObjectType, id: &[u64]) -> Option<Vec<u8>> {
        self.state.lock().unwrap().get(&(object_type.to_u32(), id.to_vec())).cloned()
    }

    fn wire_packet_send(&self, endpoint: &Endpoint, data: &[u8]) {
        self.wire_out.lock().unwrap().push((*endpoint, data.to_vec()));
    }

    fn virtual_network_frame(
        &self,
        network_id: NetworkId,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        _vlan_id: u16,
        data: &[u8],
    ) {
        self.frames.lock().unwrap().push((network_id, source_mac, dest_mac, ethertype, data.to_vec()));
    }

    fn virtual_network_config(
        &self,
        network_id: NetworkId,
        operation: VirtualNetworkConfigOperation,
        status: VirtualNetworkStatus,
        config: Option<&NetworkConfig>,
    ) {
        self.config_calls.lock().unwrap().push((network_id, operation, status, config.cloned()));
    }

    fn event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn path_lookup(&self, peer: Address, _identity: Option<&Identity>) -> Option<Endpoint> {
        self.directory.lock().unwrap().get(&peer).copied()
    }

    fn network_config_request(&self, from: Address, network_id: NetworkId, _have_revision: u64) -> Option<NetworkConfig> {
        let networks = self.controller_networks.lock().unwrap();
        let rules = networks.get(&network_id)?;
        let mut c = NetworkConfig::new(network_id, from);
        c.timestamp = 1;
        c.revision = 7;
        c.name = "testnet".to_string();
        c.assigned_addresses.push(InetCidr { ip: "10.188.0.1".parse().unwrap(), bits: 24 });
        c.rules = rules.clone();
        Some(c)
    }
}

struct TestNet {
    nodes: Vec<(Endpoint, Node<Arc<TestHost>>, Arc<TestHost>)>,
}

impl TestNet {
    fn new(count: usize, now: i64) -> Self {
        let mut nodes = Vec::new();
        for i in 0..count {
            let host = TestHost::new();
            let node = Node::new(host.clone(), now).unwrap();
            let endpoint = Endpoint::IpUdp(format!("10.0.0.{}:9993", i + 1).parse().unwrap());
            nodes.push((endpoint, node, host));
        }
        // Every host's directory knows where every node lives.
        let entries: Vec<(Address, Endpoint)> = nodes.iter().map(|(ep, node, _)| (node.address(), *ep)).collect();
        for (_, _, host) in &nodes {
            let mut directory = host.directory.lock().unwrap();
            for (address, endpoint) in &entries {
                directory.insert(*address, *endpoint);
            }
        }
        Self { nodes }
    }

    fn node(&self, i: usize) -> &Node<Arc<TestHost>> {
        &self.nodes[i].1
    }

    fn host(&self, i: usize) -> &Arc<TestHost> {
        &self.nodes[i].2
    }

    fn endpoint(&self, i: usize) -> Endpoint {
        self.nodes[i].0
    }

    /// Deliver queued wire packets until the network is quiet.
    fn pump(&self, now: i64) {
        for _ in 0..64 {
            let mut any = false;
            for (src_ep, _, host) in &self.nodes {
                let outgoing: Vec<(Endpoint, Vec<u8>)> = host.wire_out.lock().unwrap().drain(..).collect();
                for (dest_ep, data) in outgoing {
                    if let Some((_, dest_node, _)) = self.nodes.iter().find(|(ep, _, _)| *ep == dest_ep) {
                        let buf = Buf::from_slice(&data).unwrap();
                        assert_eq!(dest_node.process_wire_packet(src_ep, buf, now), ResultCode::Ok);
                        any = true;
                    }
                }
            }
            if !any {
                return;
            }
        }
        panic!("wire traffic did not quiesce");
    }

    /// Introduce node `a` to node `b` and pump until sessions exist.
    fn connect(&self, a: usize, b: usize, now: i64) {
        let fp = *self.node(b).identity().fingerprint();
        // b's identity is not known to a yet: contact via explicit endpoint
        // after seeding a's peer table with b's public identity.
        self.node(a).add_peer(self.node(b).identity().clone_public(), now).unwrap();
        assert!(self.node(a).try_peer(&fp, Some(&self.endpoint(b)), now));
        self.pump(now);
    }
}

#[test]
fn cold_start_generates_and_persists_identity() {
    let host = TestHost::new();
    assert!(!host.has_state(StateObjectType::IdentitySecret, &[]));
    let node = Node::new(host.clone(), 100_000).unwrap();

    assert!(host.has_state(StateObjectType::IdentitySecret, &[]));
    assert!(host.has_state(StateObjectType::IdentityPublic, &[]));
    assert_eq!(host.event_codes(), vec![0]); // EVENT_UP, exactly once, first

    let stored = host.state_get(StateObjectType::IdentitySecret, &[]).unwrap();
    let stored_id = String::from_utf8(stored).unwrap().parse::<Identity>().unwrap();
    assert_eq!(stored_id.address(), node.address());
    assert!(node.identity().has_private());
}

#[test]
fn identity_reload_skips_generation() {
    let host = TestHost::new();
    let first = Node::new(host.clone(), 100_000).unwrap();
    let address = first.address();
    let secret_before = host.state_get(StateObjectType::IdentitySecret, &[]).unwrap();
    first.shutdown(100_001);
    assert_eq!(host.event_codes(), vec![0, 3]); // UP then DOWN

    let second = Node::new(host.clone(), 200_000).unwrap();
    assert_eq!(second.address(), address);
    // The stored secret was reused, not replaced.
    assert_eq!(host.state_get(StateObjectType::IdentitySecret, &[]).unwrap(), secret_before);
}

#[test]
fn corrupt_identity_secret_is_fatal() {
    let host = TestHost::new();
    host.state_put(StateObjectType::IdentitySecret, &[], b"not an identity");
    match Node::new(host, 100_000) {
        Err(code) => {
            assert_eq!(code, ResultCode::FatalDataStoreFailed);
            assert!(code.is_fatal());
        }
        Ok(_) => panic!("corrupt secret must be fatal"),
    }
}

#[test]
fn hello_exchange_builds_peers_and_latency() {
    let now = 100_000;
    let net = TestNet::new(2, now);
    net.connect(0, 1, now);

    let a_peers = net.node(0).peers(now);
    let b_peers = net.node(1).peers(now);
    assert_eq!(a_peers.len(), 1);
    assert_eq!(b_peers.len(), 1);
    assert_eq!(a_peers[0].address, net.node(1).address());
    assert_eq!(b_peers[0].address, net.node(0).address());
    // OK(HELLO) echoes ran in zero simulated time.
    assert_eq!(a_peers[0].latency_ms, Some(0));
    assert!(a_peers[0].paths.iter().any(|(_, _, _, alive, _)| *alive));
}

#[test]
fn join_then_config_lifecycle() {
    let now = 100_000;
    let net = TestNet::new(2, now);
    // Node 1 is the controller: build a network id embedding its address.
    let controller = net.node(1).address();
    let nwid = NetworkId::from_u64((controller.to_u64() << 24) | 0x000001).unwrap();
    net.host(1)
        .controller_networks
        .lock()
        .unwrap()
        .insert(nwid, vec![Rule::action(RuleValue::ActionAccept)]);

    net.node(0).join(nwid, None, now).unwrap();
    {
        let calls = net.host(0).config_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, nwid);
        assert_eq!(calls[0].1, VirtualNetworkConfigOperation::Up);
        assert_eq!(calls[0].2, VirtualNetworkStatus::RequestingConfiguration);
    }
    // join() reached out to the controller (via the host directory).
    net.pump(now);

    // Next background tick re-requests configuration over the now-live session.
    let later = now + 6_000;
    net.node(0).process_background_tasks(later);
    net.pump(later);

    let calls = net.host(0).config_calls.lock().unwrap();
    let last = calls.last().unwrap();
    assert_eq!(last.1, VirtualNetworkConfigOperation::ConfigUpdate);
    assert_eq!(last.2, VirtualNetworkStatus::Ok);
    let config = last.3.as_ref().unwrap();
    assert_eq!(config.revision, 7);
    assert_eq!(config.name, "testnet");
    drop(calls);

    let networks = net.node(0).networks();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].status, VirtualNetworkStatus::Ok);
    // The applied config was persisted for next start.
    assert!(net.host(0).has_state(StateObjectType::NetworkConfig, &[nwid.to_u64()]));
}

#[test]
fn config_requests_to_non_member_network_yield_not_found() {
    let now = 100_000;
    let net = TestNet::new(2, now);
    let controller = net.node(1).address();
    // The controller host serves no networks at all.
    let nwid = NetworkId::from_u64((controller.to_u64() << 24) | 0x0000aa).unwrap();

    net.node(0).join(nwid, None, now).unwrap();
    net.pump(now);
    let later = now + 6_000;
    net.node(0).process_background_tasks(later);
    net.pump(later);

    assert_eq!(net.node(0).networks()[0].status, VirtualNetworkStatus::NotFound);
}

#[test]
fn frame_flow_between_members() {
    let now = 100_000;
    let net = TestNet::new(3, now);
    let controller = net.node(2).address();
    let nwid = NetworkId::from_u64((controller.to_u64() << 24) | 0x000002).unwrap();
    net.host(2)
        .controller_networks
        .lock()
        .unwrap()
        .insert(nwid, vec![Rule::action(RuleValue::ActionAccept)]);

    for member in [0, 1] {
        net.node(member).join(nwid, None, now).unwrap();
        net.pump(now);
        let later = now + 6_000;
        net.node(member).process_background_tasks(later);
        net.pump(later);
        assert_eq!(net.node(member).networks()[0].status, VirtualNetworkStatus::Ok);
    }
    // Members must also know each other at VL1.
    net.connect(0, 1, now + 7_000);

    let src_mac = Mac::from_address(net.node(0).address(), nwid.to_u64());
    let dest_mac = Mac::from_address(net.node(1).address(), nwid.to_u64());
    let frame = b"\x45\x00\x00\x14payload-bytes-here--";
    let rc = net.node(0).process_virtual_network_frame(nwid, src_mac, dest_mac, 0x0800, 0, frame, now + 7_500);
    assert_eq!(rc, ResultCode::Ok);
    net.pump(now + 7_500);

    let frames = net.host(1).frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    let (fnwid, fsrc, fdest, ethertype, data) = &frames[0];
    assert_eq!(*fnwid, nwid);
    assert_eq!(*fsrc, src_mac);
    assert_eq!(*fdest, dest_mac);
    assert_eq!(*ethertype, 0x0800);
    assert_eq!(data.as_slice(), frame.as_slice());
}

#[test]
fn frame_to_unknown_network_errors() {
    let now = 100_000;
    let net = TestNet::new(1, now);
    let nwid = NetworkId::from_u64(0x8056c2e21c000001).unwrap();
    let rc = net.node(0).process_virtual_network_frame(
        nwid,
        Mac::from_u64(2),
        Mac::from_u64(4),
        0x0800,
        0,
        &[0u8; 20],
        now,
    );
    assert_eq!(rc, ResultCode::ErrorNetworkNotFound);
}

#[test]
fn leave_destroys_and_stops_callbacks() {
    let now = 100_000;
    let net = TestNet::new(2, now);
    let controller = net.node(1).address();
    let nwid = NetworkId::from_u64((controller.to_u64() << 24) | 0x000003).unwrap();
    net.host(1)
        .controller_networks
        .lock()
        .unwrap()
        .insert(nwid, vec![Rule::action(RuleValue::ActionAccept)]);

    net.node(0).join(nwid, None, now).unwrap();
    net.pump(now);
    net.node(0).process_background_tasks(now + 6_000);
    net.pump(now + 6_000);
    assert!(net.host(0).has_state(StateObjectType::NetworkConfig, &[nwid.to_u64()]));

    net.node(0).leave(nwid).unwrap();
    {
        let calls = net.host(0).config_calls.lock().unwrap();
        let last = calls.last().unwrap();
        assert_eq!(last.1, VirtualNetworkConfigOperation::Destroy);
        assert!(last.3.is_none());
    }
    // Persisted config purged; further leaves error.
    assert!(!net.host(0).has_state(StateObjectType::NetworkConfig, &[nwid.to_u64()]));
    assert_eq!(net.node(0).leave(nwid).unwrap_err(), ResultCode::ErrorNetworkNotFound);

    let calls_before = net.host(0).config_calls.lock().unwrap().len();
    net.node(0).process_background_tasks(now + 20_000);
    net.pump(now + 20_000);
    assert_eq!(net.host(0).config_calls.lock().unwrap().len(), calls_before);
}

#[test]
fn user_message_end_to_end() {
    let now = 100_000;
    let net = TestNet::new(2, now);
    net.connect(0, 1, now);

    net.node(0).send_user_message(net.node(1).address(), 0x42, b"hi", now).unwrap();
    net.pump(now);

    let events = net.host(1).events.lock().unwrap();
    let msg = events
        .iter()
        .find_map(|e| match e {
            Event::UserMessage(m) => Some(m.clone()),
            _ => None,
        })
        .expect("user message event");
    assert_eq!(msg.type_id, 0x42);
    assert_eq!(msg.data, b"hi");
    assert_eq!(msg.source, *net.node(0).identity().fingerprint());

    // Oversized messages are rejected up front.
    let huge = vec![0u8; 64 * 1024];
    assert_eq!(
        net.node(0).send_user_message(net.node(1).address(), 1, &huge, now).unwrap_err(),
        ResultCode::ErrorBadParameter
    );
}

#[test]
fn mac_failure_never_reaches_virtual_frame() {
    let now = 100_000;
    let net = TestNet::new(2, now);
    net.connect(0, 1, now);

    // A structurally valid packet from node 0's address with garbage crypto.
    let mut pkt = vec![0u8; 64];
    pkt[0..8].copy_from_slice(&99u64.to_be_bytes());
    pkt[8..13].copy_from_slice(&net.node(1).address().to_bytes());
    pkt[13..18].copy_from_slice(&net.node(0).address().to_bytes());
    pkt[18] = 0; // fragment 0
    pkt[19] = 1; // of 1
    pkt[20] = 0; // encrypted
    let rc = net.node(1).process_wire_packet(&net.endpoint(0), Buf::from_slice(&pkt).unwrap(), now);
    assert_eq!(rc, ResultCode::Ok);

    assert!(net.host(1).frames.lock().unwrap().is_empty());
    let events = net.host(1).events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Trace(TraceEvent::PacketDropped { reason: TracePacketDropReason::MacFailed, .. })
    )));
}

#[test]
fn multicast_subscribe_is_idempotent_and_replicates() {
    let now = 100_000;
    let net = TestNet::new(3, now);
    let controller = net.node(2).address();
    let nwid = NetworkId::from_u64((controller.to_u64() << 24) | 0x000004).unwrap();
    net.host(2)
        .controller_networks
        .lock()
        .unwrap()
        .insert(nwid, vec![Rule::action(RuleValue::ActionAccept)]);

    for member in [0, 1] {
        net.node(member).join(nwid, None, now).unwrap();
        net.pump(now);
        net.node(member).process_background_tasks(now + 6_000);
        net.pump(now + 6_000);
    }
    net.connect(0, 1, now + 7_000);

    let group = MulticastGroup::broadcast_for_ipv4("10.188.0.2".parse().unwrap());
    net.node(1).multicast_subscribe(nwid, group, now + 8_000).unwrap();
    net.node(1).multicast_subscribe(nwid, group, now + 8_000).unwrap();
    net.pump(now + 8_000);

    // Node 0 learned node 1's subscription; a broadcast from node 0 is
    // replicated to node 1 and delivered upward there.
    let src_mac = Mac::from_address(net.node(0).address(), nwid.to_u64());
    let bcast = Mac::from_u64(0xffffffffffff);
    let arp = vec![0u8; 28];
    let rc = net.node(0).process_virtual_network_frame(nwid, src_mac, bcast, 0x0806, 0, &arp, now + 8_500);
    assert_eq!(rc, ResultCode::Ok);
    net.pump(now + 8_500);

    let frames = net.host(1).frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].2, bcast);
}

#[test]
fn online_offline_hysteresis() {
    let now = 100_000;
    let net = TestNet::new(2, now);
    assert!(!net.node(0).status().online);
    net.connect(0, 1, now);

    net.node(0).process_background_tasks(now + 1_000);
    assert!(net.node(0).status().online);
    let online_events = net.host(0).event_codes().iter().filter(|c| **c == 2).count();
    assert_eq!(online_events, 1);

    // Long silence: the peer's paths go stale and we drop offline once.
    let much_later = now + 200_000;
    net.node(0).process_background_tasks(much_later);
    net.host(0).wire_out.lock().unwrap().clear();
    assert!(!net.node(0).status().online);
    let codes = net.host(0).event_codes();
    assert_eq!(codes.iter().filter(|c| **c == 1).count(), 1);
}

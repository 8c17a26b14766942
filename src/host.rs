/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::sync::Arc;

use crate::event::Event;
use crate::state::StateObjectType;
use crate::vl1::address::Address;
use crate::vl1::endpoint::Endpoint;
use crate::vl1::identity::Identity;
use crate::vl1::mac::Mac;
use crate::vl2::network::{VirtualNetworkConfigOperation, VirtualNetworkStatus};
use crate::vl2::networkconfig::NetworkConfig;
use crate::vl2::networkid::NetworkId;

/// Trait the host implements to integrate the node into an application.
///
/// The node performs no I/O and reads no clock of its own; everything
/// reaches the outside world through these methods, and every entry point
/// takes the current time as a parameter. This keeps the engine transport,
/// OS, and runtime independent.
///
/// Any method here may be invoked synchronously from inside any node entry
/// point. Implementations must not call back into mutating node APIs from
/// inside a callback; such calls fail with `ResultCode::ErrorBadParameter`.
///
/// Methods with default implementations are optional capabilities; the
/// defaults decline or do nothing.
pub trait HostSystem: Sync + Send + 'static {
    /// Persist a typed state object. `id` length is fixed per object type.
    fn state_put(&self, object_type: StateObjectType, id: &[u64], data: &[u8]);

    /// Delete a persisted state object (the ABI's put-with-negative-length).
    fn state_delete(&self, object_type: StateObjectType, id: &[u64]);

    /// Retrieve a typed state object, or None if absent.
    fn state_get(&self, object_type: StateObjectType, id: &[u64]) -> Option<Vec<u8>>;

    /// Send a wire packet toward an endpoint. Best effort; loss is fine.
    fn wire_packet_send(&self, endpoint: &Endpoint, data: &[u8]);

    /// Deliver an Ethernet frame that emerged from a virtual network into
    /// the host's TAP device or equivalent. The payload slice is only valid
    /// for the duration of the call.
    fn virtual_network_frame(
        &self,
        network_id: NetworkId,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    );

    /// A network's configuration or lifecycle changed. `config` is None
    /// exactly for `Destroy`. The reference is only valid for the duration
    /// of the call; copy it if needed later.
    fn virtual_network_config(
        &self,
        network_id: NetworkId,
        operation: VirtualNetworkConfigOperation,
        status: VirtualNetworkStatus,
        config: Option<&NetworkConfig>,
    );

    /// A node event. `Event::Up` is always first, `Event::Down` always last.
    fn event(&self, event: Event);

    /// Begin an HTTP GET on the node's behalf (certificate update URLs).
    /// The response, if any ever arrives, is handed back through
    /// `Node::process_http_response` with the same request id. Hosts without
    /// HTTP support simply ignore this.
    fn http_request(&self, request_id: u64, url: &str) {
        let _ = (request_id, url);
    }

    /// Approve or veto a new physical path to a peer before the node starts
    /// using it. The node separately refuses endpoints inside any joined
    /// network's assigned address space regardless of this answer.
    fn path_check(&self, peer: Address, endpoint: &Endpoint) -> bool {
        let _ = (peer, endpoint);
        true
    }

    /// Suggest a physical endpoint for a peer the node has no path to, e.g.
    /// from an out-of-band directory. `identity` is the peer's identity
    /// when known.
    fn path_lookup(&self, peer: Address, identity: Option<&Identity>) -> Option<Endpoint> {
        let _ = (peer, identity);
        None
    }

    /// Answer a network config request from a member, for hosts that run a
    /// network controller service. Only consulted for networks whose
    /// embedded controller address is this node. The default declines,
    /// which reports NOT_FOUND to the requester.
    fn network_config_request(&self, from: Address, network_id: NetworkId, have_revision: u64) -> Option<NetworkConfig> {
        let _ = (from, network_id, have_revision);
        None
    }
}

impl<T: HostSystem + ?Sized> HostSystem for Arc<T> {
    fn state_put(&self, object_type: StateObjectType, id: &[u64], data: &[u8]) {
        (**self).state_put(object_type, id, data)
    }

    fn state_delete(&self, object_type: StateObjectType, id: &[u64]) {
        (**self).state_delete(object_type, id)
    }

    fn state_get(&self, object_type: StateObjectType, id: &[u64]) -> Option<Vec<u8>> {
        (**self).state_get(object_type, id)
    }

    fn wire_packet_send(&self, endpoint: &Endpoint, data: &[u8]) {
        (**self).wire_packet_send(endpoint, data)
    }

    fn virtual_network_frame(
        &self,
        network_id: NetworkId,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    ) {
        (**self).virtual_network_frame(network_id, source_mac, dest_mac, ethertype, vlan_id, data)
    }

    fn virtual_network_config(
        &self,
        network_id: NetworkId,
        operation: VirtualNetworkConfigOperation,
        status: VirtualNetworkStatus,
        config: Option<&NetworkConfig>,
    ) {
        (**self).virtual_network_config(network_id, operation, status, config)
    }

    fn event(&self, event: Event) {
        (**self).event(event)
    }

    fn http_request(&self, request_id: u64, url: &str) {
        (**self).http_request(request_id, url)
    }

    fn path_check(&self, peer: Address, endpoint: &Endpoint) -> bool {
        (**self).path_check(peer, endpoint)
    }

    fn path_lookup(&self, peer: Address, identity: Option<&Identity>) -> Option<Endpoint> {
        (**self).path_lookup(peer, identity)
    }

    fn network_config_request(&self, from: Address, network_id: NetworkId, have_revision: u64) -> Option<NetworkConfig> {
        (**self).network_config_request(from, network_id, have_revision)
    }
}

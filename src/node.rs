/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::cert::{Certificate, TrustStore};
use crate::error::ResultCode;
use crate::event::{Event, UserMessage};
use crate::host::HostSystem;
use crate::state::{cert_serial_to_id, StateObjectType};
use crate::trace::{TraceEvent, TraceFrameDropReason, TracePacketDropReason};
use crate::util::buffer::{self, PooledBuf};
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::address::Address;
use crate::vl1::endpoint::Endpoint;
use crate::vl1::fingerprint::Fingerprint;
use crate::vl1::identity::{Identity, IdentityType};
use crate::vl1::locator::Locator;
use crate::vl1::mac::Mac;
use crate::vl1::peer::Peer;
use crate::vl1::protocol::*;
use crate::vl2::multicastgroup::MulticastGroup;
use crate::vl2::network::{Network, VirtualNetworkConfigOperation, VirtualNetworkStatus};
use crate::vl2::networkconfig::NetworkConfig;
use crate::vl2::networkid::NetworkId;

thread_local! {
    /// Depth of host callbacks currently on this thread's stack. Mutating
    /// node APIs refuse to run while nonzero; see `HostSystem` docs.
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct CallbackGuard;

impl CallbackGuard {
    fn new() -> Self {
        CALLBACK_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

fn inside_callback() -> bool {
    CALLBACK_DEPTH.with(|d| d.get() > 0)
}

struct WhoisEntry {
    last_sent: i64,
    retries: u8,
}

/// Point-in-time summary of the node itself.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub address: Address,
    pub identity: String,
    pub online: bool,
}

/// Caller-owned snapshot of one peer, the query-result analog of the ABI's
/// peer list (ownership replaces an explicit free call).
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub address: Address,
    pub fingerprint: Fingerprint,
    pub latency_ms: Option<u16>,
    pub root: bool,
    pub protocol_version: u8,
    pub network_ids: Vec<u64>,
    /// (endpoint, last send, last receive, alive, preferred)
    pub paths: Vec<(Endpoint, i64, i64, bool, bool)>,
    pub locator: Option<Locator>,
}

/// Caller-owned snapshot of one joined network.
#[derive(Clone, Debug)]
pub struct NetworkSnapshot {
    pub id: NetworkId,
    pub mac: Mac,
    pub status: VirtualNetworkStatus,
    pub config: Option<NetworkConfig>,
}

/// The node core: one logical engine instance driven entirely by host calls.
///
/// The host feeds it wire packets, virtual frames, HTTP responses, and
/// periodic background-task ticks, always passing the current clock; the
/// node responds through the `HostSystem` callbacks. There is no internal
/// thread, socket, or timer.
pub struct Node<H: HostSystem> {
    host: H,
    identity: Identity,
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    networks: RwLock<HashMap<NetworkId, Arc<Network>>>,
    trust: Mutex<TrustStore>,
    whois_queue: Mutex<HashMap<Address, WhoisEntry>>,
    /// Members known to subscribe to each multicast group, with the time
    /// each subscription was last announced.
    multicast_members: Mutex<HashMap<(NetworkId, MulticastGroup), HashMap<Address, i64>>>,
    locator: Mutex<Option<Locator>>,
    online: AtomicBool,
    /// Counter for cleartext (HELLO) packets, which carry no session nonce.
    hello_counter: AtomicU64,
    next_deadline: AtomicI64,
    last_trust_maintenance: AtomicI64,
    http_counter: AtomicU64,
    http_pending: Mutex<HashMap<u64, String>>,
}

impl<H: HostSystem> Node<H> {
    /// Create a node, loading the identity from the state store or
    /// generating and persisting a new one. Emits `Event::Up` before
    /// returning.
    pub fn new(host: H, now: i64) -> Result<Self, ResultCode> {
        let identity = match host.state_get(StateObjectType::IdentitySecret, &[]) {
            Some(bytes) => {
                // A present but unreadable secret is unrecoverable: silently
                // regenerating would fork this node's address.
                let text = String::from_utf8(bytes).map_err(|_| ResultCode::FatalDataStoreFailed)?;
                let id = text.trim().parse::<Identity>().map_err(|_| ResultCode::FatalDataStoreFailed)?;
                if !id.has_private() {
                    return Err(ResultCode::FatalDataStoreFailed);
                }
                id
            }
            None => {
                let id = Identity::generate(IdentityType::C25519);
                host.state_put(
                    StateObjectType::IdentitySecret,
                    &[],
                    id.to_string_with_options(true).as_bytes(),
                );
                host.state_put(
                    StateObjectType::IdentityPublic,
                    &[],
                    id.to_string_with_options(false).as_bytes(),
                );
                id
            }
        };

        let node = Self {
            identity,
            peers: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashMap::new()),
            trust: Mutex::new(TrustStore::new()),
            whois_queue: Mutex::new(HashMap::new()),
            multicast_members: Mutex::new(HashMap::new()),
            locator: Mutex::new(None),
            online: AtomicBool::new(false),
            hello_counter: AtomicU64::new(1),
            next_deadline: AtomicI64::new(now),
            last_trust_maintenance: AtomicI64::new(now),
            http_counter: AtomicU64::new(1),
            http_pending: Mutex::new(HashMap::new()),
            host,
        };

        node.load_locator();
        node.load_trust_store(now);

        node.emit_event(Event::Up);
        Ok(node)
    }

    /// Shut down: flush pending persistence and emit `Event::Down` as the
    /// final event. Consumes the node; outstanding HTTP request ids die
    /// with it.
    pub fn shutdown(self, now: i64) {
        self.persist_dirty_state(now);
        self.emit_event(Event::Down);
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    #[inline(always)]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.identity.address(),
            identity: self.identity.to_string_with_options(false),
            online: self.online.load(Ordering::Relaxed),
        }
    }

    /// The next moment `process_background_tasks` wants to run.
    pub fn next_background_task_deadline(&self) -> i64 {
        self.next_deadline.load(Ordering::Relaxed)
    }

    /* Host callback wrappers; every host call goes through one of these so
     * reentrancy depth is tracked uniformly. */

    fn emit_event(&self, event: Event) {
        let _guard = CallbackGuard::new();
        self.host.event(event);
    }

    fn trace(&self, event: TraceEvent) {
        self.emit_event(Event::Trace(event));
    }

    fn wire_send(&self, endpoint: &Endpoint, data: &[u8]) {
        let _guard = CallbackGuard::new();
        self.host.wire_packet_send(endpoint, data);
    }

    fn state_put(&self, object_type: StateObjectType, id: &[u64], data: &[u8]) {
        let _guard = CallbackGuard::new();
        self.host.state_put(object_type, id, data);
    }

    fn config_callback(
        &self,
        network_id: NetworkId,
        op: VirtualNetworkConfigOperation,
        status: VirtualNetworkStatus,
        config: Option<&NetworkConfig>,
    ) {
        let _guard = CallbackGuard::new();
        self.host.virtual_network_config(network_id, op, status, config);
    }

    /* Startup loads */

    fn load_locator(&self) {
        if let Some(bytes) = self.host.state_get(StateObjectType::Locator, &[]) {
            match Locator::from_bytes(&bytes) {
                Ok(l) if l.verify(&self.identity) => *self.locator.lock().unwrap() = Some(l),
                _ => self.trace(TraceEvent::CorruptStateObject { object_type: StateObjectType::Locator }),
            }
        }
    }

    fn load_trust_store(&self, now: i64) {
        let Some(index) = self.host.state_get(StateObjectType::TrustStore, &[]) else {
            return;
        };
        let Ok(entries) = TrustStore::unmarshal_index(&index) else {
            self.trace(TraceEvent::CorruptStateObject { object_type: StateObjectType::TrustStore });
            return;
        };
        let mut trust = self.trust.lock().unwrap();
        for (serial, flags) in entries {
            let id = cert_serial_to_id(&serial);
            match self.host.state_get(StateObjectType::Cert, &id).map(|b| Certificate::from_bytes(&b)) {
                Some(Ok(cert)) if cert.serial == serial => trust.insert_unchecked(cert, flags),
                Some(_) => self.trace(TraceEvent::CorruptStateObject { object_type: StateObjectType::Cert }),
                None => {}
            }
        }
        drop(trust);
        self.sync_roots_from_trust(now);
    }

    /* Packet building and sending */

    /// Encrypt and send a packet to a peer over an explicit endpoint.
    fn send_via(&self, peer: &Peer, endpoint: &Endpoint, verb: u8, body: &[u8]) -> bool {
        let counter = peer.next_send_counter();
        let mut pkt = buffer::alloc();
        if !Self::write_header(&mut pkt, counter, peer.address(), self.identity.address(), 0)
            || !pkt.append(&[verb])
            || !pkt.append(body)
        {
            return false;
        }
        let aad: [u8; 10] = pkt[AAD_RANGE].try_into().unwrap();
        let Some(tag) = peer.encrypt_in_place(counter, &aad, &mut pkt[HEADER_SIZE..]) else {
            return false;
        };
        if !pkt.append(&tag) {
            return false;
        }
        self.send_fragmented(endpoint, &pkt, counter, peer.address(), 0);
        true
    }

    /// Send to a peer's current best path; false if there is none.
    fn send_to_peer(&self, peer: &Peer, now: i64, verb: u8, body: &[u8]) -> bool {
        let Some(path) = peer.best_path(now) else {
            return false;
        };
        if self.send_via(peer, &path.endpoint, verb, body) {
            path.sent(now);
            true
        } else {
            false
        }
    }

    fn write_header(pkt: &mut PooledBuf, counter: u64, dest: Address, src: Address, flags: u8) -> bool {
        let mut header = [0u8; HEADER_SIZE];
        header[COUNTER_INDEX..COUNTER_INDEX + 8].copy_from_slice(&counter.to_be_bytes());
        header[DEST_INDEX..DEST_INDEX + 5].copy_from_slice(&dest.to_bytes());
        header[SRC_INDEX..SRC_INDEX + 5].copy_from_slice(&src.to_bytes());
        header[FRAGMENT_NO_INDEX] = 0;
        header[FRAGMENT_COUNT_INDEX] = 1;
        header[FLAGS_INDEX] = flags;
        pkt.append(&header)
    }

    /// Split an assembled packet across physical MTU sized fragments.
    fn send_fragmented(&self, endpoint: &Endpoint, pkt: &[u8], counter: u64, dest: Address, flags: u8) {
        if pkt.len() <= DEFAULT_UDP_MTU {
            self.wire_send(endpoint, pkt);
            return;
        }
        let chunk = DEFAULT_UDP_MTU - HEADER_SIZE;
        let payload = &pkt[HEADER_SIZE..];
        let count = payload.len().div_ceil(chunk);
        if count > MAX_FRAGMENTS {
            return;
        }
        let mut frag = buffer::alloc();
        for (no, part) in payload.chunks(chunk).enumerate() {
            frag.set_len(0);
            let mut header = [0u8; HEADER_SIZE];
            header[COUNTER_INDEX..COUNTER_INDEX + 8].copy_from_slice(&counter.to_be_bytes());
            header[DEST_INDEX..DEST_INDEX + 5].copy_from_slice(&dest.to_bytes());
            header[SRC_INDEX..SRC_INDEX + 5].copy_from_slice(&self.identity.address().to_bytes());
            header[FRAGMENT_NO_INDEX] = no as u8;
            header[FRAGMENT_COUNT_INDEX] = count as u8;
            header[FLAGS_INDEX] = flags;
            if frag.append(&header) && frag.append(part) {
                self.wire_send(endpoint, &frag);
            }
        }
    }

    /// Send a cleartext, identity-signed HELLO announcing ourselves.
    fn send_hello(&self, dest: Address, endpoint: &Endpoint, now: i64) {
        let counter = self.hello_counter.fetch_add(1, Ordering::Relaxed);
        let mut body = Vec::new();
        let mut w = MarshalWriter(&mut body);
        w.u8(VERB_HELLO);
        w.u8(PROTOCOL_VERSION);
        w.i64(now);
        self.identity.marshal(&mut w, false);
        match self.locator.lock().unwrap().as_ref() {
            Some(l) => {
                w.u8(1);
                l.marshal(&mut w);
            }
            None => w.u8(0),
        }
        let Ok(signature) = self.identity.sign(&body) else {
            return;
        };
        MarshalWriter(&mut body).varbytes(&signature);

        let mut pkt = buffer::alloc();
        if Self::write_header(&mut pkt, counter, dest, self.identity.address(), FLAG_CLEARTEXT) && pkt.append(&body) {
            self.wire_send(endpoint, &pkt);
        }
    }

    /* Peer admission */

    /// Endpoint admission: the host's veto plus the overlay-recursion guard.
    fn endpoint_allowed(&self, peer: Address, endpoint: &Endpoint) -> bool {
        if let Some(ip) = endpoint.ip() {
            let networks = self.networks.read().unwrap();
            if networks.values().any(|n| n.contains_ip(&ip)) {
                return false;
            }
        }
        let _guard = CallbackGuard::new();
        self.host.path_check(peer, endpoint)
    }

    /// Insert a peer for a validated identity, or return the existing one;
    /// the bool is true if the peer is newly created. None if a different
    /// identity already holds the address (collision) or key agreement fails.
    fn admit_peer(&self, identity: Identity, now: i64) -> Option<(Arc<Peer>, bool)> {
        let address = identity.address();
        let mut peers = self.peers.write().unwrap();
        if let Some(existing) = peers.get(&address) {
            return (existing.identity.fingerprint() == identity.fingerprint()).then(|| (existing.clone(), false));
        }
        let peer = Arc::new(Peer::new(&self.identity, identity, now)?);
        peers.insert(address, peer.clone());
        Some((peer, true))
    }

    fn peer(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(&address).cloned()
    }

    fn roots(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap().values().filter(|p| p.is_root()).cloned().collect()
    }

    /* Public peer API */

    /// Idempotently add a peer from its full identity. Does not authorize
    /// the peer on any network and does not contact it.
    pub fn add_peer(&self, identity: Identity, now: i64) -> Result<(), ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        if !identity.validate() {
            return Err(ResultCode::ErrorBadParameter);
        }
        self.admit_peer(identity, now).map(|_| ()).ok_or(ResultCode::ErrorCollidingObject)
    }

    /// Try to contact a peer. With a known peer this sends HELLO to the
    /// given endpoint (or its best path); an all-zero fingerprint hash means
    /// look up by address only. Returns false if the peer is unknown, in
    /// which case a WHOIS is queued toward the roots.
    pub fn try_peer(&self, fingerprint: &Fingerprint, endpoint: Option<&Endpoint>, now: i64) -> bool {
        if inside_callback() {
            return false;
        }
        if let Some(peer) = self.peer(fingerprint.address) {
            if !fingerprint.matches(peer.identity.fingerprint()) {
                return false;
            }
            match endpoint {
                Some(ep) if self.endpoint_allowed(fingerprint.address, ep) => {
                    self.send_hello(fingerprint.address, ep, now);
                    peer.record_hello_sent(now);
                    true
                }
                Some(_) => false,
                None => {
                    if let Some(path) = peer.best_path(now) {
                        self.send_hello(fingerprint.address, &path.endpoint, now);
                        peer.record_hello_sent(now);
                        true
                    } else {
                        false
                    }
                }
            }
        } else {
            self.whois_queue
                .lock()
                .unwrap()
                .entry(fingerprint.address)
                .or_insert(WhoisEntry { last_sent: 0, retries: 0 });
            self.send_pending_whois(now);
            false
        }
    }

    /// Flag a known peer as a root, contacting it if an endpoint is given.
    pub fn add_root(&self, identity: Identity, endpoint: Option<&Endpoint>, now: i64) -> Result<(), ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        let (peer, _) = self.admit_peer(identity, now).ok_or(ResultCode::ErrorCollidingObject)?;
        peer.set_root(true);
        if let Some(ep) = endpoint {
            if self.endpoint_allowed(peer.address(), ep) {
                self.send_hello(peer.address(), ep, now);
                peer.record_hello_sent(now);
            }
        }
        Ok(())
    }

    pub fn remove_root(&self, address: Address) -> Result<(), ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        if let Some(peer) = self.peer(address) {
            peer.set_root(false);
        }
        Ok(())
    }

    pub fn peers(&self, now: i64) -> Vec<PeerSnapshot> {
        self.peers
            .read()
            .unwrap()
            .values()
            .map(|p| PeerSnapshot {
                address: p.address(),
                fingerprint: *p.identity.fingerprint(),
                latency_ms: p.latency(),
                root: p.is_root(),
                protocol_version: p.remote_version(),
                network_ids: p.networks(),
                paths: p
                    .paths()
                    .iter()
                    .map(|path| (path.endpoint, path.last_send(), path.last_receive(), path.alive(now), path.preferred()))
                    .collect(),
                locator: p.locator(),
            })
            .collect()
    }

    /* Network API */

    /// Join a network, optionally pinning the controller's fingerprint.
    /// Idempotent. Fires the `Up` config callback synchronously and begins
    /// requesting configuration from the controller.
    pub fn join(&self, network_id: NetworkId, controller_fingerprint: Option<Fingerprint>, now: i64) -> Result<(), ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        {
            let networks = self.networks.read().unwrap();
            if networks.contains_key(&network_id) {
                return Ok(());
            }
        }
        let network = Arc::new(Network::new(network_id, controller_fingerprint, self.identity.address()));
        self.networks.write().unwrap().insert(network_id, network.clone());

        self.config_callback(
            network_id,
            VirtualNetworkConfigOperation::Up,
            VirtualNetworkStatus::RequestingConfiguration,
            None,
        );

        // A previously persisted config lets the network come up before the
        // controller is reachable.
        if let Some(bytes) = self.host.state_get(StateObjectType::NetworkConfig, &[network_id.to_u64()]) {
            match NetworkConfig::from_bytes(&bytes) {
                Ok(config) => {
                    let snapshot = config.clone();
                    if network.apply_config(config, self.identity.address()).unwrap_or(false) {
                        self.config_callback(
                            network_id,
                            VirtualNetworkConfigOperation::ConfigUpdate,
                            VirtualNetworkStatus::Ok,
                            Some(&snapshot),
                        );
                    }
                }
                Err(_) => self.trace(TraceEvent::CorruptStateObject { object_type: StateObjectType::NetworkConfig }),
            }
        }

        self.request_network_config(&network, now);
        Ok(())
    }

    /// Permanently leave a network. Fires the `Destroy` callback with no
    /// config and purges the persisted config; afterwards no callback will
    /// reference this network id again.
    pub fn leave(&self, network_id: NetworkId) -> Result<(), ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        let Some(network) = self.networks.write().unwrap().remove(&network_id) else {
            return Err(ResultCode::ErrorNetworkNotFound);
        };
        self.multicast_members.lock().unwrap().retain(|(nwid, _), _| *nwid != network_id);
        {
            let _guard = CallbackGuard::new();
            self.host.state_delete(StateObjectType::NetworkConfig, &[network_id.to_u64()]);
        }
        self.config_callback(
            network_id,
            VirtualNetworkConfigOperation::Destroy,
            network.status(),
            None,
        );
        Ok(())
    }

    /// Idempotently subscribe to a multicast group and announce it.
    pub fn multicast_subscribe(&self, network_id: NetworkId, group: MulticastGroup, now: i64) -> Result<(), ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        let network = self.network(network_id).ok_or(ResultCode::ErrorNetworkNotFound)?;
        if network.multicast_subscribe(group) {
            self.announce_multicast(&network, now);
        }
        Ok(())
    }

    /// Unsubscribe; a zero-MAC group clears all subscriptions.
    pub fn multicast_unsubscribe(&self, network_id: NetworkId, group: MulticastGroup) -> Result<(), ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        let network = self.network(network_id).ok_or(ResultCode::ErrorNetworkNotFound)?;
        network.multicast_unsubscribe(group);
        Ok(())
    }

    fn network(&self, network_id: NetworkId) -> Option<Arc<Network>> {
        self.networks.read().unwrap().get(&network_id).cloned()
    }

    pub fn networks(&self) -> Vec<NetworkSnapshot> {
        self.networks
            .read()
            .unwrap()
            .values()
            .map(|n| NetworkSnapshot { id: n.id(), mac: n.mac(), status: n.status(), config: n.config() })
            .collect()
    }

    /* Certificates */

    /// Verify and add a certificate to the trust store.
    pub fn add_certificate(&self, cert: Certificate, local_trust: u32, now: i64) -> Result<(), crate::cert::CertificateError> {
        let result = self.trust.lock().unwrap().add(cert, local_trust, now);
        if result.is_ok() {
            self.sync_roots_from_trust(now);
        }
        result
    }

    pub fn delete_certificate(&self, serial: &[u8; 48]) -> bool {
        let removed = self.trust.lock().unwrap().remove(serial);
        if removed {
            let _guard = CallbackGuard::new();
            self.host.state_delete(StateObjectType::Cert, &cert_serial_to_id(serial));
        }
        removed
    }

    pub fn certificates(&self) -> Vec<(Certificate, u32)> {
        self.trust.lock().unwrap().iter().map(|(c, t)| (c.clone(), t)).collect()
    }

    /// Make peers of every root-set certificate subject and mark them roots.
    fn sync_roots_from_trust(&self, now: i64) {
        let root_subjects = self.trust.lock().unwrap().root_set();
        for subject in root_subjects {
            if let Some((peer, _)) = self.admit_peer(subject.identity.clone_public(), now) {
                peer.set_root(true);
                if let Some(locator) = subject.locator {
                    peer.set_locator(locator);
                }
            }
        }
    }

    /* Locator */

    /// Create, sign, persist, and adopt a locator advertising where this
    /// node can be reached.
    pub fn update_locator(&self, endpoints: &[Endpoint], now: i64) -> Result<Locator, ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        let locator = Locator::create(&self.identity, now, endpoints).map_err(|_| ResultCode::ErrorBadParameter)?;
        self.state_put(StateObjectType::Locator, &[], &locator.to_bytes());
        *self.locator.lock().unwrap() = Some(locator.clone());
        Ok(locator)
    }

    /* User messages */

    /// Send a `VERB_USER_MESSAGE`. Best effort, no delivery guarantee; the
    /// peer must already be known and reachable.
    pub fn send_user_message(&self, dest: Address, type_id: u64, data: &[u8], now: i64) -> Result<(), ResultCode> {
        if inside_callback() {
            return Err(ResultCode::ErrorBadParameter);
        }
        if data.len() > MAX_USER_MESSAGE_SIZE {
            return Err(ResultCode::ErrorBadParameter);
        }
        let peer = self.peer(dest).ok_or(ResultCode::ErrorBadParameter)?;
        let mut body = Vec::with_capacity(8 + data.len());
        let mut w = MarshalWriter(&mut body);
        w.u64(type_id);
        w.bytes(data);
        if self.send_to_peer(&peer, now, VERB_USER_MESSAGE, &body) {
            Ok(())
        } else {
            Err(ResultCode::ErrorInternal)
        }
    }

    /* Ingestion: wire packets */

    /// Process one received wire packet. Never fails for attacker-reachable
    /// reasons; bad packets are dropped with a trace.
    pub fn process_wire_packet(&self, source_endpoint: &Endpoint, data: PooledBuf, now: i64) -> ResultCode {
        self.schedule(now);
        if data.len() < HEADER_SIZE + 1 {
            self.trace(TraceEvent::PacketDropped {
                source: None,
                endpoint: Some(*source_endpoint),
                reason: TracePacketDropReason::MalformedPacket,
            });
            return ResultCode::Ok;
        }

        let counter = u64::from_be_bytes(data[COUNTER_INDEX..COUNTER_INDEX + 8].try_into().unwrap());
        let dest = Address::from_bytes(data[DEST_INDEX..DEST_INDEX + 5].try_into().unwrap());
        let src = Address::from_bytes(data[SRC_INDEX..SRC_INDEX + 5].try_into().unwrap());
        let fragment_no = data[FRAGMENT_NO_INDEX];
        let fragment_count = data[FRAGMENT_COUNT_INDEX];
        let flags = data[FLAGS_INDEX];

        let (Some(dest), Some(src)) = (dest, src) else {
            self.trace(TraceEvent::PacketDropped {
                source: None,
                endpoint: Some(*source_endpoint),
                reason: TracePacketDropReason::MalformedPacket,
            });
            return ResultCode::Ok;
        };
        if dest != self.identity.address() {
            // Member nodes do not forward third-party traffic.
            self.trace(TraceEvent::PacketDropped {
                source: Some(src),
                endpoint: Some(*source_endpoint),
                reason: TracePacketDropReason::Unspecified,
            });
            return ResultCode::Ok;
        }

        if flags & FLAG_CLEARTEXT != 0 {
            self.receive_hello(source_endpoint, src, &data, now);
            return ResultCode::Ok;
        }

        let Some(peer) = self.peer(src) else {
            // Nothing we can authenticate this against yet; ask who it is.
            self.whois_queue.lock().unwrap().entry(src).or_insert(WhoisEntry { last_sent: 0, retries: 0 });
            self.send_pending_whois(now);
            self.trace(TraceEvent::PacketDropped {
                source: Some(src),
                endpoint: Some(*source_endpoint),
                reason: TracePacketDropReason::Unspecified,
            });
            return ResultCode::Ok;
        };

        let assembled = if fragment_count > 1 {
            match peer.defrag.lock().unwrap().assemble(counter, fragment_no, fragment_count, data) {
                Some(a) => a,
                None => return ResultCode::Ok,
            }
        } else if fragment_no == 0 && fragment_count == 1 {
            data
        } else {
            self.trace(TraceEvent::PacketDropped {
                source: Some(src),
                endpoint: Some(*source_endpoint),
                reason: TracePacketDropReason::MalformedPacket,
            });
            return ResultCode::Ok;
        };

        let mut pkt = assembled;
        let total = pkt.len();
        if total < MIN_PACKET_SIZE {
            self.trace(TraceEvent::PacketDropped {
                source: Some(src),
                endpoint: Some(*source_endpoint),
                reason: TracePacketDropReason::MalformedPacket,
            });
            return ResultCode::Ok;
        }
        let aad: [u8; 10] = pkt[AAD_RANGE].try_into().unwrap();
        let tag: [u8; 16] = pkt[total - 16..].try_into().unwrap();
        if !peer.decrypt_in_place(counter, &aad, &mut pkt[HEADER_SIZE..total - 16], &tag) {
            self.trace(TraceEvent::PacketDropped {
                source: Some(src),
                endpoint: Some(*source_endpoint),
                reason: TracePacketDropReason::MacFailed,
            });
            return ResultCode::Ok;
        }

        // Authenticated: the path is real.
        if self.endpoint_allowed(src, source_endpoint) {
            peer.learn_path(source_endpoint, now);
        }

        let verb = pkt[HEADER_SIZE];
        let body = &pkt[HEADER_SIZE + 1..total - 16];
        self.dispatch_verb(&peer, source_endpoint, verb, body, now);
        ResultCode::Ok
    }

    fn receive_hello(&self, source_endpoint: &Endpoint, src: Address, pkt: &[u8], now: i64) {
        let drop = |reason| {
            self.trace(TraceEvent::PacketDropped { source: Some(src), endpoint: Some(*source_endpoint), reason });
        };
        let payload = &pkt[HEADER_SIZE..];
        let mut r = MarshalReader::new(payload);
        let parsed = (|| -> Result<(u8, i64, Identity, Option<Locator>, usize), crate::error::InvalidFormatError> {
            let verb = r.u8()?;
            let proto = r.u8()?;
            let timestamp = r.i64()?;
            let identity = Identity::unmarshal(&mut r)?;
            let locator = match r.u8()? {
                0 => None,
                1 => Some(Locator::unmarshal(&mut r)?),
                _ => return Err(crate::error::InvalidFormatError),
            };
            if verb != VERB_HELLO {
                return Err(crate::error::InvalidFormatError);
            }
            let signed_len = payload.len() - r.remaining();
            Ok((proto, timestamp, identity, locator, signed_len))
        })();
        let Ok((proto, timestamp, identity, locator, signed_len)) = parsed else {
            drop(TracePacketDropReason::MalformedPacket);
            return;
        };
        let Ok(signature) = MarshalReader::new(&payload[signed_len..]).varbytes() else {
            drop(TracePacketDropReason::MalformedPacket);
            return;
        };
        if identity.address() != src || !identity.verify(&payload[..signed_len], signature) {
            drop(TracePacketDropReason::MacFailed);
            return;
        }
        // Full proof-of-work validation; HELLO is the identity introduction.
        if !identity.validate() {
            drop(TracePacketDropReason::InvalidObject);
            return;
        }
        let Some((peer, is_new)) = self.admit_peer(identity, now) else {
            // Same address, different key: first seen wins.
            drop(TracePacketDropReason::InvalidObject);
            return;
        };
        peer.set_remote_version(proto);
        if let Some(l) = locator {
            peer.set_locator(l);
        }
        if self.endpoint_allowed(src, source_endpoint) {
            peer.learn_path(source_endpoint, now);
        } else {
            return;
        }

        // A peer we have never spoken to cannot decrypt our replies until it
        // has our identity, so introduce ourselves first.
        if is_new {
            self.send_hello(src, source_endpoint, now);
            peer.record_hello_sent(now);
        }

        // OK(HELLO) echoes the timestamp so the peer can measure latency.
        let mut body = Vec::new();
        let mut w = MarshalWriter(&mut body);
        w.u8(VERB_HELLO);
        w.i64(timestamp);
        w.u8(PROTOCOL_VERSION);
        self.send_via(&peer, source_endpoint, VERB_OK, &body);
    }

    fn dispatch_verb(&self, peer: &Arc<Peer>, source_endpoint: &Endpoint, verb: u8, body: &[u8], now: i64) {
        match verb {
            VERB_NOP => {}
            VERB_OK => self.receive_ok(peer, body, now),
            VERB_ERROR => self.receive_error(peer, body, now),
            VERB_WHOIS => self.receive_whois(peer, body, now),
            VERB_RENDEZVOUS => self.receive_rendezvous(peer, body, now),
            VERB_FRAME => self.receive_frame(peer, body, now),
            VERB_EXT_FRAME => self.receive_ext_frame(peer, body, now),
            VERB_ECHO => {
                let mut reply = Vec::with_capacity(1 + body.len());
                reply.push(VERB_ECHO);
                reply.extend_from_slice(body);
                self.send_to_peer(peer, now, VERB_OK, &reply);
            }
            VERB_MULTICAST_LIKE => self.receive_multicast_like(peer, body, now),
            VERB_NETWORK_CONFIG_REQUEST => self.receive_network_config_request(peer, body, now),
            VERB_NETWORK_CONFIG => self.receive_network_config(peer, body, now),
            VERB_USER_MESSAGE => {
                let mut r = MarshalReader::new(body);
                if let Ok(type_id) = r.u64() {
                    let data = r.take(r.remaining()).unwrap_or(&[]).to_vec();
                    self.emit_event(Event::UserMessage(UserMessage {
                        source: *peer.identity.fingerprint(),
                        type_id,
                        data,
                    }));
                }
            }
            _ => self.trace(TraceEvent::PacketDropped {
                source: Some(peer.address()),
                endpoint: Some(*source_endpoint),
                reason: TracePacketDropReason::UnrecognizedVerb,
            }),
        }
    }

    fn receive_ok(&self, peer: &Arc<Peer>, body: &[u8], now: i64) {
        let mut r = MarshalReader::new(body);
        let Ok(in_re) = r.u8() else { return };
        match in_re {
            VERB_HELLO => {
                if let Ok(sent_at) = r.i64() {
                    peer.record_latency(now - sent_at);
                    if let Ok(proto) = r.u8() {
                        peer.set_remote_version(proto);
                    }
                }
            }
            VERB_NETWORK_CONFIG_REQUEST => {
                if let Ok(body) = r.take(r.remaining()) {
                    if let Ok(config) = NetworkConfig::from_bytes(body) {
                        self.apply_network_config(peer, config, now);
                    }
                }
            }
            VERB_WHOIS => {
                while r.remaining() > 0 {
                    let Ok(identity) = Identity::unmarshal(&mut r) else { break };
                    let address = identity.address();
                    if identity.validate() {
                        self.whois_queue.lock().unwrap().remove(&address);
                        if let Some((found, _)) = self.admit_peer(identity, now) {
                            // Reach out through any endpoint the host knows.
                            let suggestion = {
                                let _guard = CallbackGuard::new();
                                self.host.path_lookup(address, Some(&found.identity))
                            };
                            if let Some(ep) = suggestion {
                                if self.endpoint_allowed(address, &ep) {
                                    self.send_hello(address, &ep, now);
                                    found.record_hello_sent(now);
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn receive_error(&self, peer: &Arc<Peer>, body: &[u8], _now: i64) {
        let mut r = MarshalReader::new(body);
        let (Ok(in_re), Ok(code), Ok(context)) = (r.u8(), r.u8(), r.u64()) else {
            return;
        };
        if in_re != VERB_NETWORK_CONFIG_REQUEST {
            return;
        }
        let Some(network_id) = NetworkId::from_u64(context) else { return };
        let Some(network) = self.network(network_id) else { return };
        // Only the controller may change membership status.
        if peer.address() != network_id.controller() {
            return;
        }
        let status = match code {
            ERROR_OBJ_NOT_FOUND => VirtualNetworkStatus::NotFound,
            ERROR_NETWORK_ACCESS_DENIED => VirtualNetworkStatus::AccessDenied,
            _ => return,
        };
        if network.set_status(status) {
            let config = network.config();
            self.config_callback(network_id, VirtualNetworkConfigOperation::ConfigUpdate, status, config.as_ref());
        }
    }

    fn receive_whois(&self, peer: &Arc<Peer>, body: &[u8], now: i64) {
        let mut reply = Vec::new();
        let mut w = MarshalWriter(&mut reply);
        w.u8(VERB_WHOIS);
        let mut any = false;
        let mut r = MarshalReader::new(body);
        while let Ok(addr) = r.u40() {
            if let Some(found) = Address::from_u64(addr).and_then(|a| self.peer(a)) {
                found.identity.marshal(&mut w, false);
                any = true;
            }
        }
        if any {
            self.send_to_peer(peer, now, VERB_OK, &reply);
        }
    }

    fn receive_rendezvous(&self, peer: &Arc<Peer>, body: &[u8], now: i64) {
        // Only roots may steer us toward new paths.
        if !peer.is_root() {
            return;
        }
        let mut r = MarshalReader::new(body);
        let parsed = (|| -> Result<(u64, Endpoint), crate::error::InvalidFormatError> {
            Ok((r.u40()?, Endpoint::unmarshal(&mut r)?))
        })();
        let Ok((addr, endpoint)) = parsed else { return };
        let Some(address) = Address::from_u64(addr) else { return };
        if let Some(target) = self.peer(address) {
            if self.endpoint_allowed(address, &endpoint) {
                self.send_hello(address, &endpoint, now);
                target.record_hello_sent(now);
            }
        }
    }

    fn receive_multicast_like(&self, peer: &Arc<Peer>, body: &[u8], now: i64) {
        let mut r = MarshalReader::new(body);
        let mut members = self.multicast_members.lock().unwrap();
        while r.remaining() >= 18 {
            let (Ok(nwid), Ok(mac), Ok(adi)) = (r.u64(), r.array::<6>(), r.u32()) else {
                return;
            };
            let Some(network_id) = NetworkId::from_u64(nwid) else { continue };
            peer.note_network(nwid);
            let group = MulticastGroup::new(Mac::from_bytes(&mac), adi);
            members.entry((network_id, group)).or_default().insert(peer.address(), now);
        }
    }

    fn receive_network_config_request(&self, peer: &Arc<Peer>, body: &[u8], now: i64) {
        let mut r = MarshalReader::new(body);
        let (Ok(nwid), Ok(have_revision)) = (r.u64(), r.u64()) else { return };
        let Some(network_id) = NetworkId::from_u64(nwid) else { return };

        let response = if network_id.controller() == self.identity.address() {
            let _guard = CallbackGuard::new();
            self.host.network_config_request(peer.address(), network_id, have_revision)
        } else {
            None
        };

        match response {
            Some(config) => {
                let mut reply = Vec::new();
                let mut w = MarshalWriter(&mut reply);
                w.u8(VERB_NETWORK_CONFIG_REQUEST);
                config.marshal(&mut w);
                self.send_to_peer(peer, now, VERB_OK, &reply);
            }
            None => {
                let mut reply = Vec::new();
                let mut w = MarshalWriter(&mut reply);
                w.u8(VERB_NETWORK_CONFIG_REQUEST);
                w.u8(ERROR_OBJ_NOT_FOUND);
                w.u64(nwid);
                self.send_to_peer(peer, now, VERB_ERROR, &reply);
            }
        }
    }

    fn receive_network_config(&self, peer: &Arc<Peer>, body: &[u8], now: i64) {
        let Ok(config) = NetworkConfig::from_bytes(body) else {
            self.trace(TraceEvent::CredentialRejected { source: Some(peer.address()), network_id: None });
            return;
        };
        self.apply_network_config(peer, config, now);
    }

    fn apply_network_config(&self, peer: &Arc<Peer>, config: NetworkConfig, _now: i64) {
        let network_id = config.network_id;
        let Some(network) = self.network(network_id) else { return };

        // The config must come from the network's controller, and must match
        // the fingerprint pin when one was given at join.
        if peer.address() != network_id.controller() || !network.controller_allowed(peer.identity.fingerprint()) {
            self.trace(TraceEvent::CredentialRejected {
                source: Some(peer.address()),
                network_id: Some(network_id),
            });
            return;
        }

        peer.note_network(network_id.to_u64());
        match network.apply_config(config, self.identity.address()) {
            Ok(true) => {
                let snapshot = network.config();
                self.config_callback(
                    network_id,
                    VirtualNetworkConfigOperation::ConfigUpdate,
                    VirtualNetworkStatus::Ok,
                    snapshot.as_ref(),
                );
                if let Some(c) = snapshot {
                    self.state_put(StateObjectType::NetworkConfig, &[network_id.to_u64()], &c.to_bytes());
                }
            }
            Ok(false) => {}
            Err(_) => self.trace(TraceEvent::CredentialRejected {
                source: Some(peer.address()),
                network_id: Some(network_id),
            }),
        }
    }

    /* Ingestion: virtual frames (egress from the host's perspective) */

    /// Process an outbound Ethernet frame from the host's TAP device: run
    /// the rule engine and encrypt toward the destination member(s).
    #[allow(clippy::too_many_arguments)]
    pub fn process_virtual_network_frame(
        &self,
        network_id: NetworkId,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        frame: &[u8],
        now: i64,
    ) -> ResultCode {
        let _ = vlan_id;
        self.schedule(now);
        let Some(network) = self.network(network_id) else {
            return ResultCode::ErrorNetworkNotFound;
        };
        let Some(config) = network.config() else {
            // Not configured yet; nothing can be sent.
            return ResultCode::Ok;
        };

        if source_mac != network.mac() && !config.bridging_allowed {
            self.trace(TraceEvent::FrameDropped {
                network_id,
                source: None,
                reason: TraceFrameDropReason::BridgingNotAllowedLocal,
            });
            return ResultCode::Ok;
        }

        if dest_mac.is_multicast() {
            return self.multicast_frame_out(&network, &config, source_mac, dest_mac, ethertype, frame, now);
        }

        let Some(dest) = dest_mac.to_address(network_id.to_u64()) else {
            self.trace(TraceEvent::FrameDropped { network_id, source: None, reason: TraceFrameDropReason::Unspecified });
            return ResultCode::Ok;
        };

        let outcome = network.filter_frame(
            false,
            self.identity.address(),
            dest,
            source_mac,
            dest_mac,
            ethertype,
            frame,
            &config.tags,
            self.random_u32(),
        );
        if !outcome.accept {
            self.trace(TraceEvent::FrameDropped {
                network_id,
                source: None,
                reason: TraceFrameDropReason::FilterBlocked,
            });
            return ResultCode::Ok;
        }
        let dest = outcome.redirect.unwrap_or(dest);

        for (fwd, _watch) in &outcome.tees {
            if let Some(tee_peer) = self.peer(fwd.address) {
                let limit = if fwd.length == 0 { frame.len() } else { (fwd.length as usize).min(frame.len()) };
                self.send_frame_verb(&tee_peer, network_id, source_mac, dest_mac, ethertype, &frame[..limit], now);
            }
        }

        let Some(peer) = self.peer(dest) else {
            // Unknown member; start a lookup and drop this frame.
            self.whois_queue.lock().unwrap().entry(dest).or_insert(WhoisEntry { last_sent: 0, retries: 0 });
            self.send_pending_whois(now);
            self.trace(TraceEvent::FrameDropped { network_id, source: None, reason: TraceFrameDropReason::Unspecified });
            return ResultCode::Ok;
        };
        self.send_frame_verb(&peer, network_id, source_mac, dest_mac, ethertype, frame, now);
        ResultCode::Ok
    }

    /// FRAME when both MACs are the address-derived defaults, EXT_FRAME
    /// otherwise (bridged traffic).
    fn send_frame_verb(
        &self,
        peer: &Arc<Peer>,
        network_id: NetworkId,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        frame: &[u8],
        now: i64,
    ) {
        let nwid = network_id.to_u64();
        let plain_mac = source_mac == Mac::from_address(self.identity.address(), nwid)
            && dest_mac.to_address(nwid) == Some(peer.address());
        let mut body = Vec::with_capacity(17 + frame.len());
        let mut w = MarshalWriter(&mut body);
        if plain_mac {
            w.u64(nwid);
            w.u16(ethertype);
            w.bytes(frame);
            self.send_to_peer(peer, now, VERB_FRAME, &body);
        } else {
            w.u64(nwid);
            w.u8(0);
            w.bytes(&dest_mac.to_bytes());
            w.bytes(&source_mac.to_bytes());
            w.u16(ethertype);
            w.bytes(frame);
            self.send_to_peer(peer, now, VERB_EXT_FRAME, &body);
        }
    }

    fn multicast_frame_out(
        &self,
        network: &Arc<Network>,
        config: &NetworkConfig,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        frame: &[u8],
        now: i64,
    ) -> ResultCode {
        let network_id = network.id();
        if dest_mac.is_broadcast() && !config.broadcast_enabled {
            self.trace(TraceEvent::FrameDropped {
                network_id,
                source: None,
                reason: TraceFrameDropReason::BroadcastDisabled,
            });
            return ResultCode::Ok;
        }
        let outcome = network.filter_frame(
            false,
            self.identity.address(),
            self.identity.address(),
            source_mac,
            dest_mac,
            ethertype,
            frame,
            &config.tags,
            self.random_u32(),
        );
        if !outcome.accept {
            self.trace(TraceEvent::FrameDropped {
                network_id,
                source: None,
                reason: TraceFrameDropReason::FilterBlocked,
            });
            return ResultCode::Ok;
        }

        // Replicate to members that have announced this group. ARP
        // partitioning: for broadcast, match any ADI announced for the MAC.
        let members: Vec<Address> = {
            let members = self.multicast_members.lock().unwrap();
            let mut out: Vec<Address> = members
                .iter()
                .filter(|((nwid, group), _)| *nwid == network_id && group.mac == dest_mac)
                .flat_map(|(_, m)| m.keys().copied())
                .collect();
            out.sort();
            out.dedup();
            out.truncate(config.multicast_limit.max(1) as usize);
            out
        };
        for address in members {
            if address == self.identity.address() {
                continue;
            }
            if let Some(peer) = self.peer(address) {
                self.send_frame_verb(&peer, network_id, source_mac, dest_mac, ethertype, frame, now);
            }
        }
        ResultCode::Ok
    }

    /* Inbound frames */

    fn receive_frame(&self, peer: &Arc<Peer>, body: &[u8], now: i64) {
        let mut r = MarshalReader::new(body);
        let (Ok(nwid), Ok(ethertype)) = (r.u64(), r.u16()) else { return };
        let frame = r.take(r.remaining()).unwrap_or(&[]);
        let Some(network_id) = NetworkId::from_u64(nwid) else { return };
        let source_mac = Mac::from_address(peer.address(), nwid);
        let dest_mac = Mac::from_address(self.identity.address(), nwid);
        self.deliver_frame(peer, network_id, source_mac, dest_mac, ethertype, frame, now);
    }

    fn receive_ext_frame(&self, peer: &Arc<Peer>, body: &[u8], now: i64) {
        let mut r = MarshalReader::new(body);
        let parsed = (|| -> Result<(u64, Mac, Mac, u16), crate::error::InvalidFormatError> {
            let nwid = r.u64()?;
            let _flags = r.u8()?;
            let dest_mac = Mac::from_bytes(&r.array()?);
            let source_mac = Mac::from_bytes(&r.array()?);
            let ethertype = r.u16()?;
            Ok((nwid, dest_mac, source_mac, ethertype))
        })();
        let Ok((nwid, dest_mac, source_mac, ethertype)) = parsed else { return };
        let frame = r.take(r.remaining()).unwrap_or(&[]);
        let Some(network_id) = NetworkId::from_u64(nwid) else { return };

        // Bridged source MACs require the network to allow bridging.
        if source_mac != Mac::from_address(peer.address(), nwid) {
            if !self.network(network_id).and_then(|n| n.config()).is_some_and(|c| c.bridging_allowed) {
                self.trace(TraceEvent::FrameDropped {
                    network_id,
                    source: Some(peer.address()),
                    reason: TraceFrameDropReason::BridgingNotAllowedRemote,
                });
                return;
            }
        }
        self.deliver_frame(peer, network_id, source_mac, dest_mac, ethertype, frame, now);
    }

    fn deliver_frame(
        &self,
        peer: &Arc<Peer>,
        network_id: NetworkId,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        frame: &[u8],
        _now: i64,
    ) {
        let Some(network) = self.network(network_id) else {
            return;
        };
        peer.note_network(network_id.to_u64());

        if dest_mac.is_multicast() {
            if dest_mac.is_broadcast() && !network.config().is_some_and(|c| c.broadcast_enabled) {
                self.trace(TraceEvent::FrameDropped {
                    network_id,
                    source: Some(peer.address()),
                    reason: TraceFrameDropReason::BroadcastDisabled,
                });
                return;
            }
            // Delivery requires a live subscription to the group's MAC; ADI
            // partitioning (IPv4 ARP) is reflected in what was subscribed.
            if !network.subscriptions().iter().any(|g| g.mac == dest_mac) {
                self.trace(TraceEvent::FrameDropped {
                    network_id,
                    source: Some(peer.address()),
                    reason: TraceFrameDropReason::MulticastDisabled,
                });
                return;
            }
        } else if dest_mac != network.mac() {
            // Unicast to a MAC that is not ours and we are not a bridge.
            if !network.config().is_some_and(|c| c.bridging_allowed) {
                self.trace(TraceEvent::FrameDropped {
                    network_id,
                    source: Some(peer.address()),
                    reason: TraceFrameDropReason::BridgingNotAllowedLocal,
                });
                return;
            }
        }

        let outcome = network.filter_frame(
            true,
            peer.address(),
            self.identity.address(),
            source_mac,
            dest_mac,
            ethertype,
            frame,
            &[],
            self.random_u32(),
        );
        if !outcome.accept {
            self.trace(TraceEvent::FrameDropped {
                network_id,
                source: Some(peer.address()),
                reason: TraceFrameDropReason::FilterBlocked,
            });
            return;
        }

        let _guard = CallbackGuard::new();
        self.host.virtual_network_frame(network_id, source_mac, dest_mac, ethertype, 0, frame);
    }

    /* HTTP responses */

    /// Hand back the response to an `http_request` callback. Currently used
    /// for certificate update URLs; unknown request ids are an error.
    pub fn process_http_response(&self, request_id: u64, response_code: u16, body: &[u8], now: i64) -> ResultCode {
        self.schedule(now);
        if self.http_pending.lock().unwrap().remove(&request_id).is_none() {
            return ResultCode::ErrorBadParameter;
        }
        if response_code != 200 {
            return ResultCode::Ok;
        }
        match Certificate::from_bytes(body) {
            Ok(cert) => {
                let result = self.trust.lock().unwrap().add(cert, 0, now);
                match result {
                    Ok(()) => self.sync_roots_from_trust(now),
                    Err(e) if !e.is_informational() => {
                        self.trace(TraceEvent::CredentialRejected { source: None, network_id: None })
                    }
                    Err(_) => {}
                }
            }
            Err(_) => self.trace(TraceEvent::CredentialRejected { source: None, network_id: None }),
        }
        ResultCode::Ok
    }

    /* Background tasks */

    fn schedule(&self, now: i64) {
        let deadline = now + MAX_BACKGROUND_INTERVAL;
        self.next_deadline.fetch_min(deadline, Ordering::Relaxed);
    }

    /// Drive all periodic work: keepalives, HELLO refresh, WHOIS retries,
    /// config requests, multicast announcements, peer aging and persistence,
    /// trust-store maintenance, and online-state hysteresis. Returns the
    /// next deadline.
    pub fn process_background_tasks(&self, now: i64) -> i64 {
        self.service_peers(now);
        self.send_pending_whois(now);
        self.service_networks(now);
        self.service_trust(now);
        self.persist_dirty_state(now);
        self.update_online_state(now);

        let deadline = now + MAX_BACKGROUND_INTERVAL;
        self.next_deadline.store(deadline, Ordering::Relaxed);
        deadline
    }

    fn service_peers(&self, now: i64) {
        let peers: Vec<Arc<Peer>> = self.peers.read().unwrap().values().cloned().collect();
        let mut expired = Vec::new();
        for peer in peers {
            if !peer.is_root() && now - peer.last_receive() > PEER_EXPIRATION {
                expired.push(peer.address());
                continue;
            }
            if now - peer.last_hello_sent() >= HELLO_INTERVAL {
                let target = peer.best_path(now).map(|p| p.endpoint).or_else(|| {
                    // No live path: consult the peer's locator, then the host.
                    peer.locator()
                        .and_then(|l| l.endpoints().iter().find(|e| e.ip().is_some()).copied())
                        .or_else(|| {
                            let _guard = CallbackGuard::new();
                            self.host.path_lookup(peer.address(), Some(&peer.identity))
                        })
                });
                if let Some(ep) = target {
                    if self.endpoint_allowed(peer.address(), &ep) {
                        self.send_hello(peer.address(), &ep, now);
                        peer.record_hello_sent(now);
                    }
                }
            }
            // NOP keepalives hold NAT mappings open on otherwise idle paths.
            for path in peer.paths() {
                if path.alive(now) && now - path.last_send() >= PATH_KEEPALIVE_INTERVAL {
                    if self.send_via(&peer, &path.endpoint, VERB_NOP, &[]) {
                        path.sent(now);
                    }
                }
            }
        }
        if !expired.is_empty() {
            let mut peers = self.peers.write().unwrap();
            for address in expired {
                peers.remove(&address);
            }
        }
    }

    fn send_pending_whois(&self, now: i64) {
        let roots = self.roots();
        let mut queue = self.whois_queue.lock().unwrap();
        let mut lookups = Vec::new();
        queue.retain(|address, entry| {
            if entry.retries >= WHOIS_MAX_RETRIES {
                return false;
            }
            if now - entry.last_sent >= WHOIS_RETRY_INTERVAL {
                entry.last_sent = now;
                entry.retries += 1;
                lookups.push(*address);
            }
            true
        });
        drop(queue);
        if lookups.is_empty() {
            return;
        }
        let mut body = Vec::with_capacity(lookups.len() * 5);
        let mut w = MarshalWriter(&mut body);
        for address in &lookups {
            w.u40(address.to_u64());
        }
        for root in &roots {
            self.send_to_peer(root, now, VERB_WHOIS, &body);
        }
    }

    fn request_network_config(&self, network: &Arc<Network>, now: i64) {
        let network_id = network.id();
        let controller = network_id.controller();
        network.record_config_request(now);
        let mut body = Vec::new();
        let mut w = MarshalWriter(&mut body);
        w.u64(network_id.to_u64());
        w.u64(network.revision());
        if let Some(peer) = self.peer(controller) {
            if self.send_to_peer(&peer, now, VERB_NETWORK_CONFIG_REQUEST, &body) {
                return;
            }
        }
        // No session with the controller yet: introduce ourselves at any
        // endpoint the host can suggest, then retry on the next tick.
        let suggestion = {
            let _guard = CallbackGuard::new();
            self.host.path_lookup(controller, None)
        };
        if let Some(ep) = suggestion {
            if self.endpoint_allowed(controller, &ep) {
                self.send_hello(controller, &ep, now);
            }
        }
    }

    fn service_networks(&self, now: i64) {
        let networks: Vec<Arc<Network>> = self.networks.read().unwrap().values().cloned().collect();
        for network in networks {
            let interval = match network.status() {
                VirtualNetworkStatus::Ok => CONFIG_REFRESH_INTERVAL,
                _ => CONFIG_REQUEST_INTERVAL,
            };
            if now - network.last_config_request() >= interval {
                self.request_network_config(&network, now);
            }
            if now - network.last_multicast_announce() >= MULTICAST_ANNOUNCE_INTERVAL {
                self.announce_multicast(&network, now);
            }
        }
    }

    /// Push our multicast subscriptions to the controller and known members.
    fn announce_multicast(&self, network: &Arc<Network>, now: i64) {
        network.record_multicast_announce(now);
        let subs = network.subscriptions();
        if subs.is_empty() {
            return;
        }
        let nwid = network.id().to_u64();
        let mut body = Vec::with_capacity(subs.len() * 18);
        let mut w = MarshalWriter(&mut body);
        for group in &subs {
            w.u64(nwid);
            w.bytes(&group.mac.to_bytes());
            w.u32(group.adi);
        }
        // Announced to every peer: membership of the other side is not
        // always known yet, and receivers just index the subscription.
        let targets: Vec<Arc<Peer>> = self.peers.read().unwrap().values().cloned().collect();
        for peer in targets {
            self.send_to_peer(&peer, now, VERB_MULTICAST_LIKE, &body);
        }
    }

    fn service_trust(&self, now: i64) {
        let last = self.last_trust_maintenance.load(Ordering::Relaxed);
        if now - last < TRUST_STORE_REVALIDATE_INTERVAL {
            return;
        }
        self.last_trust_maintenance.store(now, Ordering::Relaxed);
        let (expired, urls) = {
            let mut trust = self.trust.lock().unwrap();
            (trust.revalidate(now), trust.update_urls())
        };
        for serial in expired {
            let _guard = CallbackGuard::new();
            self.host.state_delete(StateObjectType::Cert, &cert_serial_to_id(&serial));
        }
        for url in urls {
            let request_id = self.http_counter.fetch_add(1, Ordering::Relaxed);
            self.http_pending.lock().unwrap().insert(request_id, url.clone());
            let _guard = CallbackGuard::new();
            self.host.http_request(request_id, &url);
        }
    }

    fn persist_dirty_state(&self, _now: i64) {
        for peer in self.peers.read().unwrap().values() {
            if peer.take_dirty() {
                let mut record = Vec::new();
                peer.marshal(&mut MarshalWriter(&mut record));
                self.state_put(StateObjectType::Peer, &[peer.address().to_u64()], &record);
            }
        }
        for network in self.networks.read().unwrap().values() {
            if network.take_dirty() {
                if let Some(config) = network.config() {
                    self.state_put(StateObjectType::NetworkConfig, &[network.id().to_u64()], &config.to_bytes());
                }
            }
        }
        let (dirty, index, certs) = {
            let mut trust = self.trust.lock().unwrap();
            let dirty = trust.take_dirty();
            let index = if dirty { trust.marshal_index() } else { Vec::new() };
            let certs: Vec<Certificate> = if dirty { trust.iter().map(|(c, _)| c.clone()).collect() } else { Vec::new() };
            (dirty, index, certs)
        };
        if dirty {
            self.state_put(StateObjectType::TrustStore, &[], &index);
            for cert in certs {
                self.state_put(StateObjectType::Cert, &cert_serial_to_id(&cert.serial), &cert.to_bytes());
            }
        }
    }

    /// Online means some root (or, with no roots configured, any peer) has a
    /// live path. Transitions are edge-triggered events.
    fn update_online_state(&self, now: i64) {
        let peers = self.peers.read().unwrap();
        let roots: Vec<_> = peers.values().filter(|p| p.is_root()).collect();
        let online = if roots.is_empty() {
            peers.values().any(|p| p.has_live_path(now))
        } else {
            roots.iter().any(|p| p.has_live_path(now))
        };
        drop(peers);
        if self.online.swap(online, Ordering::Relaxed) != online {
            self.emit_event(if online { Event::Online } else { Event::Offline });
        }
    }

    fn random_u32(&self) -> u32 {
        let mut b = [0u8; 4];
        rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut b);
        u32::from_be_bytes(b)
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::crypto::aead::{SessionCipher, AES_256_KEY_SIZE, AES_GCM_TAG_SIZE};
use crate::crypto::hash::kbkdf_sha512;
use crate::error::InvalidFormatError;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::address::Address;
use crate::vl1::antireplay::CounterWindow;
use crate::vl1::endpoint::Endpoint;
use crate::vl1::fragged::Fragged;
use crate::vl1::identity::Identity;
use crate::vl1::locator::Locator;
use crate::vl1::path::Path;

/// Upper bound on concurrently tracked paths to one peer.
pub const MAX_PEER_PATHS: usize = 16;

const KBKDF_LABEL_SESSION_KEY: &[u8; 4] = b"ZTSK";

/// A remote node we have authenticated at least once.
///
/// Holds the derived session cipher, the bounded path set, and liveness and
/// latency bookkeeping. All fields use interior mutability so peers can be
/// shared behind `Arc` from the node's peer map.
pub struct Peer {
    pub identity: Identity,
    cipher: SessionCipher,
    /// True if our address is numerically less than the peer's; the AEAD
    /// nonce direction bit is "sender has the lesser address".
    out_direction: bool,
    send_counter: AtomicU64,
    receive_window: Mutex<CounterWindow>,
    pub(crate) defrag: Mutex<Fragged>,

    paths: Mutex<Vec<Arc<Path>>>,
    locator: Mutex<Option<Locator>>,
    latency: AtomicU16,
    remote_version: AtomicU8,
    is_root: AtomicBool,
    last_receive: AtomicI64,
    last_hello_sent: AtomicI64,
    networks: Mutex<Vec<u64>>,
    dirty: AtomicBool,
}

impl Peer {
    /// Create a peer from a validated identity, deriving the session key by
    /// static-static agreement. None if agreement fails (bad remote key) or
    /// if `local` has no private key.
    pub fn new(local: &Identity, identity: Identity, now: i64) -> Option<Self> {
        let agreed = local.agree(&identity)?;
        let key = kbkdf_sha512::<AES_256_KEY_SIZE>(agreed.as_bytes(), KBKDF_LABEL_SESSION_KEY);
        Some(Self {
            out_direction: local.address() < identity.address(),
            identity,
            cipher: SessionCipher::new(&key),
            send_counter: AtomicU64::new(1),
            receive_window: Mutex::new(CounterWindow::new()),
            defrag: Mutex::new(Fragged::new()),
            paths: Mutex::new(Vec::new()),
            locator: Mutex::new(None),
            latency: AtomicU16::new(u16::MAX),
            remote_version: AtomicU8::new(0),
            is_root: AtomicBool::new(false),
            last_receive: AtomicI64::new(now),
            last_hello_sent: AtomicI64::new(0),
            networks: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(true),
        })
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /* Session crypto */

    pub fn next_send_counter(&self) -> u64 {
        self.send_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn encrypt_in_place(&self, counter: u64, aad: &[u8], data: &mut [u8]) -> Option<[u8; AES_GCM_TAG_SIZE]> {
        self.cipher.encrypt(counter, self.out_direction, aad, data)
    }

    /// Authenticate and decrypt, then claim the counter against replay.
    pub fn decrypt_in_place(&self, counter: u64, aad: &[u8], data: &mut [u8], tag: &[u8; AES_GCM_TAG_SIZE]) -> bool {
        let mut window = self.receive_window.lock().unwrap();
        window.check(counter)
            && self.cipher.decrypt(counter, !self.out_direction, aad, data, tag)
            && window.update(counter)
    }

    /* Paths */

    /// Record a new or existing path after an authenticated receive and
    /// recompute path preference. LRU-evicts by last receive beyond the cap.
    pub fn learn_path(&self, endpoint: &Endpoint, now: i64) {
        let mut paths = self.paths.lock().unwrap();
        if let Some(p) = paths.iter().find(|p| p.endpoint == *endpoint) {
            p.received(now);
        } else {
            if paths.len() >= MAX_PEER_PATHS {
                if let Some((lru, _)) = paths
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, p)| p.last_receive())
                    .map(|(i, p)| (i, p.last_receive()))
                {
                    paths.remove(lru);
                }
            }
            paths.push(Arc::new(Path::new(endpoint.clone(), now)));
            self.dirty.store(true, Ordering::Relaxed);
        }
        Self::update_preference(&paths, now);
        self.last_receive.store(now, Ordering::Relaxed);
    }

    fn update_preference(paths: &[Arc<Path>], now: i64) {
        if let Some(best) = paths.iter().max_by_key(|p| p.rank(now)) {
            for p in paths {
                p.set_preferred(Arc::ptr_eq(p, best));
            }
        }
    }

    /// The current best path: alive and preferred first, then minimum
    /// latency family/recency ordering.
    pub fn best_path(&self, now: i64) -> Option<Arc<Path>> {
        let paths = self.paths.lock().unwrap();
        paths.iter().max_by_key(|p| p.rank(now)).filter(|p| p.alive(now)).cloned()
    }

    pub fn paths(&self) -> Vec<Arc<Path>> {
        self.paths.lock().unwrap().clone()
    }

    pub fn has_live_path(&self, now: i64) -> bool {
        self.paths.lock().unwrap().iter().any(|p| p.alive(now))
    }

    /* Bookkeeping */

    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> Option<u16> {
        let l = self.latency.load(Ordering::Relaxed);
        (l != u16::MAX).then_some(l)
    }

    pub fn record_latency(&self, sample_ms: i64) {
        self.latency.store(sample_ms.clamp(0, (u16::MAX - 1) as i64) as u16, Ordering::Relaxed);
    }

    pub fn remote_version(&self) -> u8 {
        self.remote_version.load(Ordering::Relaxed)
    }

    pub fn set_remote_version(&self, v: u8) {
        self.remote_version.store(v, Ordering::Relaxed);
    }

    pub fn is_root(&self) -> bool {
        self.is_root.load(Ordering::Relaxed)
    }

    pub fn set_root(&self, root: bool) {
        self.is_root.store(root, Ordering::Relaxed);
    }

    pub fn last_hello_sent(&self) -> i64 {
        self.last_hello_sent.load(Ordering::Relaxed)
    }

    pub fn record_hello_sent(&self, now: i64) {
        self.last_hello_sent.store(now, Ordering::Relaxed);
    }

    pub fn locator(&self) -> Option<Locator> {
        self.locator.lock().unwrap().clone()
    }

    /// Adopt a locator if it verifies against this peer's identity and is
    /// newer than any we already hold.
    pub fn set_locator(&self, locator: Locator) -> bool {
        if *locator.signer() != *self.identity.fingerprint() || !locator.verify(&self.identity) {
            return false;
        }
        let mut slot = self.locator.lock().unwrap();
        if slot.as_ref().is_some_and(|l| l.timestamp() >= locator.timestamp()) {
            return false;
        }
        *slot = Some(locator);
        self.dirty.store(true, Ordering::Relaxed);
        true
    }

    pub fn networks(&self) -> Vec<u64> {
        self.networks.lock().unwrap().clone()
    }

    pub fn note_network(&self, nwid: u64) {
        let mut n = self.networks.lock().unwrap();
        if !n.contains(&nwid) {
            n.push(nwid);
        }
    }

    /// Take the dirty flag, true if state changed since the last persist.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    /* Persistence */

    /// Serialize for the state store: public identity, known endpoints,
    /// optional locator.
    pub fn marshal(&self, w: &mut MarshalWriter<'_>) {
        self.identity.marshal(w, false);
        let paths = self.paths.lock().unwrap();
        w.u8(paths.len() as u8);
        for p in paths.iter() {
            p.endpoint.marshal(w);
        }
        match self.locator.lock().unwrap().as_ref() {
            Some(l) => {
                w.u8(1);
                l.marshal(w);
            }
            None => w.u8(0),
        }
    }

    /// Decode a persisted peer record into its parts. Session state is not
    /// persisted; it is re-derived when the peer is reconstructed.
    pub fn unmarshal_record(r: &mut MarshalReader<'_>) -> Result<(Identity, Vec<Endpoint>, Option<Locator>), InvalidFormatError> {
        let identity = Identity::unmarshal(r)?;
        let n = r.u8()? as usize;
        if n > MAX_PEER_PATHS {
            return Err(InvalidFormatError);
        }
        let mut endpoints = Vec::with_capacity(n);
        for _ in 0..n {
            endpoints.push(Endpoint::unmarshal(r)?);
        }
        let locator = match r.u8()? {
            0 => None,
            1 => Some(Locator::unmarshal(r)?),
            _ => return Err(InvalidFormatError),
        };
        Ok((identity, endpoints, locator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vl1::identity::IdentityType;

    fn udp(s: &str) -> Endpoint {
        Endpoint::IpUdp(s.parse().unwrap())
    }

    #[test]
    fn session_crypto_between_two_peers() {
        let a = Identity::generate(IdentityType::C25519);
        let b = Identity::generate(IdentityType::C25519);
        let a_sees_b = Peer::new(&a, b.clone_public(), 0).unwrap();
        let b_sees_a = Peer::new(&b, a.clone_public(), 0).unwrap();

        let counter = a_sees_b.next_send_counter();
        let mut data = *b"frame data";
        let tag = a_sees_b.encrypt_in_place(counter, b"aad", &mut data).unwrap();
        assert!(b_sees_a.decrypt_in_place(counter, b"aad", &mut data, &tag));
        assert_eq!(&data, b"frame data");

        // Replay of the same counter must be rejected.
        let mut replay = *b"frame data";
        let tag2 = a_sees_b.encrypt_in_place(counter, b"aad", &mut replay).unwrap();
        assert!(!b_sees_a.decrypt_in_place(counter, b"aad", &mut replay, &tag2));
    }

    #[test]
    fn path_cap_evicts_lru() {
        let a = Identity::generate(IdentityType::C25519);
        let b = Identity::generate(IdentityType::C25519);
        let peer = Peer::new(&a, b.clone_public(), 0).unwrap();
        for i in 0..MAX_PEER_PATHS + 4 {
            peer.learn_path(&udp(&format!("10.0.0.{}:9993", i + 1)), i as i64);
        }
        let paths = peer.paths();
        assert_eq!(paths.len(), MAX_PEER_PATHS);
        // The oldest paths were evicted.
        assert!(paths.iter().all(|p| p.endpoint != udp("10.0.0.1:9993")));
        // Exactly one preferred path, and it is the best ranked.
        assert_eq!(paths.iter().filter(|p| p.preferred()).count(), 1);
    }

    #[test]
    fn persistence_record_round_trip() {
        let a = Identity::generate(IdentityType::C25519);
        let b = Identity::generate(IdentityType::C25519);
        let peer = Peer::new(&a, b.clone_public(), 0).unwrap();
        peer.learn_path(&udp("10.1.2.3:9993"), 7);
        let mut v = Vec::new();
        peer.marshal(&mut MarshalWriter(&mut v));
        let (id, eps, loc) = Peer::unmarshal_record(&mut MarshalReader::new(&v)).unwrap();
        assert_eq!(id, b.clone_public());
        assert_eq!(eps, vec![udp("10.1.2.3:9993")]);
        assert!(loc.is_none());
    }
}

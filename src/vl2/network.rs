/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::vl1::address::Address;
use crate::vl1::fingerprint::Fingerprint;
use crate::vl1::mac::Mac;
use crate::vl2::multicastgroup::MulticastGroup;
use crate::vl2::networkconfig::NetworkConfig;
use crate::vl2::networkid::NetworkId;
use crate::vl2::rules::{filter, FilterOutcome, FrameContext, Tag};

/// Membership status as reported to the host.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VirtualNetworkStatus {
    RequestingConfiguration = 0,
    Ok = 1,
    AccessDenied = 2,
    NotFound = 3,
}

pub use crate::vl2::networkconfig::VirtualNetworkType;

/// Network lifecycle operations delivered through the config callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VirtualNetworkConfigOperation {
    /// First bring-up after join.
    Up = 1,
    /// Configuration changed while up.
    ConfigUpdate = 2,
    /// Transient down, membership retained.
    Down = 3,
    /// Permanently left.
    Destroy = 4,
}

struct Inner {
    status: VirtualNetworkStatus,
    config: Option<NetworkConfig>,
    subscriptions: BTreeSet<MulticastGroup>,
    last_config_request: i64,
    last_multicast_announce: i64,
    dirty: bool,
}

/// One joined virtual network: status, controller pinning, the current
/// config, and multicast subscriptions.
pub struct Network {
    id: NetworkId,
    /// Our MAC on this network, fixed by the address-derived mapping.
    mac: Mac,
    controller_fingerprint: Option<Fingerprint>,
    inner: Mutex<Inner>,
}

impl Network {
    pub fn new(id: NetworkId, controller_fingerprint: Option<Fingerprint>, member: Address) -> Self {
        Self {
            id,
            mac: Mac::from_address(member, id.to_u64()),
            controller_fingerprint,
            inner: Mutex::new(Inner {
                status: VirtualNetworkStatus::RequestingConfiguration,
                config: None,
                subscriptions: BTreeSet::new(),
                last_config_request: 0,
                last_multicast_announce: 0,
                dirty: false,
            }),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> NetworkId {
        self.id
    }

    #[inline(always)]
    pub fn mac(&self) -> Mac {
        self.mac
    }

    pub fn controller_fingerprint(&self) -> Option<Fingerprint> {
        self.controller_fingerprint
    }

    pub fn status(&self) -> VirtualNetworkStatus {
        self.inner.lock().unwrap().status
    }

    pub fn set_status(&self, status: VirtualNetworkStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let changed = inner.status != status;
        inner.status = status;
        changed
    }

    /// Snapshot of the current config, if one has been applied.
    pub fn config(&self) -> Option<NetworkConfig> {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().unwrap().config.as_ref().map_or(0, |c| c.revision)
    }

    /// Apply a config delivered by the controller.
    ///
    /// Rejects configs for the wrong network or member outright; a config
    /// whose revision does not exceed the current one is ignored. Returns
    /// whether the config became live.
    pub fn apply_config(&self, config: NetworkConfig, member: Address) -> Result<bool, crate::error::ResultCode> {
        if config.network_id != self.id || config.issued_to != member || !config.valid() {
            return Err(crate::error::ResultCode::ErrorInvalidCredential);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.config.as_ref().is_some_and(|c| c.revision >= config.revision) {
            return Ok(false);
        }
        inner.config = Some(config);
        inner.status = VirtualNetworkStatus::Ok;
        inner.dirty = true;
        Ok(true)
    }

    /// True if the delivering node's fingerprint satisfies the pin set at
    /// join time (always true when unpinned).
    pub fn controller_allowed(&self, delivered_by: &Fingerprint) -> bool {
        self.controller_fingerprint.as_ref().map_or(true, |pin| pin.matches(delivered_by))
    }

    /* Multicast */

    /// Idempotent subscribe; true if the subscription is new.
    pub fn multicast_subscribe(&self, group: MulticastGroup) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let added = inner.subscriptions.insert(group);
        inner.dirty |= added;
        added
    }

    /// Unsubscribe; a group with a zero MAC clears all subscriptions.
    pub fn multicast_unsubscribe(&self, group: MulticastGroup) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = if group.mac.to_u64() == 0 {
            let had = !inner.subscriptions.is_empty();
            inner.subscriptions.clear();
            had
        } else {
            inner.subscriptions.remove(&group)
        };
        inner.dirty |= removed;
        removed
    }

    pub fn subscriptions(&self) -> Vec<MulticastGroup> {
        self.inner.lock().unwrap().subscriptions.iter().copied().collect()
    }

    pub fn is_subscribed(&self, group: &MulticastGroup) -> bool {
        self.inner.lock().unwrap().subscriptions.contains(group)
    }

    /* Rule engine entry */

    /// Run the filter for a frame traversing this network. `sender_tags`
    /// are the sender's credential tags where known (our own tags for
    /// outbound frames).
    #[allow(clippy::too_many_arguments)]
    pub fn filter_frame(
        &self,
        inbound: bool,
        src_zt: Address,
        dest_zt: Address,
        src_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        frame: &[u8],
        sender_tags: &[Tag],
        random: u32,
    ) -> FilterOutcome {
        let inner = self.inner.lock().unwrap();
        let Some(config) = inner.config.as_ref() else {
            return FilterOutcome::default();
        };
        let sender_ip_authenticated = dissect_source_ip(ethertype, frame)
            .map(|ip| config.coo_authenticates_ip(src_zt, &ip))
            .unwrap_or(false);
        let ctx = FrameContext {
            inbound,
            src_zt,
            dest_zt,
            src_mac,
            dest_mac,
            ethertype,
            vlan_id: 0,
            vlan_pcp: 0,
            vlan_dei: 0,
            frame,
            sender_tags,
            receiver_tags: &config.tags,
            sender_ip_authenticated,
            sender_mac_authenticated: config.coo_authenticates_mac(src_zt, &src_mac)
                || src_mac == Mac::from_address(src_zt, self.id.to_u64()),
            random,
        };
        filter(&config.rules, &config.capabilities, &ctx)
    }

    /// True if the IP falls inside this network's assigned address space,
    /// used to refuse physical paths that would recurse through the overlay.
    pub fn contains_ip(&self, ip: &IpAddr) -> bool {
        self.inner
            .lock()
            .unwrap()
            .config
            .as_ref()
            .is_some_and(|c| c.assigned_addresses.iter().any(|a| a.contains(ip)))
    }

    /* Background task bookkeeping */

    pub fn last_config_request(&self) -> i64 {
        self.inner.lock().unwrap().last_config_request
    }

    pub fn record_config_request(&self, now: i64) {
        self.inner.lock().unwrap().last_config_request = now;
    }

    pub fn last_multicast_announce(&self) -> i64 {
        self.inner.lock().unwrap().last_multicast_announce
    }

    pub fn record_multicast_announce(&self, now: i64) {
        self.inner.lock().unwrap().last_multicast_announce = now;
    }

    pub fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.inner.lock().unwrap().dirty)
    }
}

fn dissect_source_ip(ethertype: u16, frame: &[u8]) -> Option<IpAddr> {
    match ethertype {
        0x0800 if frame.len() >= 20 => Some(std::net::Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]).into()),
        0x86dd if frame.len() >= 40 => {
            let b: [u8; 16] = frame[8..24].try_into().unwrap();
            Some(std::net::Ipv6Addr::from(b).into())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vl2::networkconfig::InetCidr;
    use crate::vl2::rules::{Rule, RuleValue};

    fn member() -> Address {
        Address::from_u64(0x1122334455).unwrap()
    }

    fn network() -> Network {
        Network::new(NetworkId::from_u64(0x8056c2e21c000001).unwrap(), None, member())
    }

    fn config_rev(rev: u64) -> NetworkConfig {
        let mut c = NetworkConfig::new(NetworkId::from_u64(0x8056c2e21c000001).unwrap(), member());
        c.revision = rev;
        c.rules.push(Rule::action(RuleValue::ActionAccept));
        c.assigned_addresses.push(InetCidr { ip: "10.147.17.5".parse().unwrap(), bits: 24 });
        c
    }

    #[test]
    fn config_revision_monotonicity() {
        let n = network();
        assert_eq!(n.status(), VirtualNetworkStatus::RequestingConfiguration);
        assert!(n.apply_config(config_rev(2), member()).unwrap());
        assert_eq!(n.status(), VirtualNetworkStatus::Ok);
        assert_eq!(n.revision(), 2);
        // Equal or older revisions are ignored without error.
        assert!(!n.apply_config(config_rev(2), member()).unwrap());
        assert!(!n.apply_config(config_rev(1), member()).unwrap());
        assert!(n.apply_config(config_rev(3), member()).unwrap());
        assert_eq!(n.revision(), 3);
    }

    #[test]
    fn wrong_member_or_network_rejected() {
        let n = network();
        let other = Address::from_u64(0x9988776655).unwrap();
        assert!(n.apply_config(config_rev(1), other).is_err());
        let mut c = config_rev(1);
        c.network_id = NetworkId::from_u64(0x8056c2e21c000002).unwrap();
        assert!(n.apply_config(c, member()).is_err());
    }

    #[test]
    fn multicast_subscription_idempotence() {
        let n = network();
        let g = MulticastGroup::broadcast_for_ipv4("10.147.17.5".parse().unwrap());
        assert!(n.multicast_subscribe(g));
        assert!(!n.multicast_subscribe(g));
        assert_eq!(n.subscriptions().len(), 1);

        assert!(n.multicast_unsubscribe(g));
        assert!(!n.multicast_unsubscribe(g));

        // Zero MAC clears everything.
        n.multicast_subscribe(g);
        n.multicast_subscribe(MulticastGroup::new(Mac::from_u64(0x0111_2233_4455), 0));
        assert!(n.multicast_unsubscribe(MulticastGroup::new(Mac::from_u64(0), 0)));
        assert!(n.subscriptions().is_empty());
    }

    #[test]
    fn recursion_guard_address_space() {
        let n = network();
        n.apply_config(config_rev(1), member()).unwrap();
        assert!(n.contains_ip(&"10.147.17.77".parse().unwrap()));
        assert!(!n.contains_ip(&"192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn filter_without_config_drops() {
        let n = network();
        let out = n.filter_frame(
            true,
            member(),
            member(),
            Mac::from_u64(2),
            Mac::from_u64(3),
            0x0800,
            &[0u8; 20],
            &[],
            0,
        );
        assert!(!out.accept);
    }
}

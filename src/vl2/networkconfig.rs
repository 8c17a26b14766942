/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::IpAddr;

use crate::error::InvalidFormatError;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::address::Address;
use crate::vl1::mac::Mac;
use crate::vl2::networkid::NetworkId;
use crate::vl2::rules::{Capability, Rule, Tag, MAX_CAPABILITY_RULES, MAX_NETWORK_RULES};

pub const MAX_NETWORK_SHORT_NAME_LENGTH: usize = 127;
pub const MAX_NETWORK_ROUTES: usize = 64;
pub const MAX_ZT_ASSIGNED_ADDRESSES: usize = 32;
pub const MAX_NETWORK_CAPABILITIES: usize = 128;
pub const MAX_NETWORK_TAGS: usize = 128;
pub const MAX_CERTIFICATES_OF_OWNERSHIP: usize = 4;

/// Virtual network MTU bounds.
pub const MIN_VIRTUAL_MTU: u16 = 1280;
pub const MAX_VIRTUAL_MTU: u16 = 10000;
pub const DEFAULT_VIRTUAL_MTU: u16 = 2800;

/// Whether a network requires credentials or admits anyone.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VirtualNetworkType {
    Private = 0,
    Public = 1,
}

/// An IP network in CIDR form.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InetCidr {
    pub ip: IpAddr,
    pub bits: u8,
}

impl InetCidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.ip, ip) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let m = if self.bits == 0 { 0 } else { u32::MAX << (32 - self.bits.min(32) as u32) };
                (u32::from(*a) & m) == (u32::from(net) & m)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let (net, a) = (net.octets(), a.octets());
                let mut bits = self.bits.min(128) as usize;
                for i in 0..16 {
                    if bits == 0 {
                        return true;
                    }
                    let m = if bits >= 8 { 0xffu8 } else { 0xff << (8 - bits) };
                    if (net[i] & m) != (a[i] & m) {
                        return false;
                    }
                    bits = bits.saturating_sub(8);
                }
                true
            }
            _ => false,
        }
    }

    fn marshal(&self, w: &mut MarshalWriter<'_>) {
        match self.ip {
            IpAddr::V4(a) => {
                w.u8(4);
                w.bytes(&a.octets());
            }
            IpAddr::V6(a) => {
                w.u8(6);
                w.bytes(&a.octets());
            }
        }
        w.u8(self.bits);
    }

    fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        let ip: IpAddr = match r.u8()? {
            4 => std::net::Ipv4Addr::from(r.array::<4>()?).into(),
            6 => std::net::Ipv6Addr::from(r.array::<16>()?).into(),
            _ => return Err(InvalidFormatError),
        };
        Ok(Self { ip, bits: r.u8()? })
    }
}

/// A route the controller pushes to members.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Route {
    pub target: InetCidr,
    /// Gateway, or None for LAN-local.
    pub via: Option<IpAddr>,
    pub flags: u16,
    pub metric: u16,
}

/// A certificate of ownership: the controller's statement that a member owns
/// particular MAC and IP addresses inside the network.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CertificateOfOwnership {
    pub id: u32,
    pub timestamp: i64,
    pub issued_to: Address,
    pub macs: Vec<Mac>,
    pub ips: Vec<IpAddr>,
}

impl CertificateOfOwnership {
    pub fn owns_mac(&self, mac: &Mac) -> bool {
        self.macs.contains(mac)
    }

    pub fn owns_ip(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip)
    }
}

/// Everything a controller tells a member about a network.
///
/// Canonically ordered binary marshal; the revision must increase for a
/// config to replace a previous one.
#[derive(Clone, PartialEq, Debug)]
pub struct NetworkConfig {
    pub network_id: NetworkId,
    pub timestamp: i64,
    pub revision: u64,
    pub issued_to: Address,
    pub name: String,
    pub network_type: VirtualNetworkType,
    pub mtu: u16,
    pub broadcast_enabled: bool,
    pub bridging_allowed: bool,
    pub multicast_limit: u32,
    pub assigned_addresses: Vec<InetCidr>,
    pub routes: Vec<Route>,
    pub rules: Vec<Rule>,
    pub capabilities: Vec<Capability>,
    pub tags: Vec<Tag>,
    pub certificates_of_ownership: Vec<CertificateOfOwnership>,
}

impl NetworkConfig {
    pub fn new(network_id: NetworkId, issued_to: Address) -> Self {
        Self {
            network_id,
            timestamp: 0,
            revision: 0,
            issued_to,
            name: String::new(),
            network_type: VirtualNetworkType::Private,
            mtu: DEFAULT_VIRTUAL_MTU,
            broadcast_enabled: true,
            bridging_allowed: false,
            multicast_limit: 32,
            assigned_addresses: Vec::new(),
            routes: Vec::new(),
            rules: Vec::new(),
            capabilities: Vec::new(),
            tags: Vec::new(),
            certificates_of_ownership: Vec::new(),
        }
    }

    /// Bounds and sanity checks applied on every decode and before every
    /// apply, so an out-of-spec config can never become live state.
    pub fn valid(&self) -> bool {
        self.name.len() <= MAX_NETWORK_SHORT_NAME_LENGTH
            && (MIN_VIRTUAL_MTU..=MAX_VIRTUAL_MTU).contains(&self.mtu)
            && self.assigned_addresses.len() <= MAX_ZT_ASSIGNED_ADDRESSES
            && self.routes.len() <= MAX_NETWORK_ROUTES
            && self.rules.len() <= MAX_NETWORK_RULES
            && self.capabilities.len() <= MAX_NETWORK_CAPABILITIES
            && self.capabilities.iter().all(|c| c.rules.len() <= MAX_CAPABILITY_RULES)
            && self.tags.len() <= MAX_NETWORK_TAGS
            && self.certificates_of_ownership.len() <= MAX_CERTIFICATES_OF_OWNERSHIP
    }

    /// True if any certificate of ownership held for `member` covers the MAC.
    pub fn coo_authenticates_mac(&self, member: Address, mac: &Mac) -> bool {
        self.certificates_of_ownership.iter().any(|c| c.issued_to == member && c.owns_mac(mac))
    }

    /// True if any certificate of ownership held for `member` covers the IP.
    pub fn coo_authenticates_ip(&self, member: Address, ip: &IpAddr) -> bool {
        self.certificates_of_ownership.iter().any(|c| c.issued_to == member && c.owns_ip(ip))
    }

    pub fn marshal(&self, w: &mut MarshalWriter<'_>) {
        w.u64(self.network_id.to_u64());
        w.i64(self.timestamp);
        w.u64(self.revision);
        w.u40(self.issued_to.to_u64());
        w.str(&self.name);
        w.u8(self.network_type as u8);
        w.u16(self.mtu);
        w.u8((self.broadcast_enabled as u8) | ((self.bridging_allowed as u8) << 1));
        w.u32(self.multicast_limit);

        w.u8(self.assigned_addresses.len() as u8);
        for a in &self.assigned_addresses {
            a.marshal(w);
        }
        w.u8(self.routes.len() as u8);
        for route in &self.routes {
            route.target.marshal(w);
            match route.via {
                Some(IpAddr::V4(a)) => {
                    w.u8(4);
                    w.bytes(&a.octets());
                }
                Some(IpAddr::V6(a)) => {
                    w.u8(6);
                    w.bytes(&a.octets());
                }
                None => w.u8(0),
            }
            w.u16(route.flags);
            w.u16(route.metric);
        }
        w.u16(self.rules.len() as u16);
        for rule in &self.rules {
            rule.marshal(w);
        }
        w.u8(self.capabilities.len() as u8);
        for cap in &self.capabilities {
            w.u32(cap.id);
            w.i64(cap.timestamp);
            w.u8(cap.rules.len() as u8);
            for rule in &cap.rules {
                rule.marshal(w);
            }
        }
        w.u8(self.tags.len() as u8);
        for tag in &self.tags {
            w.u32(tag.id);
            w.u32(tag.value);
        }
        w.u8(self.certificates_of_ownership.len() as u8);
        for coo in &self.certificates_of_ownership {
            w.u32(coo.id);
            w.i64(coo.timestamp);
            w.u40(coo.issued_to.to_u64());
            w.u8(coo.macs.len() as u8);
            for m in &coo.macs {
                w.bytes(&m.to_bytes());
            }
            w.u8(coo.ips.len() as u8);
            for ip in &coo.ips {
                match ip {
                    IpAddr::V4(a) => {
                        w.u8(4);
                        w.bytes(&a.octets());
                    }
                    IpAddr::V6(a) => {
                        w.u8(6);
                        w.bytes(&a.octets());
                    }
                }
            }
        }
    }

    pub fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        let network_id = NetworkId::from_u64(r.u64()?).ok_or(InvalidFormatError)?;
        let timestamp = r.i64()?;
        let revision = r.u64()?;
        let issued_to = Address::from_u64(r.u40()?).ok_or(InvalidFormatError)?;
        let name = r.str()?.to_string();
        let network_type = match r.u8()? {
            0 => VirtualNetworkType::Private,
            1 => VirtualNetworkType::Public,
            _ => return Err(InvalidFormatError),
        };
        let mtu = r.u16()?;
        let flags = r.u8()?;
        let multicast_limit = r.u32()?;

        fn unmarshal_ip(r: &mut MarshalReader<'_>) -> Result<IpAddr, InvalidFormatError> {
            match r.u8()? {
                4 => Ok(std::net::Ipv4Addr::from(r.array::<4>()?).into()),
                6 => Ok(std::net::Ipv6Addr::from(r.array::<16>()?).into()),
                _ => Err(InvalidFormatError),
            }
        }

        let n = r.u8()? as usize;
        let mut assigned_addresses = Vec::with_capacity(n.min(MAX_ZT_ASSIGNED_ADDRESSES));
        for _ in 0..n {
            assigned_addresses.push(InetCidr::unmarshal(r)?);
        }
        let n = r.u8()? as usize;
        let mut routes = Vec::with_capacity(n.min(MAX_NETWORK_ROUTES));
        for _ in 0..n {
            let target = InetCidr::unmarshal(r)?;
            let via = match r.u8()? {
                0 => None,
                4 => Some(IpAddr::from(std::net::Ipv4Addr::from(r.array::<4>()?))),
                6 => Some(IpAddr::from(std::net::Ipv6Addr::from(r.array::<16>()?))),
                _ => return Err(InvalidFormatError),
            };
            routes.push(Route { target, via, flags: r.u16()?, metric: r.u16()? });
        }
        let n = r.u16()? as usize;
        let mut rules = Vec::with_capacity(n.min(MAX_NETWORK_RULES));
        for _ in 0..n {
            rules.push(Rule::unmarshal(r)?);
        }
        let n = r.u8()? as usize;
        let mut capabilities = Vec::with_capacity(n.min(MAX_NETWORK_CAPABILITIES));
        for _ in 0..n {
            let id = r.u32()?;
            let timestamp = r.i64()?;
            let rn = r.u8()? as usize;
            let mut cap_rules = Vec::with_capacity(rn.min(MAX_CAPABILITY_RULES));
            for _ in 0..rn {
                cap_rules.push(Rule::unmarshal(r)?);
            }
            capabilities.push(Capability { id, timestamp, rules: cap_rules });
        }
        let n = r.u8()? as usize;
        let mut tags = Vec::with_capacity(n.min(MAX_NETWORK_TAGS));
        for _ in 0..n {
            tags.push(Tag { id: r.u32()?, value: r.u32()? });
        }
        let n = r.u8()? as usize;
        let mut certificates_of_ownership = Vec::with_capacity(n.min(MAX_CERTIFICATES_OF_OWNERSHIP));
        for _ in 0..n {
            let id = r.u32()?;
            let timestamp = r.i64()?;
            let issued_to = Address::from_u64(r.u40()?).ok_or(InvalidFormatError)?;
            let mn = r.u8()? as usize;
            let mut macs = Vec::with_capacity(mn.min(8));
            for _ in 0..mn {
                macs.push(Mac::from_bytes(&r.array()?));
            }
            let inx = r.u8()? as usize;
            let mut ips = Vec::with_capacity(inx.min(8));
            for _ in 0..inx {
                ips.push(unmarshal_ip(r)?);
            }
            certificates_of_ownership.push(CertificateOfOwnership { id, timestamp, issued_to, macs, ips });
        }

        let c = Self {
            network_id,
            timestamp,
            revision,
            issued_to,
            name,
            network_type,
            mtu,
            broadcast_enabled: flags & 0x01 != 0,
            bridging_allowed: flags & 0x02 != 0,
            multicast_limit,
            assigned_addresses,
            routes,
            rules,
            capabilities,
            tags,
            certificates_of_ownership,
        };
        if !c.valid() {
            return Err(InvalidFormatError);
        }
        Ok(c)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.marshal(&mut MarshalWriter(&mut v));
        v
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, InvalidFormatError> {
        let mut r = MarshalReader::new(b);
        let c = Self::unmarshal(&mut r)?;
        if !r.is_empty() {
            return Err(InvalidFormatError);
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vl2::rules::RuleValue;

    fn config() -> NetworkConfig {
        let nwid = NetworkId::from_u64(0x8056c2e21c000001).unwrap();
        let member = Address::from_u64(0x1122334455).unwrap();
        let mut c = NetworkConfig::new(nwid, member);
        c.timestamp = 1000;
        c.revision = 3;
        c.name = "earth".to_string();
        c.assigned_addresses.push(InetCidr { ip: "10.147.17.5".parse().unwrap(), bits: 24 });
        c.routes.push(Route {
            target: InetCidr { ip: "10.147.17.0".parse().unwrap(), bits: 24 },
            via: None,
            flags: 0,
            metric: 0,
        });
        c.rules.push(Rule::action(RuleValue::ActionAccept));
        c.tags.push(Tag { id: 1, value: 2 });
        c.certificates_of_ownership.push(CertificateOfOwnership {
            id: 1,
            timestamp: 1000,
            issued_to: member,
            macs: vec![Mac::from_u64(0x020102030405)],
            ips: vec!["10.147.17.5".parse().unwrap()],
        });
        c
    }

    #[test]
    fn round_trip() {
        let c = config();
        let b = c.to_bytes();
        let d = NetworkConfig::from_bytes(&b).unwrap();
        assert_eq!(d, c);
        assert_eq!(d.to_bytes(), b);
    }

    #[test]
    fn mtu_bounds_enforced() {
        let mut c = config();
        c.mtu = 900;
        assert!(!c.valid());
        assert!(NetworkConfig::from_bytes(&c.to_bytes()).is_err());
    }

    #[test]
    fn coo_lookup() {
        let c = config();
        let member = c.issued_to;
        assert!(c.coo_authenticates_mac(member, &Mac::from_u64(0x020102030405)));
        assert!(!c.coo_authenticates_mac(member, &Mac::from_u64(0x020102030406)));
        assert!(c.coo_authenticates_ip(member, &"10.147.17.5".parse().unwrap()));
        assert!(!c.coo_authenticates_ip(member, &"10.147.17.6".parse().unwrap()));
    }

    #[test]
    fn cidr_containment() {
        let cidr = InetCidr { ip: "10.147.17.0".parse().unwrap(), bits: 24 };
        assert!(cidr.contains(&"10.147.17.200".parse().unwrap()));
        assert!(!cidr.contains(&"10.147.18.1".parse().unwrap()));
        let v6 = InetCidr { ip: "fd00::".parse().unwrap(), bits: 8 };
        assert!(v6.contains(&"fd00::1".parse().unwrap()));
        assert!(!v6.contains(&"fe80::1".parse().unwrap()));
    }
}

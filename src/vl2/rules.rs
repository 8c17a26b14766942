/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::InvalidFormatError;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::address::Address;
use crate::vl1::mac::Mac;

/// Maximum rules in a network's base rule table.
pub const MAX_NETWORK_RULES: usize = 1024;
/// Maximum rules attached to a single capability.
pub const MAX_CAPABILITY_RULES: usize = 64;

/* Packet characteristic bits, a fixed part of the rules ABI. */

pub const CHARACTERISTICS_INBOUND: u64 = 0x8000000000000000;
pub const CHARACTERISTICS_MULTICAST: u64 = 0x4000000000000000;
pub const CHARACTERISTICS_BROADCAST: u64 = 0x2000000000000000;
pub const CHARACTERISTICS_SENDER_IP_AUTHENTICATED: u64 = 0x1000000000000000;
pub const CHARACTERISTICS_SENDER_MAC_AUTHENTICATED: u64 = 0x0800000000000000;
pub const CHARACTERISTICS_TCP_RESERVED_0: u64 = 0x0000000000000800;
pub const CHARACTERISTICS_TCP_RESERVED_1: u64 = 0x0000000000000400;
pub const CHARACTERISTICS_TCP_RESERVED_2: u64 = 0x0000000000000200;
pub const CHARACTERISTICS_TCP_NS: u64 = 0x0000000000000100;
pub const CHARACTERISTICS_TCP_CWR: u64 = 0x0000000000000080;
pub const CHARACTERISTICS_TCP_ECE: u64 = 0x0000000000000040;
pub const CHARACTERISTICS_TCP_URG: u64 = 0x0000000000000020;
pub const CHARACTERISTICS_TCP_ACK: u64 = 0x0000000000000010;
pub const CHARACTERISTICS_TCP_PSH: u64 = 0x0000000000000008;
pub const CHARACTERISTICS_TCP_RST: u64 = 0x0000000000000004;
pub const CHARACTERISTICS_TCP_SYN: u64 = 0x0000000000000002;
pub const CHARACTERISTICS_TCP_FIN: u64 = 0x0000000000000001;

/* Rule type codes; the low six bits of the packed wire byte. */

const T_ACTION_DROP: u8 = 0;
const T_ACTION_ACCEPT: u8 = 1;
const T_ACTION_TEE: u8 = 2;
const T_ACTION_WATCH: u8 = 3;
const T_ACTION_REDIRECT: u8 = 4;
const T_ACTION_BREAK: u8 = 5;
const T_ACTION_PRIORITY: u8 = 6;
const T_MATCH_SOURCE_ZT: u8 = 24;
const T_MATCH_DEST_ZT: u8 = 25;
const T_MATCH_VLAN_ID: u8 = 26;
const T_MATCH_VLAN_PCP: u8 = 27;
const T_MATCH_VLAN_DEI: u8 = 28;
const T_MATCH_MAC_SOURCE: u8 = 29;
const T_MATCH_MAC_DEST: u8 = 30;
const T_MATCH_IPV4_SOURCE: u8 = 31;
const T_MATCH_IPV4_DEST: u8 = 32;
const T_MATCH_IPV6_SOURCE: u8 = 33;
const T_MATCH_IPV6_DEST: u8 = 34;
const T_MATCH_IP_TOS: u8 = 35;
const T_MATCH_IP_PROTOCOL: u8 = 36;
const T_MATCH_ETHERTYPE: u8 = 37;
const T_MATCH_ICMP: u8 = 38;
const T_MATCH_IP_SOURCE_PORT_RANGE: u8 = 39;
const T_MATCH_IP_DEST_PORT_RANGE: u8 = 40;
const T_MATCH_CHARACTERISTICS: u8 = 41;
const T_MATCH_FRAME_SIZE_RANGE: u8 = 42;
const T_MATCH_RANDOM: u8 = 43;
const T_MATCH_TAGS_DIFFERENCE: u8 = 44;
const T_MATCH_TAGS_BITWISE_AND: u8 = 45;
const T_MATCH_TAGS_BITWISE_OR: u8 = 46;
const T_MATCH_TAGS_BITWISE_XOR: u8 = 47;
const T_MATCH_TAGS_EQUAL: u8 = 48;
const T_MATCH_TAG_SENDER: u8 = 49;
const T_MATCH_TAG_RECEIVER: u8 = 50;
const T_MATCH_INTEGER_RANGE: u8 = 51;

/// A credential tag: a 32-bit id/value pair assigned per member by the
/// controller, compared between sender and receiver by tag match rules.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Tag {
    pub id: u32,
    pub value: u32,
}

/// Destination and options for TEE, WATCH, and REDIRECT actions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Forward {
    pub address: Address,
    pub flags: u32,
    /// Maximum bytes of the frame to duplicate; zero means the whole frame.
    pub length: u16,
}

/// The value half of a rule; which variant is in use is the rule's type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RuleValue {
    ActionDrop,
    ActionAccept,
    ActionTee(Forward),
    ActionWatch(Forward),
    ActionRedirect(Forward),
    ActionBreak,
    ActionPriority { qos_bucket: u8 },

    MatchSourceZtAddress(Address),
    MatchDestZtAddress(Address),
    MatchVlanId(u16),
    MatchVlanPcp(u8),
    MatchVlanDei(u8),
    MatchMacSource(Mac),
    MatchMacDest(Mac),
    MatchIpv4Source { ip: Ipv4Addr, mask: u8 },
    MatchIpv4Dest { ip: Ipv4Addr, mask: u8 },
    MatchIpv6Source { ip: [u8; 16], mask: u8 },
    MatchIpv6Dest { ip: [u8; 16], mask: u8 },
    MatchIpTos { mask: u8, value: [u8; 2] },
    MatchIpProtocol(u8),
    MatchEthertype(u16),
    MatchIcmp { icmp_type: u8, code: u8, flags: u8 },
    MatchIpSourcePortRange([u16; 2]),
    MatchIpDestPortRange([u16; 2]),
    MatchCharacteristics(u64),
    MatchFrameSizeRange([u16; 2]),
    /// Matches with probability `p / u32::MAX`.
    MatchRandom(u32),
    MatchTagsDifference { id: u32, value: u32 },
    MatchTagsBitwiseAnd { id: u32, value: u32 },
    MatchTagsBitwiseOr { id: u32, value: u32 },
    MatchTagsBitwiseXor { id: u32, value: u32 },
    MatchTagsEqual { id: u32, value: u32 },
    MatchTagSender { id: u32, value: u32 },
    MatchTagReceiver { id: u32, value: u32 },
    /// Match an integer extracted from the frame payload against
    /// `[start, start + end]`. `format` low six bits are width minus one
    /// in bits; bit 6 set means little-endian extraction.
    MatchIntegerRange { start: u64, end: u32, idx: u16, format: u8 },
}

/// One rule table entry: a value plus the NOT and OR modifier bits, which
/// affect matches only.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Rule {
    pub not: bool,
    pub or: bool,
    pub value: RuleValue,
}

impl Rule {
    pub fn action(value: RuleValue) -> Self {
        debug_assert!(value.is_action());
        Self { not: false, or: false, value }
    }

    pub fn match_value(value: RuleValue) -> Self {
        Self { not: false, or: false, value }
    }

    pub fn match_not(value: RuleValue) -> Self {
        Self { not: true, or: false, value }
    }

    pub fn is_action(&self) -> bool {
        self.value.is_action()
    }

    fn type_code(&self) -> u8 {
        use RuleValue::*;
        match self.value {
            ActionDrop => T_ACTION_DROP,
            ActionAccept => T_ACTION_ACCEPT,
            ActionTee(_) => T_ACTION_TEE,
            ActionWatch(_) => T_ACTION_WATCH,
            ActionRedirect(_) => T_ACTION_REDIRECT,
            ActionBreak => T_ACTION_BREAK,
            ActionPriority { .. } => T_ACTION_PRIORITY,
            MatchSourceZtAddress(_) => T_MATCH_SOURCE_ZT,
            MatchDestZtAddress(_) => T_MATCH_DEST_ZT,
            MatchVlanId(_) => T_MATCH_VLAN_ID,
            MatchVlanPcp(_) => T_MATCH_VLAN_PCP,
            MatchVlanDei(_) => T_MATCH_VLAN_DEI,
            MatchMacSource(_) => T_MATCH_MAC_SOURCE,
            MatchMacDest(_) => T_MATCH_MAC_DEST,
            MatchIpv4Source { .. } => T_MATCH_IPV4_SOURCE,
            MatchIpv4Dest { .. } => T_MATCH_IPV4_DEST,
            MatchIpv6Source { .. } => T_MATCH_IPV6_SOURCE,
            MatchIpv6Dest { .. } => T_MATCH_IPV6_DEST,
            MatchIpTos { .. } => T_MATCH_IP_TOS,
            MatchIpProtocol(_) => T_MATCH_IP_PROTOCOL,
            MatchEthertype(_) => T_MATCH_ETHERTYPE,
            MatchIcmp { .. } => T_MATCH_ICMP,
            MatchIpSourcePortRange(_) => T_MATCH_IP_SOURCE_PORT_RANGE,
            MatchIpDestPortRange(_) => T_MATCH_IP_DEST_PORT_RANGE,
            MatchCharacteristics(_) => T_MATCH_CHARACTERISTICS,
            MatchFrameSizeRange(_) => T_MATCH_FRAME_SIZE_RANGE,
            MatchRandom(_) => T_MATCH_RANDOM,
            MatchTagsDifference { .. } => T_MATCH_TAGS_DIFFERENCE,
            MatchTagsBitwiseAnd { .. } => T_MATCH_TAGS_BITWISE_AND,
            MatchTagsBitwiseOr { .. } => T_MATCH_TAGS_BITWISE_OR,
            MatchTagsBitwiseXor { .. } => T_MATCH_TAGS_BITWISE_XOR,
            MatchTagsEqual { .. } => T_MATCH_TAGS_EQUAL,
            MatchTagSender { .. } => T_MATCH_TAG_SENDER,
            MatchTagReceiver { .. } => T_MATCH_TAG_RECEIVER,
            MatchIntegerRange { .. } => T_MATCH_INTEGER_RANGE,
        }
    }

    /// Wire form preserves the packed `NOT | OR | type` first byte.
    pub fn marshal(&self, w: &mut MarshalWriter<'_>) {
        use RuleValue::*;
        w.u8(((self.not as u8) << 7) | ((self.or as u8) << 6) | self.type_code());
        match &self.value {
            ActionDrop | ActionAccept | ActionBreak => {}
            ActionTee(f) | ActionWatch(f) | ActionRedirect(f) => {
                w.u40(f.address.to_u64());
                w.u32(f.flags);
                w.u16(f.length);
            }
            ActionPriority { qos_bucket } => w.u8(*qos_bucket),
            MatchSourceZtAddress(a) | MatchDestZtAddress(a) => w.u40(a.to_u64()),
            MatchVlanId(v) => w.u16(*v),
            MatchVlanPcp(v) | MatchVlanDei(v) | MatchIpProtocol(v) => w.u8(*v),
            MatchMacSource(m) | MatchMacDest(m) => w.bytes(&m.to_bytes()),
            MatchIpv4Source { ip, mask } | MatchIpv4Dest { ip, mask } => {
                w.bytes(&ip.octets());
                w.u8(*mask);
            }
            MatchIpv6Source { ip, mask } | MatchIpv6Dest { ip, mask } => {
                w.bytes(ip);
                w.u8(*mask);
            }
            MatchIpTos { mask, value } => {
                w.u8(*mask);
                w.bytes(value);
            }
            MatchEthertype(v) => w.u16(*v),
            MatchIcmp { icmp_type, code, flags } => {
                w.u8(*icmp_type);
                w.u8(*code);
                w.u8(*flags);
            }
            MatchIpSourcePortRange(p) | MatchIpDestPortRange(p) | MatchFrameSizeRange(p) => {
                w.u16(p[0]);
                w.u16(p[1]);
            }
            MatchCharacteristics(c) => w.u64(*c),
            MatchRandom(p) => w.u32(*p),
            MatchTagsDifference { id, value }
            | MatchTagsBitwiseAnd { id, value }
            | MatchTagsBitwiseOr { id, value }
            | MatchTagsBitwiseXor { id, value }
            | MatchTagsEqual { id, value }
            | MatchTagSender { id, value }
            | MatchTagReceiver { id, value } => {
                w.u32(*id);
                w.u32(*value);
            }
            MatchIntegerRange { start, end, idx, format } => {
                w.u64(*start);
                w.u32(*end);
                w.u16(*idx);
                w.u8(*format);
            }
        }
    }

    pub fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        use RuleValue::*;
        let t = r.u8()?;
        let not = t & 0x80 != 0;
        let or = t & 0x40 != 0;
        fn addr(r: &mut MarshalReader<'_>) -> Result<Address, InvalidFormatError> {
            Address::from_u64(r.u40()?).ok_or(InvalidFormatError)
        }
        fn fwd(r: &mut MarshalReader<'_>) -> Result<Forward, InvalidFormatError> {
            Ok(Forward { address: addr(r)?, flags: r.u32()?, length: r.u16()? })
        }
        fn tag(r: &mut MarshalReader<'_>) -> Result<(u32, u32), InvalidFormatError> {
            Ok((r.u32()?, r.u32()?))
        }
        let value = match t & 0x3f {
            T_ACTION_DROP => ActionDrop,
            T_ACTION_ACCEPT => ActionAccept,
            T_ACTION_TEE => ActionTee(fwd(r)?),
            T_ACTION_WATCH => ActionWatch(fwd(r)?),
            T_ACTION_REDIRECT => ActionRedirect(fwd(r)?),
            T_ACTION_BREAK => ActionBreak,
            T_ACTION_PRIORITY => ActionPriority { qos_bucket: r.u8()? },
            T_MATCH_SOURCE_ZT => MatchSourceZtAddress(addr(r)?),
            T_MATCH_DEST_ZT => MatchDestZtAddress(addr(r)?),
            T_MATCH_VLAN_ID => MatchVlanId(r.u16()?),
            T_MATCH_VLAN_PCP => MatchVlanPcp(r.u8()?),
            T_MATCH_VLAN_DEI => MatchVlanDei(r.u8()?),
            T_MATCH_MAC_SOURCE => MatchMacSource(Mac::from_bytes(&r.array()?)),
            T_MATCH_MAC_DEST => MatchMacDest(Mac::from_bytes(&r.array()?)),
            T_MATCH_IPV4_SOURCE => MatchIpv4Source { ip: Ipv4Addr::from(r.array::<4>()?), mask: r.u8()? },
            T_MATCH_IPV4_DEST => MatchIpv4Dest { ip: Ipv4Addr::from(r.array::<4>()?), mask: r.u8()? },
            T_MATCH_IPV6_SOURCE => MatchIpv6Source { ip: r.array()?, mask: r.u8()? },
            T_MATCH_IPV6_DEST => MatchIpv6Dest { ip: r.array()?, mask: r.u8()? },
            T_MATCH_IP_TOS => MatchIpTos { mask: r.u8()?, value: r.array()? },
            T_MATCH_IP_PROTOCOL => MatchIpProtocol(r.u8()?),
            T_MATCH_ETHERTYPE => MatchEthertype(r.u16()?),
            T_MATCH_ICMP => MatchIcmp { icmp_type: r.u8()?, code: r.u8()?, flags: r.u8()? },
            T_MATCH_IP_SOURCE_PORT_RANGE => MatchIpSourcePortRange([r.u16()?, r.u16()?]),
            T_MATCH_IP_DEST_PORT_RANGE => MatchIpDestPortRange([r.u16()?, r.u16()?]),
            T_MATCH_CHARACTERISTICS => MatchCharacteristics(r.u64()?),
            T_MATCH_FRAME_SIZE_RANGE => MatchFrameSizeRange([r.u16()?, r.u16()?]),
            T_MATCH_RANDOM => MatchRandom(r.u32()?),
            T_MATCH_TAGS_DIFFERENCE => {
                let (id, value) = tag(r)?;
                MatchTagsDifference { id, value }
            }
            T_MATCH_TAGS_BITWISE_AND => {
                let (id, value) = tag(r)?;
                MatchTagsBitwiseAnd { id, value }
            }
            T_MATCH_TAGS_BITWISE_OR => {
                let (id, value) = tag(r)?;
                MatchTagsBitwiseOr { id, value }
            }
            T_MATCH_TAGS_BITWISE_XOR => {
                let (id, value) = tag(r)?;
                MatchTagsBitwiseXor { id, value }
            }
            T_MATCH_TAGS_EQUAL => {
                let (id, value) = tag(r)?;
                MatchTagsEqual { id, value }
            }
            T_MATCH_TAG_SENDER => {
                let (id, value) = tag(r)?;
                MatchTagSender { id, value }
            }
            T_MATCH_TAG_RECEIVER => {
                let (id, value) = tag(r)?;
                MatchTagReceiver { id, value }
            }
            T_MATCH_INTEGER_RANGE => MatchIntegerRange { start: r.u64()?, end: r.u32()?, idx: r.u16()?, format: r.u8()? },
            _ => return Err(InvalidFormatError),
        };
        Ok(Self { not, or, value })
    }
}

impl RuleValue {
    pub fn is_action(&self) -> bool {
        use RuleValue::*;
        matches!(
            self,
            ActionDrop | ActionAccept | ActionTee(_) | ActionWatch(_) | ActionRedirect(_) | ActionBreak | ActionPriority { .. }
        )
    }
}

/// A capability credential: a bounded rule set granted to a member that is
/// evaluated if the base rule table ends in BREAK.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Capability {
    pub id: u32,
    pub timestamp: i64,
    pub rules: Vec<Rule>,
}

/* Frame context and IP dissection */

/// Everything the rule engine can see about one frame.
pub struct FrameContext<'a> {
    pub inbound: bool,
    pub src_zt: Address,
    pub dest_zt: Address,
    pub src_mac: Mac,
    pub dest_mac: Mac,
    pub ethertype: u16,
    pub vlan_id: u16,
    pub vlan_pcp: u8,
    pub vlan_dei: u8,
    /// The Ethernet payload (no MAC header; MACs are carried separately).
    pub frame: &'a [u8],
    /// Sender's credential tags, as pushed by the controller.
    pub sender_tags: &'a [Tag],
    /// Our own credential tags.
    pub receiver_tags: &'a [Tag],
    /// True if a certificate of ownership authenticates the sender's source IP.
    pub sender_ip_authenticated: bool,
    /// True if a certificate of ownership authenticates the sender's MAC.
    pub sender_mac_authenticated: bool,
    /// Uniform random draw for MATCH_RANDOM, fresh per evaluation.
    pub random: u32,
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const IP_PROTO_ICMPV6: u8 = 58;

struct IpInfo {
    src: std::net::IpAddr,
    dest: std::net::IpAddr,
    protocol: u8,
    tos: u8,
    /// Offset of the layer 4 header within the frame.
    l4: usize,
}

fn dissect_ip(ethertype: u16, frame: &[u8]) -> Option<IpInfo> {
    match ethertype {
        ETHERTYPE_IPV4 => {
            if frame.len() < 20 || frame[0] >> 4 != 4 {
                return None;
            }
            let ihl = ((frame[0] & 0x0f) as usize) * 4;
            if ihl < 20 || frame.len() < ihl {
                return None;
            }
            Some(IpInfo {
                src: Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]).into(),
                dest: Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]).into(),
                protocol: frame[9],
                tos: frame[1],
                l4: ihl,
            })
        }
        ETHERTYPE_IPV6 => {
            if frame.len() < 40 || frame[0] >> 4 != 6 {
                return None;
            }
            let src: [u8; 16] = frame[8..24].try_into().unwrap();
            let dest: [u8; 16] = frame[24..40].try_into().unwrap();
            Some(IpInfo {
                src: Ipv6Addr::from(src).into(),
                dest: Ipv6Addr::from(dest).into(),
                // Extension header chains are not walked; the next header
                // field covers the overwhelmingly common case.
                protocol: frame[6],
                tos: (frame[0] << 4) | (frame[1] >> 4),
                l4: 40,
            })
        }
        _ => None,
    }
}

fn l4_ports(ip: &IpInfo, frame: &[u8]) -> Option<(u16, u16)> {
    if ip.protocol != IP_PROTO_TCP && ip.protocol != IP_PROTO_UDP {
        return None;
    }
    if frame.len() < ip.l4 + 4 {
        return None;
    }
    let src = u16::from_be_bytes(frame[ip.l4..ip.l4 + 2].try_into().unwrap());
    let dest = u16::from_be_bytes(frame[ip.l4 + 2..ip.l4 + 4].try_into().unwrap());
    Some((src, dest))
}

/// Compute the characteristics word for a frame: direction, multicast and
/// broadcast bits, credential-authentication bits, and TCP flag bits when
/// the frame is TCP.
pub fn frame_characteristics(ctx: &FrameContext<'_>) -> u64 {
    let mut c = 0u64;
    if ctx.inbound {
        c |= CHARACTERISTICS_INBOUND;
    }
    if ctx.dest_mac.is_broadcast() {
        c |= CHARACTERISTICS_BROADCAST | CHARACTERISTICS_MULTICAST;
    } else if ctx.dest_mac.is_multicast() {
        c |= CHARACTERISTICS_MULTICAST;
    }
    if ctx.sender_ip_authenticated {
        c |= CHARACTERISTICS_SENDER_IP_AUTHENTICATED;
    }
    if ctx.sender_mac_authenticated {
        c |= CHARACTERISTICS_SENDER_MAC_AUTHENTICATED;
    }
    if let Some(ip) = dissect_ip(ctx.ethertype, ctx.frame) {
        if ip.protocol == IP_PROTO_TCP && ctx.frame.len() >= ip.l4 + 14 {
            // Low 8 flag bits plus NS from the reserved nibble.
            c |= ctx.frame[ip.l4 + 13] as u64;
            if ctx.frame[ip.l4 + 12] & 0x01 != 0 {
                c |= CHARACTERISTICS_TCP_NS;
            }
        }
    }
    c
}

fn find_tag(tags: &[Tag], id: u32) -> Option<u32> {
    tags.iter().find(|t| t.id == id).map(|t| t.value)
}

fn ip_match_v4(ip: Ipv4Addr, against: std::net::IpAddr, mask: u8) -> bool {
    match against {
        std::net::IpAddr::V4(a) => {
            let m = if mask == 0 { 0 } else { u32::MAX << (32 - mask.min(32) as u32) };
            (u32::from(a) & m) == (u32::from(ip) & m)
        }
        _ => false,
    }
}

fn ip_match_v6(ip: &[u8; 16], against: std::net::IpAddr, mask: u8) -> bool {
    match against {
        std::net::IpAddr::V6(a) => {
            let a = a.octets();
            let mut bits = mask.min(128) as usize;
            for i in 0..16 {
                if bits == 0 {
                    return true;
                }
                let m = if bits >= 8 { 0xffu8 } else { 0xff << (8 - bits) };
                if (a[i] & m) != (ip[i] & m) {
                    return false;
                }
                bits = bits.saturating_sub(8);
            }
            true
        }
        _ => false,
    }
}

/// Extract the integer for MATCH_INTEGER_RANGE from the frame payload.
fn extract_integer(frame: &[u8], idx: u16, format: u8) -> Option<u64> {
    let bits = ((format & 0x3f) as u32) + 1;
    let little_endian = format & 0x40 != 0;
    let nbytes = bits.div_ceil(8) as usize;
    let start = idx as usize;
    let bytes = frame.get(start..start + nbytes)?;
    let mut v = 0u64;
    if little_endian {
        for b in bytes.iter().rev() {
            v = (v << 8) | *b as u64;
        }
    } else {
        for b in bytes {
            v = (v << 8) | *b as u64;
        }
    }
    if bits < 64 {
        v &= (1u64 << bits) - 1;
    }
    Some(v)
}

fn rule_matches(value: &RuleValue, ctx: &FrameContext<'_>, characteristics: u64) -> bool {
    use RuleValue::*;
    let ip = dissect_ip(ctx.ethertype, ctx.frame);
    match value {
        MatchSourceZtAddress(a) => *a == ctx.src_zt,
        MatchDestZtAddress(a) => *a == ctx.dest_zt,
        MatchVlanId(v) => *v == ctx.vlan_id,
        MatchVlanPcp(v) => *v == ctx.vlan_pcp,
        MatchVlanDei(v) => *v == ctx.vlan_dei,
        MatchMacSource(m) => *m == ctx.src_mac,
        MatchMacDest(m) => *m == ctx.dest_mac,
        MatchIpv4Source { ip: net, mask } => ip.as_ref().is_some_and(|i| ip_match_v4(*net, i.src, *mask)),
        MatchIpv4Dest { ip: net, mask } => ip.as_ref().is_some_and(|i| ip_match_v4(*net, i.dest, *mask)),
        MatchIpv6Source { ip: net, mask } => ip.as_ref().is_some_and(|i| ip_match_v6(net, i.src, *mask)),
        MatchIpv6Dest { ip: net, mask } => ip.as_ref().is_some_and(|i| ip_match_v6(net, i.dest, *mask)),
        MatchIpTos { mask, value } => ip
            .as_ref()
            .is_some_and(|i| {
                let tos = i.tos & mask;
                tos >= value[0] && tos <= value[1]
            }),
        MatchIpProtocol(p) => ip.as_ref().is_some_and(|i| i.protocol == *p),
        MatchEthertype(e) => *e == ctx.ethertype,
        MatchIcmp { icmp_type, code, flags } => ip.as_ref().is_some_and(|i| {
            if i.protocol != IP_PROTO_ICMP && i.protocol != IP_PROTO_ICMPV6 {
                return false;
            }
            let Some(h) = ctx.frame.get(i.l4..i.l4 + 2) else {
                return false;
            };
            h[0] == *icmp_type && (flags & 0x01 == 0 || h[1] == *code)
        }),
        MatchIpSourcePortRange(range) => ip
            .as_ref()
            .and_then(|i| l4_ports(i, ctx.frame))
            .is_some_and(|(src, _)| src >= range[0] && src <= range[1]),
        MatchIpDestPortRange(range) => ip
            .as_ref()
            .and_then(|i| l4_ports(i, ctx.frame))
            .is_some_and(|(_, dest)| dest >= range[0] && dest <= range[1]),
        MatchCharacteristics(mask) => characteristics & mask != 0,
        MatchFrameSizeRange(range) => {
            let len = ctx.frame.len() as u16;
            len >= range[0] && len <= range[1]
        }
        MatchRandom(p) => ctx.random <= *p,
        MatchTagsDifference { id, value } => match (find_tag(ctx.sender_tags, *id), find_tag(ctx.receiver_tags, *id)) {
            (Some(s), Some(r)) => s.abs_diff(r) <= *value,
            _ => false,
        },
        MatchTagsBitwiseAnd { id, value } => match (find_tag(ctx.sender_tags, *id), find_tag(ctx.receiver_tags, *id)) {
            (Some(s), Some(r)) => s & r == *value,
            _ => false,
        },
        MatchTagsBitwiseOr { id, value } => match (find_tag(ctx.sender_tags, *id), find_tag(ctx.receiver_tags, *id)) {
            (Some(s), Some(r)) => s | r == *value,
            _ => false,
        },
        MatchTagsBitwiseXor { id, value } => match (find_tag(ctx.sender_tags, *id), find_tag(ctx.receiver_tags, *id)) {
            (Some(s), Some(r)) => s ^ r == *value,
            _ => false,
        },
        MatchTagsEqual { id, value } => match (find_tag(ctx.sender_tags, *id), find_tag(ctx.receiver_tags, *id)) {
            (Some(s), Some(r)) => s == *value && r == *value,
            _ => false,
        },
        MatchTagSender { id, value } => find_tag(ctx.sender_tags, *id) == Some(*value),
        MatchTagReceiver { id, value } => find_tag(ctx.receiver_tags, *id) == Some(*value),
        MatchIntegerRange { start, end, idx, format } => extract_integer(ctx.frame, *idx, *format)
            .is_some_and(|v| v >= *start && v <= start.saturating_add(*end as u64)),
        _ => false,
    }
}

/// What a filter run decided, including side effects to perform.
#[derive(Default, Debug)]
pub struct FilterOutcome {
    pub accept: bool,
    /// Capability whose rule set produced the accept, if any.
    pub matched_capability: Option<u32>,
    /// QoS bucket selected by an ACTION_PRIORITY along the way.
    pub qos_bucket: Option<u8>,
    /// Frame duplications requested by TEE and WATCH actions; the bool is
    /// true for WATCH destinations.
    pub tees: Vec<(Forward, bool)>,
    /// New destination if an ACTION_REDIRECT fired.
    pub redirect: Option<Address>,
}

enum SetResult {
    Accept,
    Drop,
    /// Exited via BREAK: subsequent (capability) rule sets may still run.
    Break,
    /// Fell off the end without any action firing.
    NoMatch,
}

fn eval_rule_set(rules: &[Rule], ctx: &FrameContext<'_>, outcome: &mut FilterOutcome) -> SetResult {
    let characteristics = frame_characteristics(ctx);
    let mut acc = true;
    for rule in rules {
        if rule.is_action() {
            if acc {
                use RuleValue::*;
                match &rule.value {
                    ActionDrop => return SetResult::Drop,
                    ActionAccept => return SetResult::Accept,
                    ActionBreak => return SetResult::Break,
                    ActionRedirect(f) => {
                        outcome.redirect = Some(f.address);
                        return SetResult::Accept;
                    }
                    ActionTee(f) => outcome.tees.push((*f, false)),
                    ActionWatch(f) => outcome.tees.push((*f, true)),
                    ActionPriority { qos_bucket } => outcome.qos_bucket = Some(*qos_bucket),
                    _ => unreachable!(),
                }
            }
            acc = true;
        } else {
            let m = rule_matches(&rule.value, ctx, characteristics) ^ rule.not;
            acc = if rule.or { acc || m } else { acc && m };
        }
    }
    SetResult::NoMatch
}

/// Run the full filter: the base rule table, then, only if the base table
/// exited via BREAK, each capability's rule set in order. The default with
/// no accept anywhere is DROP.
pub fn filter(base: &[Rule], capabilities: &[Capability], ctx: &FrameContext<'_>) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    match eval_rule_set(base, ctx, &mut outcome) {
        SetResult::Accept => {
            outcome.accept = true;
            return outcome;
        }
        SetResult::Drop | SetResult::NoMatch => return outcome,
        SetResult::Break => {}
    }
    for cap in capabilities {
        match eval_rule_set(&cap.rules, ctx, &mut outcome) {
            SetResult::Accept => {
                outcome.accept = true;
                outcome.matched_capability = Some(cap.id);
                return outcome;
            }
            SetResult::Drop => return outcome,
            SetResult::Break | SetResult::NoMatch => {}
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(inbound: bool, frame: &'a [u8], ethertype: u16) -> FrameContext<'a> {
        FrameContext {
            inbound,
            src_zt: Address::from_u64(0x1111111111).unwrap(),
            dest_zt: Address::from_u64(0x2222222222).unwrap(),
            src_mac: Mac::from_u64(0x020000000001),
            dest_mac: Mac::from_u64(0x020000000002),
            ethertype,
            vlan_id: 0,
            vlan_pcp: 0,
            vlan_dei: 0,
            frame,
            sender_tags: &[],
            receiver_tags: &[],
            sender_ip_authenticated: false,
            sender_mac_authenticated: false,
            random: 0,
        }
    }

    /// Minimal IPv4/TCP frame with the given TCP flag byte.
    fn tcp_frame(flags: u8) -> Vec<u8> {
        let mut f = vec![0u8; 40];
        f[0] = 0x45; // v4, ihl 5
        f[9] = IP_PROTO_TCP;
        f[12..16].copy_from_slice(&[10, 0, 0, 1]);
        f[16..20].copy_from_slice(&[10, 0, 0, 2]);
        // TCP: src port 33000, dst port 80
        f[20..22].copy_from_slice(&33000u16.to_be_bytes());
        f[22..24].copy_from_slice(&80u16.to_be_bytes());
        f[33] = flags;
        f
    }

    #[test]
    fn empty_rule_set_drops() {
        let frame = tcp_frame(0x02);
        let out = filter(&[], &[], &ctx(true, &frame, ETHERTYPE_IPV4));
        assert!(!out.accept);
    }

    #[test]
    fn action_with_no_matches_always_fires() {
        let frame = tcp_frame(0);
        let out = filter(&[Rule::action(RuleValue::ActionAccept)], &[], &ctx(true, &frame, ETHERTYPE_IPV4));
        assert!(out.accept);
    }

    #[test]
    fn drop_inbound_tcp_syn() {
        // [MATCH_CHARACTERISTICS(INBOUND|TCP_SYN), ACTION_DROP, ACTION_ACCEPT]
        let rules = [
            Rule::match_value(RuleValue::MatchCharacteristics(CHARACTERISTICS_INBOUND)),
            Rule {
                not: false,
                or: false,
                value: RuleValue::MatchCharacteristics(CHARACTERISTICS_TCP_SYN),
            },
            Rule::action(RuleValue::ActionDrop),
            Rule::action(RuleValue::ActionAccept),
        ];
        let syn = tcp_frame(0x02);
        let ack = tcp_frame(0x10);

        assert!(!filter(&rules, &[], &ctx(true, &syn, ETHERTYPE_IPV4)).accept);
        assert!(filter(&rules, &[], &ctx(true, &ack, ETHERTYPE_IPV4)).accept);
        // Outbound SYN passes.
        assert!(filter(&rules, &[], &ctx(false, &syn, ETHERTYPE_IPV4)).accept);
    }

    #[test]
    fn syn_only_rules_default_drop_everything_else() {
        let rules = [
            Rule::match_value(RuleValue::MatchCharacteristics(CHARACTERISTICS_INBOUND)),
            Rule::match_value(RuleValue::MatchCharacteristics(CHARACTERISTICS_TCP_SYN)),
            Rule::action(RuleValue::ActionDrop),
        ];
        let ack = tcp_frame(0x10);
        // No accept exists, so even a non-matching frame falls to default DROP.
        assert!(!filter(&rules, &[], &ctx(true, &ack, ETHERTYPE_IPV4)).accept);
    }

    #[test]
    fn not_bit_inverts() {
        let frame = tcp_frame(0);
        let rules = [
            Rule::match_not(RuleValue::MatchEthertype(ETHERTYPE_IPV6)),
            Rule::action(RuleValue::ActionAccept),
        ];
        assert!(filter(&rules, &[], &ctx(true, &frame, ETHERTYPE_IPV4)).accept);
        assert!(!filter(&rules, &[], &ctx(true, &frame, ETHERTYPE_IPV6)).accept);
    }

    #[test]
    fn or_combines_clauses() {
        let frame = tcp_frame(0);
        let mut or_rule = Rule::match_value(RuleValue::MatchIpProtocol(IP_PROTO_UDP));
        or_rule.or = true;
        let rules = [
            Rule::match_value(RuleValue::MatchIpProtocol(IP_PROTO_TCP)),
            or_rule,
            Rule::action(RuleValue::ActionAccept),
        ];
        assert!(filter(&rules, &[], &ctx(true, &frame, ETHERTYPE_IPV4)).accept);

        let mut udp = tcp_frame(0);
        udp[9] = IP_PROTO_UDP;
        assert!(filter(&rules, &[], &ctx(true, &udp, ETHERTYPE_IPV4)).accept);

        let mut icmp = tcp_frame(0);
        icmp[9] = IP_PROTO_ICMP;
        assert!(!filter(&rules, &[], &ctx(true, &icmp, ETHERTYPE_IPV4)).accept);
    }

    #[test]
    fn break_falls_through_to_capabilities() {
        let frame = tcp_frame(0);
        let base = [Rule::action(RuleValue::ActionBreak)];
        let cap = Capability { id: 7, timestamp: 0, rules: vec![Rule::action(RuleValue::ActionAccept)] };
        let out = filter(&base, &[cap], &ctx(true, &frame, ETHERTYPE_IPV4));
        assert!(out.accept);
        assert_eq!(out.matched_capability, Some(7));

        // Without BREAK, capabilities are not consulted.
        let base_drop = [Rule::action(RuleValue::ActionDrop)];
        let cap = Capability { id: 7, timestamp: 0, rules: vec![Rule::action(RuleValue::ActionAccept)] };
        assert!(!filter(&base_drop, &[cap], &ctx(true, &frame, ETHERTYPE_IPV4)).accept);
    }

    #[test]
    fn tee_and_priority_accumulate() {
        let frame = tcp_frame(0);
        let dest = Address::from_u64(0x3333333333).unwrap();
        let rules = [
            Rule::action(RuleValue::ActionTee(Forward { address: dest, flags: 0, length: 128 })),
            Rule::action(RuleValue::ActionPriority { qos_bucket: 3 }),
            Rule::action(RuleValue::ActionAccept),
        ];
        let out = filter(&rules, &[], &ctx(true, &frame, ETHERTYPE_IPV4));
        assert!(out.accept);
        assert_eq!(out.qos_bucket, Some(3));
        assert_eq!(out.tees.len(), 1);
        assert_eq!(out.tees[0].0.address, dest);
    }

    #[test]
    fn port_range_and_integer_range() {
        let frame = tcp_frame(0x18);
        let rules = [
            Rule::match_value(RuleValue::MatchIpDestPortRange([80, 80])),
            Rule::action(RuleValue::ActionAccept),
        ];
        assert!(filter(&rules, &[], &ctx(true, &frame, ETHERTYPE_IPV4)).accept);

        // The destination port as a 16-bit big-endian integer at offset 22.
        let rules = [
            Rule::match_value(RuleValue::MatchIntegerRange { start: 79, end: 2, idx: 22, format: 15 }),
            Rule::action(RuleValue::ActionAccept),
        ];
        assert!(filter(&rules, &[], &ctx(true, &frame, ETHERTYPE_IPV4)).accept);

        let rules = [
            Rule::match_value(RuleValue::MatchIntegerRange { start: 100, end: 5, idx: 22, format: 15 }),
            Rule::action(RuleValue::ActionAccept),
        ];
        assert!(!filter(&rules, &[], &ctx(true, &frame, ETHERTYPE_IPV4)).accept);
    }

    #[test]
    fn tag_matches_fail_when_absent() {
        let frame = tcp_frame(0);
        let rules = [
            Rule::match_value(RuleValue::MatchTagsEqual { id: 1, value: 5 }),
            Rule::action(RuleValue::ActionAccept),
        ];
        assert!(!filter(&rules, &[], &ctx(true, &frame, ETHERTYPE_IPV4)).accept);

        let sender = [Tag { id: 1, value: 5 }];
        let receiver = [Tag { id: 1, value: 5 }];
        let mut c = ctx(true, &frame, ETHERTYPE_IPV4);
        c.sender_tags = &sender;
        c.receiver_tags = &receiver;
        assert!(filter(&rules, &[], &c).accept);
    }

    #[test]
    fn rule_wire_round_trip_preserves_packed_byte() {
        let dest = Address::from_u64(0x3333333333).unwrap();
        let all = vec![
            Rule::action(RuleValue::ActionDrop),
            Rule::action(RuleValue::ActionAccept),
            Rule::action(RuleValue::ActionTee(Forward { address: dest, flags: 1, length: 64 })),
            Rule::action(RuleValue::ActionWatch(Forward { address: dest, flags: 0, length: 0 })),
            Rule::action(RuleValue::ActionRedirect(Forward { address: dest, flags: 0, length: 0 })),
            Rule::action(RuleValue::ActionBreak),
            Rule::action(RuleValue::ActionPriority { qos_bucket: 2 }),
            Rule::match_not(RuleValue::MatchSourceZtAddress(dest)),
            Rule { not: true, or: true, value: RuleValue::MatchVlanId(7) },
            Rule::match_value(RuleValue::MatchMacSource(Mac::from_u64(0x010203040506))),
            Rule::match_value(RuleValue::MatchIpv4Source { ip: "10.0.0.0".parse().unwrap(), mask: 8 }),
            Rule::match_value(RuleValue::MatchIpv6Dest { ip: [1u8; 16], mask: 64 }),
            Rule::match_value(RuleValue::MatchIpTos { mask: 0xfc, value: [0, 63] }),
            Rule::match_value(RuleValue::MatchIpProtocol(6)),
            Rule::match_value(RuleValue::MatchEthertype(0x0800)),
            Rule::match_value(RuleValue::MatchIcmp { icmp_type: 8, code: 0, flags: 1 }),
            Rule::match_value(RuleValue::MatchIpSourcePortRange([1024, 65535])),
            Rule::match_value(RuleValue::MatchIpDestPortRange([80, 443])),
            Rule::match_value(RuleValue::MatchCharacteristics(CHARACTERISTICS_INBOUND | CHARACTERISTICS_TCP_SYN)),
            Rule::match_value(RuleValue::MatchFrameSizeRange([64, 1500])),
            Rule::match_value(RuleValue::MatchRandom(0x7fffffff)),
            Rule::match_value(RuleValue::MatchTagsDifference { id: 1, value: 2 }),
            Rule::match_value(RuleValue::MatchTagsBitwiseAnd { id: 1, value: 2 }),
            Rule::match_value(RuleValue::MatchTagsBitwiseOr { id: 1, value: 2 }),
            Rule::match_value(RuleValue::MatchTagsBitwiseXor { id: 1, value: 2 }),
            Rule::match_value(RuleValue::MatchTagsEqual { id: 1, value: 2 }),
            Rule::match_value(RuleValue::MatchTagSender { id: 1, value: 2 }),
            Rule::match_value(RuleValue::MatchTagReceiver { id: 1, value: 2 }),
            Rule::match_value(RuleValue::MatchIntegerRange { start: 1, end: 2, idx: 3, format: 0x4f }),
        ];
        for rule in all {
            let mut v = Vec::new();
            rule.marshal(&mut MarshalWriter(&mut v));
            // First byte preserves NOT/OR/type packing.
            assert_eq!(v[0], ((rule.not as u8) << 7) | ((rule.or as u8) << 6) | rule.type_code());
            let d = Rule::unmarshal(&mut MarshalReader::new(&v)).unwrap();
            assert_eq!(d, rule);
        }
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::InvalidFormatError;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::fingerprint::Fingerprint;
use crate::vl1::mac::Mac;

const TYPE_NIL: u8 = 0;
const TYPE_ZEROTIER: u8 = 1;
const TYPE_ETHERNET: u8 = 2;
const TYPE_WIFI_DIRECT: u8 = 3;
const TYPE_BLUETOOTH: u8 = 4;
const TYPE_IP: u8 = 5;
const TYPE_IP_UDP: u8 = 6;
const TYPE_IP_TCP: u8 = 7;
const TYPE_IP_HTTP: u8 = 8;

/// Where a node can be reached: a tagged variant over every supported
/// physical or virtual transport.
///
/// IP/UDP is the primary transport; the others exist for relaying
/// (ZeroTier), layer 2 transports, and TCP/HTTP fallback.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Endpoint {
    Nil,
    ZeroTier(Fingerprint),
    Ethernet(Mac),
    WifiDirect(Mac),
    Bluetooth(Mac),
    Ip(IpAddr),
    IpUdp(SocketAddr),
    IpTcp(SocketAddr),
    IpHttp(SocketAddr),
}

fn marshal_ip(w: &mut MarshalWriter<'_>, ip: &IpAddr) {
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

fn unmarshal_ip(r: &mut MarshalReader<'_>) -> Result<IpAddr, InvalidFormatError> {
    match r.u8()? {
        4 => Ok(IpAddr::V4(Ipv4Addr::from(r.array::<4>()?))),
        6 => Ok(IpAddr::V6(Ipv6Addr::from(r.array::<16>()?))),
        _ => Err(InvalidFormatError),
    }
}

fn marshal_sockaddr(w: &mut MarshalWriter<'_>, sa: &SocketAddr) {
    marshal_ip(w, &sa.ip());
    w.u16(sa.port());
}

fn unmarshal_sockaddr(r: &mut MarshalReader<'_>) -> Result<SocketAddr, InvalidFormatError> {
    let ip = unmarshal_ip(r)?;
    let port = r.u16()?;
    Ok(SocketAddr::new(ip, port))
}

impl Endpoint {
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Nil => TYPE_NIL,
            Self::ZeroTier(_) => TYPE_ZEROTIER,
            Self::Ethernet(_) => TYPE_ETHERNET,
            Self::WifiDirect(_) => TYPE_WIFI_DIRECT,
            Self::Bluetooth(_) => TYPE_BLUETOOTH,
            Self::Ip(_) => TYPE_IP,
            Self::IpUdp(_) => TYPE_IP_UDP,
            Self::IpTcp(_) => TYPE_IP_TCP,
            Self::IpHttp(_) => TYPE_IP_HTTP,
        }
    }

    /// The underlying IP if this is any IP-based endpoint type.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ip(ip) => Some(*ip),
            Self::IpUdp(sa) | Self::IpTcp(sa) | Self::IpHttp(sa) => Some(sa.ip()),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn marshal(&self, w: &mut MarshalWriter<'_>) {
        w.u8(self.type_id());
        match self {
            Self::Nil => {}
            Self::ZeroTier(fp) => fp.marshal(w),
            Self::Ethernet(m) | Self::WifiDirect(m) | Self::Bluetooth(m) => w.bytes(&m.to_bytes()),
            Self::Ip(ip) => marshal_ip(w, ip),
            Self::IpUdp(sa) | Self::IpTcp(sa) | Self::IpHttp(sa) => marshal_sockaddr(w, sa),
        }
    }

    pub fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        Ok(match r.u8()? {
            TYPE_NIL => Self::Nil,
            TYPE_ZEROTIER => Self::ZeroTier(Fingerprint::unmarshal(r)?),
            TYPE_ETHERNET => Self::Ethernet(Mac::from_bytes(&r.array()?)),
            TYPE_WIFI_DIRECT => Self::WifiDirect(Mac::from_bytes(&r.array()?)),
            TYPE_BLUETOOTH => Self::Bluetooth(Mac::from_bytes(&r.array()?)),
            TYPE_IP => Self::Ip(unmarshal_ip(r)?),
            TYPE_IP_UDP => Self::IpUdp(unmarshal_sockaddr(r)?),
            TYPE_IP_TCP => Self::IpTcp(unmarshal_sockaddr(r)?),
            TYPE_IP_HTTP => Self::IpHttp(unmarshal_sockaddr(r)?),
            _ => return Err(InvalidFormatError),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::ZeroTier(fp) => write!(f, "zt:{fp}"),
            Self::Ethernet(m) => write!(f, "eth:{m}"),
            Self::WifiDirect(m) => write!(f, "wifid:{m}"),
            Self::Bluetooth(m) => write!(f, "bt:{m}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::IpUdp(sa) => write!(f, "udp:{}/{}", sa.ip(), sa.port()),
            Self::IpTcp(sa) => write!(f, "tcp:{}/{}", sa.ip(), sa.port()),
            Self::IpHttp(sa) => write!(f, "http:{}/{}", sa.ip(), sa.port()),
        }
    }
}

fn parse_ip_port(s: &str) -> Result<SocketAddr, InvalidFormatError> {
    let (ip, port) = s.rsplit_once('/').ok_or(InvalidFormatError)?;
    let ip = ip.parse::<IpAddr>().map_err(|_| InvalidFormatError)?;
    let port = port.parse::<u16>().map_err(|_| InvalidFormatError)?;
    Ok(SocketAddr::new(ip, port))
}

impl FromStr for Endpoint {
    type Err = InvalidFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "nil" {
            return Ok(Self::Nil);
        }
        let (scheme, rest) = s.split_once(':').ok_or(InvalidFormatError)?;
        Ok(match scheme {
            "zt" => Self::ZeroTier(rest.parse()?),
            "eth" => Self::Ethernet(rest.parse()?),
            "wifid" => Self::WifiDirect(rest.parse()?),
            "bt" => Self::Bluetooth(rest.parse()?),
            "ip" => Self::Ip(rest.parse().map_err(|_| InvalidFormatError)?),
            "udp" => Self::IpUdp(parse_ip_port(rest)?),
            "tcp" => Self::IpTcp(parse_ip_port(rest)?),
            "http" => Self::IpHttp(parse_ip_port(rest)?),
            _ => return Err(InvalidFormatError),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn examples() -> Vec<Endpoint> {
        vec![
            Endpoint::Nil,
            Endpoint::Ethernet(Mac::from_u64(0x010203040506)),
            Endpoint::Ip("10.0.0.1".parse().unwrap()),
            Endpoint::IpUdp("10.0.0.1:9993".parse().unwrap()),
            Endpoint::IpUdp("[fe80::1]:9993".parse().unwrap()),
            Endpoint::IpTcp("192.168.1.1:443".parse().unwrap()),
            Endpoint::IpHttp("1.2.3.4:80".parse().unwrap()),
        ]
    }

    #[test]
    fn marshal_round_trip() {
        for e in examples() {
            let mut v = Vec::new();
            e.marshal(&mut MarshalWriter(&mut v));
            let d = Endpoint::unmarshal(&mut MarshalReader::new(&v)).unwrap();
            assert_eq!(d, e);
        }
    }

    #[test]
    fn string_round_trip() {
        for e in examples() {
            assert_eq!(e.to_string().parse::<Endpoint>().unwrap(), e);
        }
        assert!("udp:1.2.3.4".parse::<Endpoint>().is_err());
        assert!("carrierpigeon:x".parse::<Endpoint>().is_err());
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::Ipv4Addr;

use crate::vl1::mac::Mac;

/// A multicast group: a multicast MAC plus 32 bits of additional
/// distinguishing information (ADI).
///
/// The ADI is zero for ordinary groups. For IPv4 broadcast the ADI is the
/// IPv4 address in host byte order, which partitions ARP traffic per address
/// so nodes only receive ARP queries for addresses they actually hold.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MulticastGroup {
    pub mac: Mac,
    pub adi: u32,
}

impl MulticastGroup {
    pub fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }

    /// The broadcast group an IPv4 address must subscribe to for ARP.
    pub fn broadcast_for_ipv4(ip: Ipv4Addr) -> Self {
        Self { mac: Mac::from_u64(0xffffffffffff), adi: u32::from(ip) }
    }

    pub fn is_broadcast(&self) -> bool {
        self.mac.is_broadcast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arp_partitioning() {
        let g = MulticastGroup::broadcast_for_ipv4("10.1.2.3".parse().unwrap());
        assert!(g.is_broadcast());
        assert_eq!(g.adi, 0x0a010203);
        let g2 = MulticastGroup::broadcast_for_ipv4("10.1.2.4".parse().unwrap());
        assert_ne!(g, g2);
    }

    #[test]
    fn ordering_is_total() {
        let a = MulticastGroup::new(Mac::from_u64(0x0100_0000_0001), 0);
        let b = MulticastGroup::new(Mac::from_u64(0x0100_0000_0001), 1);
        let c = MulticastGroup::new(Mac::from_u64(0x0100_0000_0002), 0);
        assert!(a < b && b < c);
    }
}

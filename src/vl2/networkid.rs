/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use crate::error::InvalidFormatError;
use crate::util::hex;
use crate::vl1::address::Address;

/// A 64-bit virtual network ID.
///
/// The most significant 40 bits are the address of the network's controller;
/// the low 24 bits are the controller-local network number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct NetworkId(NonZeroU64);

impl NetworkId {
    pub fn from_u64(i: u64) -> Option<Self> {
        // The embedded controller address must itself be valid.
        Address::from_u64(i >> 24)?;
        NonZeroU64::new(i).map(Self)
    }

    #[inline(always)]
    pub fn to_u64(self) -> u64 {
        self.0.get()
    }

    /// The node that issues configuration for this network.
    pub fn controller(self) -> Address {
        Address::from_u64(self.0.get() >> 24).unwrap()
    }

    /// Controller-local network number.
    pub fn network_no(self) -> u32 {
        (self.0.get() & 0xffffff) as u32
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::to_string_u64(self.0.get(), 16))
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for NetworkId {
    type Err = InvalidFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(InvalidFormatError);
        }
        hex::from_string_u64(s).and_then(Self::from_u64).ok_or(InvalidFormatError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_extraction() {
        let nwid = NetworkId::from_u64(0x8056c2e21c000001).unwrap();
        assert_eq!(nwid.controller().to_u64(), 0x8056c2e21c);
        assert_eq!(nwid.network_no(), 1);
        assert_eq!(nwid.to_string(), "8056c2e21c000001");
        assert_eq!("8056c2e21c000001".parse::<NetworkId>().unwrap(), nwid);
    }

    #[test]
    fn invalid_controller_rejected() {
        // Reserved 0xff controller prefix.
        assert!(NetworkId::from_u64(0xff00000001000001).is_none());
        assert!(NetworkId::from_u64(0).is_none());
    }
}

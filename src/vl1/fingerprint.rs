/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::str::FromStr;

use crate::crypto::hash::SHA384_HASH_SIZE;
use crate::error::InvalidFormatError;
use crate::util::hex;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::address::Address;

/// A full identity fingerprint: short address plus SHA-384 of public key material.
///
/// The address alone is only proof-of-work collision resistant; equality of
/// the whole fingerprint is the strong identity check. An all-zero hash is
/// the conventional wildcard meaning "match by address only".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub address: Address,
    pub hash: [u8; SHA384_HASH_SIZE],
}

impl Fingerprint {
    /// True if the hash half is all zero, i.e. only the address is specified.
    pub fn is_address_only(&self) -> bool {
        self.hash.iter().all(|b| *b == 0)
    }

    /// Strong equality, treating an all-zero hash on either side as address-only.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.address == other.address && (self.is_address_only() || other.is_address_only() || self.hash == other.hash)
    }

    pub fn marshal(&self, w: &mut MarshalWriter<'_>) {
        w.u40(self.address.to_u64());
        w.bytes(&self.hash);
    }

    pub fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        let address = Address::from_u64(r.u40()?).ok_or(InvalidFormatError)?;
        let hash = r.array()?;
        Ok(Self { address, hash })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, hex::to_string(&self.hash))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Fingerprint {
    type Err = InvalidFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, hash) = s.split_once(':').ok_or(InvalidFormatError)?;
        let address = addr.parse::<Address>()?;
        let hash = hex::from_string(hash)
            .and_then(|h| <[u8; SHA384_HASH_SIZE]>::try_from(h).ok())
            .ok_or(InvalidFormatError)?;
        Ok(Self { address, hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(hash_byte: u8) -> Fingerprint {
        Fingerprint {
            address: Address::from_u64(0x1122334455).unwrap(),
            hash: [hash_byte; SHA384_HASH_SIZE],
        }
    }

    #[test]
    fn wildcard_hash_matches_by_address() {
        assert!(fp(0).is_address_only());
        assert!(fp(0).matches(&fp(7)));
        assert!(fp(7).matches(&fp(0)));
        assert!(!fp(7).matches(&fp(8)));
        assert!(fp(7).matches(&fp(7)));
    }

    #[test]
    fn string_round_trip() {
        let f = fp(0xab);
        assert_eq!(f.to_string().parse::<Fingerprint>().unwrap(), f);
    }
}

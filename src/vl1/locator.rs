/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::str::FromStr;

use arrayvec::ArrayVec;

use crate::error::{InvalidFormatError, InvalidParameterError};
use crate::util::hex;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::endpoint::Endpoint;
use crate::vl1::fingerprint::Fingerprint;
use crate::vl1::identity::Identity;

pub const LOCATOR_MAX_ENDPOINTS: usize = 8;

/// A signed, timestamped list of endpoints where a node says it can be
/// reached. Newer timestamps supersede older locators for the same signer.
#[derive(Clone, PartialEq, Eq)]
pub struct Locator {
    timestamp: i64,
    endpoints: ArrayVec<Endpoint, LOCATOR_MAX_ENDPOINTS>,
    signer: Fingerprint,
    signature: Vec<u8>,
}

impl Locator {
    /// Create and sign a locator. The signer must hold its private key.
    pub fn create(signer: &Identity, timestamp: i64, endpoints: &[Endpoint]) -> Result<Self, InvalidParameterError> {
        if endpoints.len() > LOCATOR_MAX_ENDPOINTS {
            return Err(InvalidParameterError("too many endpoints"));
        }
        let mut l = Self {
            timestamp,
            endpoints: endpoints.iter().cloned().collect(),
            signer: *signer.fingerprint(),
            signature: Vec::new(),
        };
        l.signature = signer.sign(&l.signing_input())?;
        Ok(l)
    }

    #[inline(always)]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    #[inline(always)]
    pub fn signer(&self) -> &Fingerprint {
        &self.signer
    }

    fn signing_input(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let mut w = MarshalWriter(&mut v);
        w.i64(self.timestamp);
        w.u8(self.endpoints.len() as u8);
        for e in &self.endpoints {
            e.marshal(&mut w);
        }
        self.signer.marshal(&mut w);
        v
    }

    /// Verify the signature against an identity, which must be the identity
    /// this locator names as its signer.
    pub fn verify(&self, signer: &Identity) -> bool {
        *signer.fingerprint() == self.signer && signer.verify(&self.signing_input(), &self.signature)
    }

    pub fn marshal(&self, w: &mut MarshalWriter<'_>) {
        w.bytes(&self.signing_input());
        w.varbytes(&self.signature);
    }

    pub fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        let timestamp = r.i64()?;
        let n = r.u8()? as usize;
        if n > LOCATOR_MAX_ENDPOINTS {
            return Err(InvalidFormatError);
        }
        let mut endpoints = ArrayVec::new();
        for _ in 0..n {
            endpoints.push(Endpoint::unmarshal(r)?);
        }
        let signer = Fingerprint::unmarshal(r)?;
        let signature = r.varbytes()?.to_vec();
        if signature.is_empty() {
            return Err(InvalidFormatError);
        }
        Ok(Self { timestamp, endpoints, signer, signature })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.marshal(&mut MarshalWriter(&mut v));
        v
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, InvalidFormatError> {
        let mut r = MarshalReader::new(b);
        let l = Self::unmarshal(&mut r)?;
        if !r.is_empty() {
            return Err(InvalidFormatError);
        }
        Ok(l)
    }
}

impl fmt::Display for Locator {
    /// Hex of the canonical binary form, one shell-safe token.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::to_string(&self.to_bytes()))
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locator({}, ts {}, {} endpoints)", self.signer.address, self.timestamp, self.endpoints.len())
    }
}

impl FromStr for Locator {
    type Err = InvalidFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&hex::from_string(s).ok_or(InvalidFormatError)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vl1::identity::IdentityType;

    #[test]
    fn create_verify_round_trip() {
        let signer = Identity::generate(IdentityType::C25519);
        let other = Identity::generate(IdentityType::C25519);
        let eps = [
            Endpoint::IpUdp("198.51.100.7:9993".parse().unwrap()),
            Endpoint::IpUdp("[2001:db8::1]:9993".parse().unwrap()),
        ];
        let loc = Locator::create(&signer, 1000, &eps).unwrap();
        assert!(loc.verify(&signer));
        assert!(loc.verify(&signer.clone_public()));
        assert!(!loc.verify(&other));

        let bytes = loc.to_bytes();
        let reloaded = Locator::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded, loc);
        assert_eq!(reloaded.to_bytes(), bytes);
        assert!(reloaded.verify(&signer));

        let text = loc.to_string();
        assert_eq!(text.parse::<Locator>().unwrap(), loc);
    }

    #[test]
    fn signing_requires_private_key() {
        let signer = Identity::generate(IdentityType::C25519);
        assert!(Locator::create(&signer.clone_public(), 1, &[]).is_err());
    }

    #[test]
    fn tampered_locator_fails() {
        let signer = Identity::generate(IdentityType::C25519);
        let loc = Locator::create(&signer, 5, &[Endpoint::IpUdp("10.0.0.1:9993".parse().unwrap())]).unwrap();
        let mut bytes = loc.to_bytes();
        bytes[2] ^= 1;
        match Locator::from_bytes(&bytes) {
            Ok(l) => assert!(!l.verify(&signer)),
            Err(_) => {}
        }
    }
}

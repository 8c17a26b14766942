/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::crypto::p384::{p384_verify, P384EcdsaKeyPair, P384_PUBLIC_KEY_SIZE, P384_SECRET_KEY_SIZE};
use crate::crypto::secret::Secret;
use crate::error::{InvalidFormatError, InvalidParameterError};
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::fingerprint::Fingerprint;
use crate::vl1::identity::Identity;
use crate::vl1::locator::Locator;

use super::certificate::CERTIFICATE_SERIAL_SIZE;

/// Maximum length of any string field in a certificate.
pub const CERTIFICATE_MAX_STRING_LENGTH: usize = 127;

/// Unique ID type tag for NIST P-384; the only type currently defined.
const UNIQUE_ID_TYPE_NIST_P_384: u8 = 1;
/// Unique ID blob: one type byte plus the compressed public key.
pub const UNIQUE_ID_SIZE: usize = 1 + P384_PUBLIC_KEY_SIZE;

const MAX_SUBJECT_IDENTITIES: usize = 16;
const MAX_SUBJECT_NETWORKS: usize = 16;
const MAX_SUBJECT_CERTIFICATES: usize = 16;
const MAX_SUBJECT_UPDATE_URLS: usize = 8;

/// X.509-style information about a real world entity. All fields optional.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Name {
    pub serial_no: String,
    pub common_name: String,
    pub country: String,
    pub organization: String,
    pub unit: String,
    pub locality: String,
    pub province: String,
    pub street_address: String,
    pub postal_code: String,
    pub email: String,
    pub url: String,
    pub host: String,
}

impl Name {
    fn fields(&self) -> [&String; 12] {
        [
            &self.serial_no,
            &self.common_name,
            &self.country,
            &self.organization,
            &self.unit,
            &self.locality,
            &self.province,
            &self.street_address,
            &self.postal_code,
            &self.email,
            &self.url,
            &self.host,
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|f| f.is_empty())
    }

    fn fields_valid(&self) -> bool {
        self.fields().iter().all(|f| f.len() <= CERTIFICATE_MAX_STRING_LENGTH)
    }

    pub(crate) fn marshal(&self, w: &mut MarshalWriter<'_>) {
        for f in self.fields() {
            w.str(f);
        }
    }

    pub(crate) fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        let mut n = Self::default();
        for f in [
            &mut n.serial_no,
            &mut n.common_name,
            &mut n.country,
            &mut n.organization,
            &mut n.unit,
            &mut n.locality,
            &mut n.province,
            &mut n.street_address,
            &mut n.postal_code,
            &mut n.email,
            &mut n.url,
            &mut n.host,
        ] {
            let s = r.str()?;
            if s.len() > CERTIFICATE_MAX_STRING_LENGTH {
                return Err(InvalidFormatError);
            }
            *f = s.to_string();
        }
        Ok(n)
    }
}

/// A node identity named by a subject, with an optional locator.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SubjectIdentity {
    pub identity: Identity,
    pub locator: Option<Locator>,
}

/// A network named by a subject, pinned to its controller's fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SubjectNetwork {
    pub id: u64,
    pub controller: Fingerprint,
}

/// A freshly generated subject unique ID: a P-384 key pair whose public key
/// is the globally unique identifier and whose private key proves ownership.
pub struct SubjectUniqueId {
    pub unique_id: [u8; UNIQUE_ID_SIZE],
    pub private: Secret<P384_SECRET_KEY_SIZE>,
}

impl SubjectUniqueId {
    pub fn generate() -> Self {
        let kp = P384EcdsaKeyPair::generate();
        let mut unique_id = [0u8; UNIQUE_ID_SIZE];
        unique_id[0] = UNIQUE_ID_TYPE_NIST_P_384;
        unique_id[1..].copy_from_slice(&kp.public_bytes());
        Self { unique_id, private: kp.secret_bytes() }
    }
}

/// The entity a certificate identifies: identities, networks, subordinate
/// certificate serials, update URLs, a human-readable name, and optionally a
/// self-owned unique ID with proof of possession.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Subject {
    pub timestamp: i64,
    pub identities: Vec<SubjectIdentity>,
    pub networks: Vec<SubjectNetwork>,
    /// Serials of other certificates this subject signs.
    pub certificates: Vec<[u8; CERTIFICATE_SERIAL_SIZE]>,
    pub update_urls: Vec<String>,
    pub name: Name,
    /// Empty, or a unique ID blob of `UNIQUE_ID_SIZE` bytes.
    pub unique_id: Vec<u8>,
    /// Signature of the canonical subject (proof signature excluded) by the
    /// unique ID's private key. Present iff `unique_id` is present.
    pub unique_id_proof_signature: Vec<u8>,
}

impl Subject {
    pub(crate) fn counts_valid(&self) -> bool {
        self.identities.len() <= MAX_SUBJECT_IDENTITIES
            && self.networks.len() <= MAX_SUBJECT_NETWORKS
            && self.certificates.len() <= MAX_SUBJECT_CERTIFICATES
            && self.update_urls.len() <= MAX_SUBJECT_UPDATE_URLS
            && self.update_urls.iter().all(|u| u.len() <= CERTIFICATE_MAX_STRING_LENGTH)
            && self.name.fields_valid()
    }

    /// Canonical encoding. The unique ID proof signature is omitted when
    /// `for_proof` since it is the very thing being signed.
    pub(crate) fn marshal(&self, w: &mut MarshalWriter<'_>, for_proof: bool) {
        w.i64(self.timestamp);
        w.u8(self.identities.len() as u8);
        for si in &self.identities {
            si.identity.marshal(w, false);
            match si.locator.as_ref() {
                Some(l) => {
                    w.u8(1);
                    l.marshal(w);
                }
                None => w.u8(0),
            }
        }
        w.u8(self.networks.len() as u8);
        for sn in &self.networks {
            w.u64(sn.id);
            sn.controller.marshal(w);
        }
        w.u8(self.certificates.len() as u8);
        for serial in &self.certificates {
            w.bytes(serial);
        }
        w.u8(self.update_urls.len() as u8);
        for url in &self.update_urls {
            w.str(url);
        }
        self.name.marshal(w);
        w.varbytes(&self.unique_id);
        if !for_proof {
            w.varbytes(&self.unique_id_proof_signature);
        }
    }

    pub(crate) fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        let timestamp = r.i64()?;
        let n = r.u8()? as usize;
        if n > MAX_SUBJECT_IDENTITIES {
            return Err(InvalidFormatError);
        }
        let mut identities = Vec::with_capacity(n);
        for _ in 0..n {
            let identity = Identity::unmarshal(r)?;
            let locator = match r.u8()? {
                0 => None,
                1 => Some(Locator::unmarshal(r)?),
                _ => return Err(InvalidFormatError),
            };
            identities.push(SubjectIdentity { identity, locator });
        }
        let n = r.u8()? as usize;
        if n > MAX_SUBJECT_NETWORKS {
            return Err(InvalidFormatError);
        }
        let mut networks = Vec::with_capacity(n);
        for _ in 0..n {
            let id = r.u64()?;
            let controller = Fingerprint::unmarshal(r)?;
            networks.push(SubjectNetwork { id, controller });
        }
        let n = r.u8()? as usize;
        if n > MAX_SUBJECT_CERTIFICATES {
            return Err(InvalidFormatError);
        }
        let mut certificates = Vec::with_capacity(n);
        for _ in 0..n {
            certificates.push(r.array()?);
        }
        let n = r.u8()? as usize;
        if n > MAX_SUBJECT_UPDATE_URLS {
            return Err(InvalidFormatError);
        }
        let mut update_urls = Vec::with_capacity(n);
        for _ in 0..n {
            update_urls.push(r.str()?.to_string());
        }
        let name = Name::unmarshal(r)?;
        let unique_id = r.varbytes()?.to_vec();
        let unique_id_proof_signature = r.varbytes()?.to_vec();
        let s = Self {
            timestamp,
            identities,
            networks,
            certificates,
            update_urls,
            name,
            unique_id,
            unique_id_proof_signature,
        };
        if !s.counts_valid() {
            return Err(InvalidFormatError);
        }
        Ok(s)
    }

    pub(crate) fn proof_signing_input(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.marshal(&mut MarshalWriter(&mut v), true);
        v
    }

    /// Attach a unique ID and compute its ownership proof. Both halves of
    /// the pair must be supplied together.
    pub fn set_unique_id(
        &mut self,
        unique_id: Option<&[u8]>,
        private: Option<&Secret<P384_SECRET_KEY_SIZE>>,
    ) -> Result<(), InvalidParameterError> {
        match (unique_id, private) {
            (None, None) => {
                self.unique_id.clear();
                self.unique_id_proof_signature.clear();
                Ok(())
            }
            (Some(uid), Some(private)) => {
                if uid.len() != UNIQUE_ID_SIZE || uid[0] != UNIQUE_ID_TYPE_NIST_P_384 {
                    return Err(InvalidParameterError("malformed unique ID"));
                }
                let kp = P384EcdsaKeyPair::from_secret_bytes(private.as_bytes())
                    .filter(|kp| kp.public_bytes()[..] == uid[1..])
                    .ok_or(InvalidParameterError("unique ID private key does not match"))?;
                self.unique_id = uid.to_vec();
                self.unique_id_proof_signature.clear();
                self.unique_id_proof_signature = kp.sign(&self.proof_signing_input()).to_vec();
                Ok(())
            }
            _ => Err(InvalidParameterError("unique ID and its private key must be supplied together")),
        }
    }

    /// A subject is valid iff it has no unique ID or its proof verifies.
    pub fn unique_id_proof_valid(&self) -> bool {
        if self.unique_id.is_empty() {
            return self.unique_id_proof_signature.is_empty();
        }
        if self.unique_id.len() != UNIQUE_ID_SIZE || self.unique_id[0] != UNIQUE_ID_TYPE_NIST_P_384 {
            return false;
        }
        let public: [u8; P384_PUBLIC_KEY_SIZE] = self.unique_id[1..].try_into().unwrap();
        p384_verify(&public, &self.proof_signing_input(), &self.unique_id_proof_signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vl1::identity::IdentityType;

    #[test]
    fn unique_id_proof() {
        let mut s = Subject { timestamp: 1000, ..Default::default() };
        s.name.common_name = "test".to_string();
        assert!(s.unique_id_proof_valid());

        let uid = SubjectUniqueId::generate();
        s.set_unique_id(Some(&uid.unique_id), Some(&uid.private)).unwrap();
        assert!(s.unique_id_proof_valid());

        // Mutating the subject after proof generation invalidates the proof.
        s.timestamp = 1001;
        assert!(!s.unique_id_proof_valid());

        // Supplying only half the pair is rejected.
        let mut s2 = Subject::default();
        assert!(s2.set_unique_id(Some(&uid.unique_id), None).is_err());
        assert!(s2.set_unique_id(None, Some(&uid.private)).is_err());
    }

    #[test]
    fn marshal_round_trip() {
        let id = Identity::generate(IdentityType::C25519);
        let mut s = Subject { timestamp: 42, ..Default::default() };
        s.identities.push(SubjectIdentity { identity: id.clone_public(), locator: None });
        s.networks.push(SubjectNetwork { id: 0x8056c2e21c000001, controller: *id.fingerprint() });
        s.certificates.push([7u8; CERTIFICATE_SERIAL_SIZE]);
        s.update_urls.push("https://example.com/certs".to_string());
        s.name.common_name = "node one".to_string();

        let mut v = Vec::new();
        s.marshal(&mut MarshalWriter(&mut v), false);
        let d = Subject::unmarshal(&mut MarshalReader::new(&v)).unwrap();
        assert!(d == s);
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::crypto::hash::{sha384_2, SHA384_HASH_SIZE};
use crate::crypto::p384::P384_SECRET_KEY_SIZE;
use crate::crypto::secret::Secret;
use crate::error::InvalidParameterError;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::identity::{Identity, IDENTITY_MAX_SIGNATURE_SIZE};

use super::subject::{Name, Subject};
use super::CertificateError;

/// Certificate serials are the SHA-384 of the certificate's canonical bytes.
pub const CERTIFICATE_SERIAL_SIZE: usize = SHA384_HASH_SIZE;

/// An identification certificate.
///
/// Designed to present concepts similar to X.509 without its complexity:
/// a signed subject (identities, networks, names), an issuer identity, a
/// validity window, and a serial that is simply the SHA-384 of the whole
/// canonical encoding, making serials self-verifying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub serial: [u8; CERTIFICATE_SERIAL_SIZE],
    pub flags: u64,
    pub timestamp: i64,
    /// Validity window `[not_before, not_after]`, both inclusive.
    pub validity: [i64; 2],
    pub subject: Subject,
    pub issuer: Option<Identity>,
    pub issuer_name: Name,
    /// Extended attributes in dictionary format, empty if none.
    pub extended_attributes: Vec<u8>,
    /// Maximum chain length below this certificate; zero means "not a CA".
    pub max_path_length: u32,
    pub signature: Vec<u8>,
}

impl Certificate {
    /// An unsigned certificate carrying only a subject, the canonical
    /// signing request form. `unique_id` and its private key must be given
    /// together or not at all.
    pub fn new_csr(
        subject: Subject,
        unique_id: Option<&[u8]>,
        unique_id_private: Option<&Secret<P384_SECRET_KEY_SIZE>>,
    ) -> Result<Self, InvalidParameterError> {
        let mut subject = subject;
        if unique_id.is_some() || unique_id_private.is_some() {
            subject.set_unique_id(unique_id, unique_id_private)?;
        }
        Ok(Self {
            serial: [0u8; CERTIFICATE_SERIAL_SIZE],
            flags: 0,
            timestamp: subject.timestamp,
            validity: [i64::MIN, i64::MAX],
            subject,
            issuer: None,
            issuer_name: Name::default(),
            extended_attributes: Vec::new(),
            max_path_length: 0,
            signature: Vec::new(),
        })
    }

    /// Canonical bytes excluding serial and signature: the signing input.
    fn signing_input(&self) -> Vec<u8> {
        let mut v = Vec::new();
        let mut w = MarshalWriter(&mut v);
        w.u64(self.flags);
        w.i64(self.timestamp);
        w.i64(self.validity[0]);
        w.i64(self.validity[1]);
        self.subject.marshal(&mut w, false);
        match self.issuer.as_ref() {
            Some(id) => {
                w.u8(1);
                id.marshal(&mut w, false);
            }
            None => w.u8(0),
        }
        self.issuer_name.marshal(&mut w);
        w.varbytes(&self.extended_attributes);
        w.u32(self.max_path_length);
        v
    }

    /// Sign with an issuer identity holding a private key, filling in the
    /// issuer, signature, and serial. The serial is the SHA-384 of the
    /// canonical bytes followed by the signature, so it commits to both.
    pub fn sign(&mut self, issuer: &Identity, issuer_name: Name) -> Result<(), InvalidParameterError> {
        self.issuer = Some(issuer.clone_public());
        self.issuer_name = issuer_name;
        let signing_input = self.signing_input();
        self.signature = issuer.sign(&signing_input)?;
        self.serial = sha384_2(&signing_input, &self.signature);
        Ok(())
    }

    /// Full canonical form: signing input plus signature. The serial is not
    /// encoded; it is recomputed on decode, which makes it unforgeable.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = self.signing_input();
        MarshalWriter(&mut v).varbytes(&self.signature);
        v
    }

    /// Parse without verification. Format errors only.
    pub fn from_bytes(b: &[u8]) -> Result<Self, CertificateError> {
        let mut r = MarshalReader::new(b);
        let c = Self::unmarshal(&mut r).map_err(|_| CertificateError::InvalidFormat)?;
        if !r.is_empty() {
            return Err(CertificateError::InvalidFormat);
        }
        Ok(c)
    }

    fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, crate::error::InvalidFormatError> {
        let flags = r.u64()?;
        let timestamp = r.i64()?;
        let validity = [r.i64()?, r.i64()?];
        let subject = Subject::unmarshal(r)?;
        let issuer = match r.u8()? {
            0 => None,
            1 => Some(Identity::unmarshal(r)?),
            _ => return Err(crate::error::InvalidFormatError),
        };
        let issuer_name = Name::unmarshal(r)?;
        let extended_attributes = r.varbytes()?.to_vec();
        let max_path_length = r.u32()?;
        let signature = r.varbytes()?.to_vec();
        if signature.len() > IDENTITY_MAX_SIGNATURE_SIZE {
            return Err(crate::error::InvalidFormatError);
        }
        let mut c = Self {
            serial: [0u8; CERTIFICATE_SERIAL_SIZE],
            flags,
            timestamp,
            validity,
            subject,
            issuer,
            issuer_name,
            extended_attributes,
            max_path_length,
            signature,
        };
        if !c.signature.is_empty() {
            c.serial = sha384_2(&c.signing_input(), &c.signature);
        }
        Ok(c)
    }

    /// Parse and, if `verify_at` is given, run the full verification chain
    /// (excluding trust-store chain validation, which happens at insertion)
    /// against that moment in time.
    pub fn decode(b: &[u8], verify_at: Option<i64>) -> Result<Self, CertificateError> {
        let c = Self::from_bytes(b)?;
        if let Some(now) = verify_at {
            c.verify(now)?;
        }
        Ok(c)
    }

    /// Verification, in the fixed order the error codes imply: required
    /// fields, embedded identities, primary signature, signed components,
    /// unique ID proof, validity window.
    pub fn verify(&self, now: i64) -> Result<(), CertificateError> {
        if !self.subject.counts_valid() {
            return Err(CertificateError::InvalidFormat);
        }
        let issuer = self.issuer.as_ref().ok_or(CertificateError::MissingRequiredFields)?;
        if self.signature.is_empty() {
            return Err(CertificateError::MissingRequiredFields);
        }

        for si in &self.subject.identities {
            if !si.identity.validate() {
                return Err(CertificateError::InvalidIdentity);
            }
        }
        if !issuer.validate() {
            return Err(CertificateError::InvalidIdentity);
        }

        if !issuer.verify(&self.signing_input(), &self.signature) {
            return Err(CertificateError::InvalidPrimarySignature);
        }

        for si in &self.subject.identities {
            if let Some(locator) = si.locator.as_ref() {
                if !locator.verify(&si.identity) {
                    return Err(CertificateError::InvalidComponentSignature);
                }
            }
        }

        if !self.subject.unique_id_proof_valid() {
            return Err(CertificateError::InvalidUniqueIdProof);
        }

        if now < self.validity[0] || now > self.validity[1] {
            return Err(CertificateError::OutOfValidTimeWindow);
        }
        Ok(())
    }

    /// True if this certificate's subject names the given serial, i.e. this
    /// certificate signs the certificate bearing that serial.
    pub fn signs_serial(&self, serial: &[u8; CERTIFICATE_SERIAL_SIZE]) -> bool {
        self.subject.certificates.iter().any(|s| s == serial)
    }
}

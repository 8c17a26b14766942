/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::{HashMap, HashSet};

use crate::error::InvalidFormatError;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::address::Address;

use super::certificate::{Certificate, CERTIFICATE_SERIAL_SIZE};
use super::subject::SubjectIdentity;
use super::CertificateError;

/// This certificate is a chain-validation anchor.
pub const LOCAL_TRUST_FLAG_ROOT_CA: u32 = 0x0001;
/// This certificate's subject identities are VL1 roots.
pub const LOCAL_TRUST_FLAG_ZEROTIER_ROOT_SET: u32 = 0x0002;

struct Entry {
    cert: Certificate,
    local_trust: u32,
}

/// The local set of trusted certificates and the trust flags attached to
/// each. Chain validation and supersession both happen at insertion time.
pub struct TrustStore {
    certs: HashMap<[u8; CERTIFICATE_SERIAL_SIZE], Entry>,
    dirty: bool,
}

/// Supersession key: a newer certificate for the same issuer and subject
/// name replaces an older one.
fn supersession_key(cert: &Certificate) -> (Option<Address>, &str, &str) {
    (
        cert.issuer.as_ref().map(|i| i.address()),
        cert.subject.name.serial_no.as_str(),
        cert.subject.name.common_name.as_str(),
    )
}

impl TrustStore {
    pub fn new() -> Self {
        Self { certs: HashMap::new(), dirty: false }
    }

    /// Fully verify and insert a certificate.
    ///
    /// Verification order is: the certificate's own checks, then supersession
    /// (`HaveNewerCert` if an import is older than what we hold), then chain
    /// validation unless the certificate is itself flagged as an anchor.
    pub fn add(&mut self, cert: Certificate, local_trust: u32, now: i64) -> Result<(), CertificateError> {
        cert.verify(now)?;

        let key = supersession_key(&cert);
        let mut superseded: Option<[u8; CERTIFICATE_SERIAL_SIZE]> = None;
        for e in self.certs.values() {
            if supersession_key(&e.cert) == key && e.cert.serial != cert.serial {
                if e.cert.timestamp >= cert.timestamp {
                    return Err(CertificateError::HaveNewerCert);
                }
                superseded = Some(e.cert.serial);
            }
        }

        if local_trust & LOCAL_TRUST_FLAG_ROOT_CA == 0 && !self.chain_reaches_anchor(&cert) {
            return Err(CertificateError::InvalidChain);
        }

        if let Some(old) = superseded {
            self.certs.remove(&old);
        }
        self.certs.insert(cert.serial, Entry { cert, local_trust });
        self.dirty = true;
        Ok(())
    }

    /// Insert without verification, for restoring a previously validated
    /// store from local persistence.
    pub fn insert_unchecked(&mut self, cert: Certificate, local_trust: u32) {
        self.certs.insert(cert.serial, Entry { cert, local_trust });
    }

    /// Walk upward through certificates whose subjects name this serial,
    /// looking for any path that reaches a `ROOT_CA` anchor while honoring
    /// every ancestor's `max_path_length`.
    fn chain_reaches_anchor(&self, cert: &Certificate) -> bool {
        let mut visited: HashSet<[u8; CERTIFICATE_SERIAL_SIZE]> = HashSet::new();
        // (serial, links already climbed from the candidate)
        let mut frontier: Vec<([u8; CERTIFICATE_SERIAL_SIZE], u32)> = vec![(cert.serial, 0)];
        while let Some((serial, climbed)) = frontier.pop() {
            for e in self.certs.values() {
                // A parent must allow at least the links below it on this path.
                if e.cert.signs_serial(&serial) && e.cert.max_path_length > climbed {
                    if e.local_trust & LOCAL_TRUST_FLAG_ROOT_CA != 0 {
                        return true;
                    }
                    if visited.insert(e.cert.serial) {
                        frontier.push((e.cert.serial, climbed + 1));
                    }
                }
            }
        }
        false
    }

    pub fn remove(&mut self, serial: &[u8; CERTIFICATE_SERIAL_SIZE]) -> bool {
        let removed = self.certs.remove(serial).is_some();
        self.dirty |= removed;
        removed
    }

    pub fn get(&self, serial: &[u8; CERTIFICATE_SERIAL_SIZE]) -> Option<&Certificate> {
        self.certs.get(serial).map(|e| &e.cert)
    }

    pub fn local_trust(&self, serial: &[u8; CERTIFICATE_SERIAL_SIZE]) -> Option<u32> {
        self.certs.get(serial).map(|e| e.local_trust)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Certificate, u32)> {
        self.certs.values().map(|e| (&e.cert, e.local_trust))
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Subject identities of every certificate flagged as a root set: the
    /// nodes VL1 should use as relay and discovery anchors.
    pub fn root_set(&self) -> Vec<SubjectIdentity> {
        let mut roots = Vec::new();
        for e in self.certs.values() {
            if e.local_trust & LOCAL_TRUST_FLAG_ZEROTIER_ROOT_SET != 0 {
                roots.extend(e.cert.subject.identities.iter().cloned());
            }
        }
        roots
    }

    /// Update URLs across all certificates, for periodic refresh fetches.
    pub fn update_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.certs.values().flat_map(|e| e.cert.subject.update_urls.iter().cloned()).collect();
        urls.sort();
        urls.dedup();
        urls
    }

    /// Drop certificates that have left their validity window. Returns the
    /// serials removed.
    pub fn revalidate(&mut self, now: i64) -> Vec<[u8; CERTIFICATE_SERIAL_SIZE]> {
        let expired: Vec<_> = self
            .certs
            .values()
            .filter(|e| now < e.cert.validity[0] || now > e.cert.validity[1])
            .map(|e| e.cert.serial)
            .collect();
        for serial in &expired {
            self.certs.remove(serial);
        }
        self.dirty |= !expired.is_empty();
        expired
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Serialize the membership index (serials and local trust flags). The
    /// certificates themselves are persisted individually.
    pub fn marshal_index(&self) -> Vec<u8> {
        let mut serials: Vec<_> = self.certs.values().map(|e| (e.cert.serial, e.local_trust)).collect();
        serials.sort();
        let mut v = Vec::new();
        let mut w = MarshalWriter(&mut v);
        w.u32(serials.len() as u32);
        for (serial, trust) in serials {
            w.bytes(&serial);
            w.u32(trust);
        }
        v
    }

    pub fn unmarshal_index(b: &[u8]) -> Result<Vec<([u8; CERTIFICATE_SERIAL_SIZE], u32)>, InvalidFormatError> {
        let mut r = MarshalReader::new(b);
        let n = r.u32()? as usize;
        let mut out = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            out.push((r.array()?, r.u32()?));
        }
        Ok(out)
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::subject::{Name, Subject, SubjectIdentity};
    use crate::vl1::identity::{Identity, IdentityType};

    fn subject_named(id: &Identity, common_name: &str, ts: i64) -> Subject {
        let mut s = Subject { timestamp: ts, ..Default::default() };
        s.identities.push(SubjectIdentity { identity: id.clone_public(), locator: None });
        s.name.common_name = common_name.to_string();
        s
    }

    fn signed(subject: Subject, issuer: &Identity, max_path_length: u32) -> Certificate {
        let mut c = Certificate::new_csr(subject, None, None).unwrap();
        c.validity = [0, i64::MAX];
        c.max_path_length = max_path_length;
        c.sign(issuer, Name::default()).unwrap();
        c
    }

    #[test]
    fn chain_validation_through_anchor() {
        let ca_id = Identity::generate(IdentityType::C25519);
        let member_id = Identity::generate(IdentityType::C25519);

        let member_cert = signed(subject_named(&member_id, "member", 10), &ca_id, 0);

        let mut ca_subject = subject_named(&ca_id, "ca", 10);
        ca_subject.certificates.push(member_cert.serial);
        let ca_cert = signed(ca_subject, &ca_id, 1);

        let mut ts = TrustStore::new();
        // Without the anchor the member does not chain.
        assert_eq!(ts.add(member_cert.clone(), 0, 100).unwrap_err(), CertificateError::InvalidChain);
        ts.add(ca_cert, LOCAL_TRUST_FLAG_ROOT_CA, 100).unwrap();
        ts.add(member_cert, 0, 100).unwrap();

        // max_path_length zero on the anchor forbids signing anything.
        let strict_ca = Identity::generate(IdentityType::C25519);
        let orphan = signed(subject_named(&member_id, "orphan", 10), &strict_ca, 0);
        let mut strict_subject = subject_named(&strict_ca, "strict", 10);
        strict_subject.certificates.push(orphan.serial);
        let strict_cert = signed(strict_subject, &strict_ca, 0);
        ts.add(strict_cert, LOCAL_TRUST_FLAG_ROOT_CA, 100).unwrap();
        assert_eq!(ts.add(orphan, 0, 100).unwrap_err(), CertificateError::InvalidChain);
    }

    #[test]
    fn supersession() {
        let ca_id = Identity::generate(IdentityType::C25519);
        let member_id = Identity::generate(IdentityType::C25519);

        let older = signed(subject_named(&member_id, "node", 100), &ca_id, 0);
        let newer = {
            let mut c = Certificate::new_csr(subject_named(&member_id, "node", 200), None, None).unwrap();
            c.validity = [0, i64::MAX];
            c.timestamp = 200;
            c.sign(&ca_id, Name::default()).unwrap();
            c
        };

        let mut anchor_subject = subject_named(&ca_id, "ca", 1);
        anchor_subject.certificates.push(older.serial);
        anchor_subject.certificates.push(newer.serial);
        let anchor = signed(anchor_subject, &ca_id, 1);

        let mut ts = TrustStore::new();
        ts.add(anchor, LOCAL_TRUST_FLAG_ROOT_CA, 10).unwrap();
        ts.add(newer.clone(), 0, 10).unwrap();
        assert_eq!(ts.add(older, 0, 10).unwrap_err(), CertificateError::HaveNewerCert);
        assert!(ts.get(&newer.serial).is_some());
    }

    #[test]
    fn revalidation_drops_expired() {
        let ca_id = Identity::generate(IdentityType::C25519);
        let mut c = Certificate::new_csr(subject_named(&ca_id, "ca", 1), None, None).unwrap();
        c.validity = [0, 1000];
        c.sign(&ca_id, Name::default()).unwrap();
        let serial = c.serial;

        let mut ts = TrustStore::new();
        ts.add(c, LOCAL_TRUST_FLAG_ROOT_CA, 500).unwrap();
        assert!(ts.revalidate(500).is_empty());
        assert_eq!(ts.revalidate(2000), vec![serial]);
        assert!(ts.get(&serial).is_none());
    }

    #[test]
    fn index_round_trip() {
        let ca_id = Identity::generate(IdentityType::C25519);
        let c = signed(subject_named(&ca_id, "ca", 1), &ca_id, 0);
        let mut ts = TrustStore::new();
        ts.add(c.clone(), LOCAL_TRUST_FLAG_ROOT_CA | LOCAL_TRUST_FLAG_ZEROTIER_ROOT_SET, 10).unwrap();
        let idx = ts.marshal_index();
        let entries = TrustStore::unmarshal_index(&idx).unwrap();
        assert_eq!(entries, vec![(c.serial, LOCAL_TRUST_FLAG_ROOT_CA | LOCAL_TRUST_FLAG_ZEROTIER_ROOT_SET)]);
        assert_eq!(ts.root_set().len(), 1);
    }
}

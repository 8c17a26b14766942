/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::str::FromStr;

use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;

use crate::crypto::c25519::{
    ed25519_verify, Ed25519KeyPair, X25519KeyPair, C25519_PUBLIC_KEY_SIZE, C25519_SECRET_KEY_SIZE, ED25519_PUBLIC_KEY_SIZE,
    ED25519_SECRET_KEY_SIZE, ED25519_SIGNATURE_SIZE,
};
use crate::crypto::hash::{sha384, sha512, SHA512_HASH_SIZE};
use crate::crypto::p384::{
    p384_public_valid, p384_verify, P384EcdhKeyPair, P384EcdsaKeyPair, P384_ECDSA_SIGNATURE_SIZE, P384_PUBLIC_KEY_SIZE,
    P384_SECRET_KEY_SIZE,
};
use crate::crypto::secret::Secret;
use crate::error::{InvalidFormatError, InvalidParameterError};
use crate::util::hex;
use crate::util::marshal::{MarshalReader, MarshalWriter};
use crate::vl1::address::{Address, ADDRESS_SIZE};
use crate::vl1::fingerprint::Fingerprint;

/// Maximum signature size across all identity types.
pub const IDENTITY_MAX_SIGNATURE_SIZE: usize = 96;

const C25519_COMBINED_PUBLIC_SIZE: usize = C25519_PUBLIC_KEY_SIZE + ED25519_PUBLIC_KEY_SIZE;
const C25519_COMBINED_SECRET_SIZE: usize = C25519_SECRET_KEY_SIZE + ED25519_SECRET_KEY_SIZE;
const P384_COMBINED_PUBLIC_SIZE: usize = C25519_COMBINED_PUBLIC_SIZE + P384_PUBLIC_KEY_SIZE * 2;
const P384_COMBINED_SECRET_SIZE: usize = C25519_COMBINED_SECRET_SIZE + P384_SECRET_KEY_SIZE * 2;

/// Memory required by the address derivation work function.
const POW_MEMORY: usize = 2097152;
/// A candidate digest is accepted only if its first byte is below this.
const POW_THRESHOLD: u8 = 17;

/// Identity key algorithm.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum IdentityType {
    /// Curve25519 ECDH with Ed25519 signatures. The default.
    C25519 = 0,
    /// C25519 plus NIST P-384 ECDH and ECDSA. Signatures use P-384.
    P384 = 1,
}

struct P384Public {
    ecdh: [u8; P384_PUBLIC_KEY_SIZE],
    ecdsa: [u8; P384_PUBLIC_KEY_SIZE],
}

struct SecretKeys {
    x25519: X25519KeyPair,
    ed25519: Ed25519KeyPair,
    p384: Option<(P384EcdhKeyPair, P384EcdsaKeyPair)>,
}

/// A node identity: an asymmetric key set whose 40-bit address is derived
/// from the public keys through a memory-hard work function.
///
/// Generation is deliberately expensive (hundreds of milliseconds to
/// seconds). Identities are immutable once created.
pub struct Identity {
    address: Address,
    x25519_public: [u8; C25519_PUBLIC_KEY_SIZE],
    ed25519_public: [u8; ED25519_PUBLIC_KEY_SIZE],
    p384_public: Option<P384Public>,
    secret: Option<SecretKeys>,
    fingerprint: Fingerprint,
}

/// The address derivation work function, a fixed constant of the protocol.
///
/// Fills 2 MiB with a chained Salsa20/20 keystream seeded from the SHA-512 of
/// the public key blob, then repeatedly swaps digest words against
/// pseudo-random memory locations, forcing the whole buffer to stay resident.
/// Any change to this function forks the address space.
fn derive_address_digest(public_blob: &[u8], genmem: &mut [u8]) -> [u8; SHA512_HASH_SIZE] {
    debug_assert_eq!(genmem.len(), POW_MEMORY);
    let mut digest = sha512(public_blob);
    let key: [u8; 32] = digest[..32].try_into().unwrap();
    let nonce: [u8; 8] = digest[32..40].try_into().unwrap();
    let mut s20 = Salsa20::new(&key.into(), &nonce.into());

    genmem.fill(0);
    s20.apply_keystream(&mut genmem[..64]);
    for i in (64..POW_MEMORY).step_by(64) {
        genmem.copy_within(i - 64..i, i);
        s20.apply_keystream(&mut genmem[i..i + 64]);
    }

    let mut w = 0usize;
    while w < POW_MEMORY / 8 {
        let i1 = u64::from_be_bytes(genmem[w * 8..w * 8 + 8].try_into().unwrap());
        w += 1;
        let i2 = u64::from_be_bytes(genmem[w * 8..w * 8 + 8].try_into().unwrap());
        w += 1;
        let idx1 = (i1 % 8) as usize * 8;
        let idx2 = (i2 % (POW_MEMORY as u64 / 8)) as usize * 8;
        let mut tmp = [0u8; 8];
        tmp.copy_from_slice(&genmem[idx2..idx2 + 8]);
        genmem[idx2..idx2 + 8].copy_from_slice(&digest[idx1..idx1 + 8]);
        digest[idx1..idx1 + 8].copy_from_slice(&tmp);
        s20.apply_keystream(&mut digest);
    }
    digest
}

/// Apply the acceptance predicate and extract the address.
fn address_from_digest(digest: &[u8; SHA512_HASH_SIZE]) -> Option<Address> {
    if digest[0] >= POW_THRESHOLD {
        return None;
    }
    Address::from_bytes(digest[59..64].try_into().unwrap())
}

impl Identity {
    /// Generate a new identity, looping key generation until the derived
    /// address satisfies the work function predicate.
    pub fn generate(id_type: IdentityType) -> Self {
        let mut genmem = vec![0u8; POW_MEMORY];
        loop {
            let x25519 = X25519KeyPair::generate();
            let ed25519 = Ed25519KeyPair::generate();
            let p384 = match id_type {
                IdentityType::C25519 => None,
                IdentityType::P384 => Some((P384EcdhKeyPair::generate(), P384EcdsaKeyPair::generate())),
            };
            let secret = SecretKeys { x25519, ed25519, p384 };
            let public_blob = public_blob_of(&secret);
            let digest = derive_address_digest(&public_blob, &mut genmem);
            if let Some(address) = address_from_digest(&digest) {
                let fingerprint = Fingerprint { address, hash: sha384(&public_blob) };
                return Self {
                    address,
                    x25519_public: secret.x25519.public_bytes(),
                    ed25519_public: secret.ed25519.public_bytes(),
                    p384_public: secret.p384.as_ref().map(|(dh, dsa)| P384Public {
                        ecdh: dh.public_bytes(),
                        ecdsa: dsa.public_bytes(),
                    }),
                    secret: Some(secret),
                    fingerprint,
                };
            }
        }
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn id_type(&self) -> IdentityType {
        if self.p384_public.is_some() {
            IdentityType::P384
        } else {
            IdentityType::C25519
        }
    }

    #[inline(always)]
    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    /// Stable fingerprint: (address, SHA-384 of the public key blob).
    #[inline(always)]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The canonical public key blob used for address derivation and hashing.
    pub fn public_blob(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(P384_COMBINED_PUBLIC_SIZE);
        b.extend_from_slice(&self.x25519_public);
        b.extend_from_slice(&self.ed25519_public);
        if let Some(p) = self.p384_public.as_ref() {
            b.extend_from_slice(&p.ecdh);
            b.extend_from_slice(&p.ecdsa);
        }
        b
    }

    /// A clone carrying only the public half.
    pub fn clone_public(&self) -> Self {
        let mut c = self.clone();
        c.secret = None;
        c
    }

    /// Recompute the address derivation and check internal consistency.
    ///
    /// This runs the full memory-hard work function and so costs several
    /// milliseconds; it is meant for identities arriving from the wire or
    /// from storage, not for hot paths.
    pub fn validate(&self) -> bool {
        if let Some(p) = self.p384_public.as_ref() {
            if !p384_public_valid(&p.ecdh) || !p384_public_valid(&p.ecdsa) {
                return false;
            }
        }
        let mut genmem = vec![0u8; POW_MEMORY];
        let digest = derive_address_digest(&self.public_blob(), &mut genmem);
        address_from_digest(&digest).is_some_and(|a| a == self.address)
    }

    /// Sign a message. Type 0 identities produce the 96-byte Ed25519 legacy
    /// format; type 1 produce a 96-byte P-384 ECDSA signature.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, InvalidParameterError> {
        let secret = self.secret.as_ref().ok_or(InvalidParameterError("identity has no private key"))?;
        Ok(match secret.p384.as_ref() {
            Some((_, ecdsa)) => ecdsa.sign(msg).to_vec(),
            None => secret.ed25519.sign(msg).to_vec(),
        })
    }

    /// Verify a signature made by this identity.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        match self.p384_public.as_ref() {
            Some(p) => signature.len() == P384_ECDSA_SIGNATURE_SIZE && p384_verify(&p.ecdsa, msg, signature),
            None => signature.len() == ED25519_SIGNATURE_SIZE && ed25519_verify(&self.ed25519_public, msg, signature),
        }
    }

    /// Static-static key agreement with another identity, producing the raw
    /// material session keys are derived from. When both identities carry
    /// P-384 keys the two shared secrets are hashed together so the result
    /// is no weaker than the stronger curve.
    pub fn agree(&self, other: &Identity) -> Option<Secret<SHA512_HASH_SIZE>> {
        let secret = self.secret.as_ref()?;
        let c25519 = secret.x25519.agree(&other.x25519_public)?;
        match (secret.p384.as_ref(), other.p384_public.as_ref()) {
            (Some((ecdh, _)), Some(p)) => {
                let p384 = ecdh.agree(&p.ecdh)?;
                let mut both = [0u8; 32 + 48];
                both[..32].copy_from_slice(c25519.as_bytes());
                both[32..].copy_from_slice(p384.as_bytes());
                let out = Secret(sha512(&both));
                both.iter_mut().for_each(|b| *b = 0);
                Some(out)
            }
            _ => Some(Secret(sha512(c25519.as_bytes()))),
        }
    }

    /// Binary canonical form: address, type, public blob, then a
    /// length-prefixed secret blob (zero length when public only).
    pub fn marshal(&self, w: &mut MarshalWriter<'_>, include_private: bool) {
        w.u40(self.address.to_u64());
        w.u8(self.id_type() as u8);
        w.bytes(&self.public_blob());
        match self.secret.as_ref().filter(|_| include_private) {
            Some(secret) => {
                let blob = secret_blob_of(secret);
                w.u8(blob.len() as u8);
                w.bytes(&blob);
            }
            None => w.u8(0),
        }
    }

    pub fn unmarshal(r: &mut MarshalReader<'_>) -> Result<Self, InvalidFormatError> {
        let address = r.take(ADDRESS_SIZE)?;
        let address = Address::from_bytes(address.try_into().unwrap()).ok_or(InvalidFormatError)?;
        let id_type = match r.u8()? {
            0 => IdentityType::C25519,
            1 => IdentityType::P384,
            _ => return Err(InvalidFormatError),
        };
        let public = r.take(public_size_of(id_type))?;
        let secret_len = r.u8()? as usize;
        let secret = if secret_len == 0 {
            None
        } else {
            if secret_len != secret_size_of(id_type) {
                return Err(InvalidFormatError);
            }
            Some(r.take(secret_len)?)
        };
        Self::assemble(address, id_type, public, secret)
    }

    /// Build and cross-check an identity from raw blobs. Fails without
    /// partial state if any key is inconsistent with any other.
    fn assemble(
        address: Address,
        id_type: IdentityType,
        public: &[u8],
        secret: Option<&[u8]>,
    ) -> Result<Self, InvalidFormatError> {
        if public.len() != public_size_of(id_type) {
            return Err(InvalidFormatError);
        }
        let x25519_public: [u8; C25519_PUBLIC_KEY_SIZE] = public[..32].try_into().unwrap();
        let ed25519_public: [u8; ED25519_PUBLIC_KEY_SIZE] = public[32..64].try_into().unwrap();
        let p384_public = match id_type {
            IdentityType::C25519 => None,
            IdentityType::P384 => {
                let ecdh: [u8; P384_PUBLIC_KEY_SIZE] = public[64..113].try_into().unwrap();
                let ecdsa: [u8; P384_PUBLIC_KEY_SIZE] = public[113..162].try_into().unwrap();
                if !p384_public_valid(&ecdh) || !p384_public_valid(&ecdsa) {
                    return Err(InvalidFormatError);
                }
                Some(P384Public { ecdh, ecdsa })
            }
        };

        let secret = match secret {
            None => None,
            Some(blob) => {
                if blob.len() != secret_size_of(id_type) {
                    return Err(InvalidFormatError);
                }
                let x25519 = X25519KeyPair::from_bytes(&x25519_public, blob[..32].try_into().unwrap())
                    .ok_or(InvalidFormatError)?;
                let ed25519 = Ed25519KeyPair::from_bytes(&ed25519_public, blob[32..64].try_into().unwrap())
                    .ok_or(InvalidFormatError)?;
                let p384 = match p384_public.as_ref() {
                    None => None,
                    Some(p) => {
                        let ecdh = P384EcdhKeyPair::from_secret_bytes(blob[64..112].try_into().unwrap())
                            .filter(|kp| kp.public_bytes() == p.ecdh)
                            .ok_or(InvalidFormatError)?;
                        let ecdsa = P384EcdsaKeyPair::from_secret_bytes(blob[112..160].try_into().unwrap())
                            .filter(|kp| kp.public_bytes() == p.ecdsa)
                            .ok_or(InvalidFormatError)?;
                        Some((ecdh, ecdsa))
                    }
                };
                Some(SecretKeys { x25519, ed25519, p384 })
            }
        };

        let mut id = Self {
            address,
            x25519_public,
            ed25519_public,
            p384_public,
            secret,
            fingerprint: Fingerprint { address, hash: [0u8; 48] },
        };
        id.fingerprint.hash = sha384(&id.public_blob());
        Ok(id)
    }

    /// Textual form: `address:type:publichex[:secrethex]`.
    pub fn to_string_with_options(&self, include_private: bool) -> String {
        let mut s = format!(
            "{}:{}:{}",
            self.address,
            self.id_type() as u8,
            hex::to_string(&self.public_blob())
        );
        if include_private {
            if let Some(secret) = self.secret.as_ref() {
                s.push(':');
                s.push_str(&hex::to_string(&secret_blob_of(secret)));
            }
        }
        s
    }
}

fn public_size_of(t: IdentityType) -> usize {
    match t {
        IdentityType::C25519 => C25519_COMBINED_PUBLIC_SIZE,
        IdentityType::P384 => P384_COMBINED_PUBLIC_SIZE,
    }
}

fn secret_size_of(t: IdentityType) -> usize {
    match t {
        IdentityType::C25519 => C25519_COMBINED_SECRET_SIZE,
        IdentityType::P384 => P384_COMBINED_SECRET_SIZE,
    }
}

fn public_blob_of(secret: &SecretKeys) -> Vec<u8> {
    let mut b = Vec::with_capacity(P384_COMBINED_PUBLIC_SIZE);
    b.extend_from_slice(&secret.x25519.public_bytes());
    b.extend_from_slice(&secret.ed25519.public_bytes());
    if let Some((ecdh, ecdsa)) = secret.p384.as_ref() {
        b.extend_from_slice(&ecdh.public_bytes());
        b.extend_from_slice(&ecdsa.public_bytes());
    }
    b
}

fn secret_blob_of(secret: &SecretKeys) -> Vec<u8> {
    let mut b = Vec::with_capacity(P384_COMBINED_SECRET_SIZE);
    b.extend_from_slice(secret.x25519.secret_bytes().as_bytes());
    b.extend_from_slice(secret.ed25519.secret_bytes().as_bytes());
    if let Some((ecdh, ecdsa)) = secret.p384.as_ref() {
        b.extend_from_slice(ecdh.secret_bytes().as_bytes());
        b.extend_from_slice(ecdsa.secret_bytes().as_bytes());
    }
    b
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        // Key pair objects are not Clone (they hold zeroizing secrets), so
        // round-trip through the canonical blobs.
        let public = self.public_blob();
        let secret = self.secret.as_ref().map(secret_blob_of);
        Self::assemble(self.address, self.id_type(), &public, secret.as_deref()).unwrap()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}
impl Eq for Identity {}

impl std::hash::Hash for Identity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_options(false))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.address)
    }
}

impl FromStr for Identity {
    type Err = InvalidFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        let address = fields.next().ok_or(InvalidFormatError)?.parse::<Address>()?;
        let id_type = match fields.next() {
            Some("0") => IdentityType::C25519,
            Some("1") => IdentityType::P384,
            _ => return Err(InvalidFormatError),
        };
        let public = hex::from_string(fields.next().ok_or(InvalidFormatError)?).ok_or(InvalidFormatError)?;
        let secret = match fields.next() {
            None => None,
            Some(h) => Some(hex::from_string(h).ok_or(InvalidFormatError)?),
        };
        if fields.next().is_some() {
            return Err(InvalidFormatError);
        }
        Self::assemble(address, id_type, &public, secret.as_deref())
    }
}

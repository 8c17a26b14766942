/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use p384::ecdsa::signature::{Signer, Verifier};
use p384::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;

use crate::crypto::secret::Secret;

pub const P384_PUBLIC_KEY_SIZE: usize = 49;
pub const P384_SECRET_KEY_SIZE: usize = 48;
pub const P384_ECDSA_SIGNATURE_SIZE: usize = 96;
pub const P384_ECDH_SHARED_SECRET_SIZE: usize = 48;

fn compress(pk: &p384::PublicKey) -> [u8; P384_PUBLIC_KEY_SIZE] {
    pk.to_encoded_point(true).as_bytes().try_into().unwrap()
}

/// NIST P-384 ECDH key pair.
pub struct P384EcdhKeyPair {
    secret: p384::SecretKey,
    public_bytes: [u8; P384_PUBLIC_KEY_SIZE],
}

impl P384EcdhKeyPair {
    pub fn generate() -> Self {
        let secret = p384::SecretKey::random(&mut OsRng);
        let public_bytes = compress(&secret.public_key());
        Self { secret, public_bytes }
    }

    pub fn from_secret_bytes(secret: &[u8; P384_SECRET_KEY_SIZE]) -> Option<Self> {
        let secret = p384::SecretKey::from_slice(secret).ok()?;
        let public_bytes = compress(&secret.public_key());
        Some(Self { secret, public_bytes })
    }

    pub fn public_bytes(&self) -> [u8; P384_PUBLIC_KEY_SIZE] {
        self.public_bytes
    }

    pub fn secret_bytes(&self) -> Secret<P384_SECRET_KEY_SIZE> {
        Secret(self.secret.to_bytes().into())
    }

    /// ECDH agreement against a raw SEC1 compressed public key.
    /// None if the key is not a valid point on the curve.
    pub fn agree(&self, public: &[u8; P384_PUBLIC_KEY_SIZE]) -> Option<Secret<P384_ECDH_SHARED_SECRET_SIZE>> {
        let pk = p384::PublicKey::from_sec1_bytes(public).ok()?;
        let shared = p384::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), pk.as_affine());
        Some(Secret::copy_bytes(shared.raw_secret_bytes().as_slice()))
    }
}

/// NIST P-384 ECDSA key pair; signatures are fixed 96-byte (r, s) over SHA-384.
pub struct P384EcdsaKeyPair {
    signing: p384::ecdsa::SigningKey,
    public_bytes: [u8; P384_PUBLIC_KEY_SIZE],
}

impl P384EcdsaKeyPair {
    pub fn generate() -> Self {
        let signing = p384::ecdsa::SigningKey::random(&mut OsRng);
        let public_bytes = compress(&p384::PublicKey::from(signing.verifying_key()));
        Self { signing, public_bytes }
    }

    pub fn from_secret_bytes(secret: &[u8; P384_SECRET_KEY_SIZE]) -> Option<Self> {
        let signing = p384::ecdsa::SigningKey::from_bytes(secret.into()).ok()?;
        let public_bytes = compress(&p384::PublicKey::from(signing.verifying_key()));
        Some(Self { signing, public_bytes })
    }

    pub fn public_bytes(&self) -> [u8; P384_PUBLIC_KEY_SIZE] {
        self.public_bytes
    }

    pub fn secret_bytes(&self) -> Secret<P384_SECRET_KEY_SIZE> {
        Secret(self.signing.to_bytes().into())
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; P384_ECDSA_SIGNATURE_SIZE] {
        let sig: p384::ecdsa::Signature = self.signing.sign(msg);
        sig.to_bytes().as_slice().try_into().unwrap()
    }
}

/// Verify a 96-byte P-384 ECDSA signature against a SEC1 compressed public key.
pub fn p384_verify(public: &[u8; P384_PUBLIC_KEY_SIZE], msg: &[u8], signature: &[u8]) -> bool {
    if signature.len() != P384_ECDSA_SIGNATURE_SIZE {
        return false;
    }
    let Ok(vk) = p384::ecdsa::VerifyingKey::from_sec1_bytes(public) else {
        return false;
    };
    let Ok(sig) = p384::ecdsa::Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(msg, &sig).is_ok()
}

/// Check that raw bytes are a valid P-384 public key (on-curve SEC1 point).
pub fn p384_public_valid(public: &[u8]) -> bool {
    public.len() == P384_PUBLIC_KEY_SIZE && p384::PublicKey::from_sec1_bytes(public).is_ok()
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use ed25519_dalek::{Signer, Verifier};
use rand_core::OsRng;

use crate::crypto::hash::sha512;
use crate::crypto::secret::Secret;

pub const C25519_PUBLIC_KEY_SIZE: usize = 32;
pub const C25519_SECRET_KEY_SIZE: usize = 32;
pub const C25519_SHARED_SECRET_SIZE: usize = 32;
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Signature format carried by type 0 identities: a raw Ed25519 signature
/// followed by the first 32 bytes of the SHA-512 of the message. The trailing
/// digest is a legacy fast-reject and is checked on verify.
pub const ED25519_SIGNATURE_SIZE: usize = 96;

/// Curve25519 ECDH key pair.
pub struct X25519KeyPair {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
}

impl X25519KeyPair {
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_bytes(public: &[u8; C25519_PUBLIC_KEY_SIZE], secret: &[u8; C25519_SECRET_KEY_SIZE]) -> Option<Self> {
        let secret = x25519_dalek::StaticSecret::from(*secret);
        // The public half is derivable; reject blobs where they disagree.
        let derived = x25519_dalek::PublicKey::from(&secret);
        if derived.as_bytes() != public {
            return None;
        }
        Some(Self { secret, public: derived })
    }

    pub fn public_bytes(&self) -> [u8; C25519_PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    pub fn secret_bytes(&self) -> Secret<C25519_SECRET_KEY_SIZE> {
        Secret(self.secret.to_bytes())
    }

    /// ECDH agreement. None if the result would be the all-zero non-contributory value.
    pub fn agree(&self, public: &[u8; C25519_PUBLIC_KEY_SIZE]) -> Option<Secret<C25519_SHARED_SECRET_SIZE>> {
        let shared = self.secret.diffie_hellman(&x25519_dalek::PublicKey::from(*public));
        if !shared.was_contributory() {
            return None;
        }
        Some(Secret(shared.to_bytes()))
    }
}

/// Ed25519 signing key pair.
pub struct Ed25519KeyPair {
    signing: ed25519_dalek::SigningKey,
}

impl Ed25519KeyPair {
    pub fn generate() -> Self {
        Self { signing: ed25519_dalek::SigningKey::generate(&mut OsRng) }
    }

    pub fn from_bytes(public: &[u8; ED25519_PUBLIC_KEY_SIZE], secret: &[u8; ED25519_SECRET_KEY_SIZE]) -> Option<Self> {
        let signing = ed25519_dalek::SigningKey::from_bytes(secret);
        if signing.verifying_key().as_bytes() != public {
            return None;
        }
        Some(Self { signing })
    }

    pub fn public_bytes(&self) -> [u8; ED25519_PUBLIC_KEY_SIZE] {
        *self.signing.verifying_key().as_bytes()
    }

    pub fn secret_bytes(&self) -> Secret<ED25519_SECRET_KEY_SIZE> {
        Secret(self.signing.to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; ED25519_SIGNATURE_SIZE] {
        let mut sig = [0u8; ED25519_SIGNATURE_SIZE];
        sig[..64].copy_from_slice(&self.signing.sign(msg).to_bytes());
        sig[64..].copy_from_slice(&sha512(msg)[..32]);
        sig
    }
}

/// Verify the 96-byte legacy signature format against a public key.
pub fn ed25519_verify(public: &[u8; ED25519_PUBLIC_KEY_SIZE], msg: &[u8], signature: &[u8]) -> bool {
    if signature.len() != ED25519_SIGNATURE_SIZE {
        return false;
    }
    if signature[64..96] != sha512(msg)[..32] {
        return false;
    }
    let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(public) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(signature[..64].try_into().unwrap());
    vk.verify(msg, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let kp = Ed25519KeyPair::generate();
        let sig = kp.sign(b"test message");
        assert!(ed25519_verify(&kp.public_bytes(), b"test message", &sig));
        assert!(!ed25519_verify(&kp.public_bytes(), b"other message", &sig));
        let mut bad = sig;
        bad[10] ^= 1;
        assert!(!ed25519_verify(&kp.public_bytes(), b"test message", &bad));
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = X25519KeyPair::generate();
        let b = X25519KeyPair::generate();
        let k1 = a.agree(&b.public_bytes()).unwrap();
        let k2 = b.agree(&a.public_bytes()).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn key_reload_round_trip() {
        let kp = X25519KeyPair::generate();
        let re = X25519KeyPair::from_bytes(&kp.public_bytes(), kp.secret_bytes().as_bytes()).unwrap();
        assert_eq!(re.public_bytes(), kp.public_bytes());
        assert!(X25519KeyPair::from_bytes(&[1u8; 32], kp.secret_bytes().as_bytes()).is_none());
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};

use crate::crypto::secret::Secret;

pub const AES_256_KEY_SIZE: usize = 32;
pub const AES_GCM_TAG_SIZE: usize = 16;
pub const AES_GCM_IV_SIZE: usize = 12;

/// Per-peer symmetric session cipher.
///
/// The nonce is built from the packet counter plus a direction byte so the
/// two directions of a session never share nonces even though both sides
/// derive the identical key.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &Secret<AES_256_KEY_SIZE>) -> Self {
        Self { cipher: Aes256Gcm::new(key.as_bytes().into()) }
    }

    fn nonce(counter: u64, outbound_from_lesser_address: bool) -> [u8; AES_GCM_IV_SIZE] {
        let mut iv = [0u8; AES_GCM_IV_SIZE];
        iv[..8].copy_from_slice(&counter.to_be_bytes());
        iv[8] = outbound_from_lesser_address as u8;
        iv
    }

    /// Encrypt in place, returning the tag to append.
    pub fn encrypt(
        &self,
        counter: u64,
        direction: bool,
        aad: &[u8],
        data: &mut [u8],
    ) -> Option<[u8; AES_GCM_TAG_SIZE]> {
        let iv = Self::nonce(counter, direction);
        self.cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, data)
            .ok()
            .map(|t| t.into())
    }

    /// Decrypt in place; false leaves `data` in an unusable state the caller
    /// must discard.
    pub fn decrypt(&self, counter: u64, direction: bool, aad: &[u8], data: &mut [u8], tag: &[u8; AES_GCM_TAG_SIZE]) -> bool {
        let iv = Self::nonce(counter, direction);
        self.cipher
            .decrypt_in_place_detached(Nonce::from_slice(&iv), aad, data, Tag::from_slice(tag))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_tamper() {
        let key = Secret([9u8; AES_256_KEY_SIZE]);
        let c = SessionCipher::new(&key);
        let mut data = *b"virtual ethernet frame bytes";
        let aad = b"header";
        let tag = c.encrypt(5, true, aad, &mut data).unwrap();
        assert_ne!(&data, b"virtual ethernet frame bytes");
        assert!(c.decrypt(5, true, aad, &mut data, &tag));
        assert_eq!(&data, b"virtual ethernet frame bytes");

        // Wrong direction, counter, or aad must all fail authentication.
        let tag2 = c.encrypt(5, true, aad, &mut data).unwrap();
        assert!(!c.decrypt(5, false, aad, &mut data.clone(), &tag2));
        assert!(!c.decrypt(6, true, aad, &mut data.clone(), &tag2));
        assert!(!c.decrypt(5, true, b"other", &mut data.clone(), &tag2));
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha384, Sha512};

use crate::crypto::secret::Secret;

pub const SHA384_HASH_SIZE: usize = 48;
pub const SHA512_HASH_SIZE: usize = 64;

pub fn sha384(b: &[u8]) -> [u8; SHA384_HASH_SIZE] {
    Sha384::digest(b).into()
}

/// SHA-384 over the concatenation of two byte strings, used for certificate
/// serials which hash canonical-bytes-then-signature without copying.
pub fn sha384_2(a: &[u8], b: &[u8]) -> [u8; SHA384_HASH_SIZE] {
    let mut h = Sha384::new();
    h.update(a);
    h.update(b);
    h.finalize().into()
}

pub fn sha512(b: &[u8]) -> [u8; SHA512_HASH_SIZE] {
    Sha512::digest(b).into()
}

pub fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; SHA512_HASH_SIZE] {
    let mut m = Hmac::<Sha512>::new_from_slice(key).unwrap();
    m.update(msg);
    m.finalize().into_bytes().into()
}

/// Single-block KBKDF in counter mode per NIST SP 800-108, as used for every
/// derived key in this protocol. `label` is a short ASCII domain separator.
pub fn kbkdf_sha512<const L: usize>(key: &[u8], label: &[u8; 4]) -> Secret<L> {
    debug_assert!(L <= SHA512_HASH_SIZE);
    // counter || label || 0x00 || output bits
    let mut msg = [0u8; 8];
    msg[0] = 1;
    msg[1..5].copy_from_slice(label);
    msg[6] = ((L * 8) >> 8) as u8;
    msg[7] = (L * 8) as u8;
    let mut digest = hmac_sha512(key, &msg);
    let out = Secret::<L>::copy_bytes(&digest[..L]);
    digest.iter_mut().for_each(|b| *b = 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_sizes() {
        assert_eq!(sha384(b"x").len(), SHA384_HASH_SIZE);
        assert_eq!(sha512(b"x").len(), SHA512_HASH_SIZE);
        assert_eq!(sha384_2(b"ab", b"cd"), sha384(b"abcd"));
    }

    #[test]
    fn kbkdf_labels_separate_domains() {
        let key = [3u8; 64];
        let a: Secret<32> = kbkdf_sha512(&key, b"AAAA");
        let b: Secret<32> = kbkdf_sha512(&key, b"BBBB");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}

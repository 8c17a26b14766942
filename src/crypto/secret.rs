/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use zeroize::Zeroize;

/// Constant time byte slice equality.
#[inline]
pub fn secure_eq<A: AsRef<[u8]> + ?Sized, B: AsRef<[u8]> + ?Sized>(a: &A, b: &B) -> bool {
    let (a, b) = (a.as_ref(), b.as_ref());
    if a.len() == b.len() {
        let mut x = 0u8;
        for (aa, bb) in a.iter().zip(b.iter()) {
            x |= *aa ^ *bb;
        }
        x == 0
    } else {
        false
    }
}

/// Container for fixed-size secrets that zeroes them on drop.
///
/// Libraries we call may keep their own copies, so this cannot catch every
/// secret in process memory, but it keeps the ones we own from lingering in
/// swap or heap reuse.
#[derive(Clone)]
#[repr(transparent)]
pub struct Secret<const L: usize>(pub [u8; L]);

impl<const L: usize> Secret<L> {
    #[inline(always)]
    pub fn new() -> Self {
        Self([0u8; L])
    }

    /// Copy a slice into a new secret, zeroing the source.
    /// Panics if the slice length does not match.
    pub fn move_bytes(b: &mut [u8]) -> Self {
        let ret = Self(b.try_into().unwrap());
        b.zeroize();
        ret
    }

    /// Copy a slice into a new secret, leaving the source untouched.
    /// The caller is responsible for destroying the source.
    pub fn copy_bytes(b: &[u8]) -> Self {
        Self(b.try_into().unwrap())
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; L] {
        &self.0
    }

    /// The first N bytes of this secret as a fixed length array.
    #[inline(always)]
    pub fn first_n<const N: usize>(&self) -> &[u8; N] {
        assert!(N <= L);
        self.0[..N].try_into().unwrap()
    }
}

impl<const L: usize> Drop for Secret<L> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<const L: usize> Default for Secret<L> {
    #[inline(always)]
    fn default() -> Self {
        Self([0u8; L])
    }
}

impl<const L: usize> AsRef<[u8]> for Secret<L> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const L: usize> AsMut<[u8]> for Secret<L> {
    #[inline(always)]
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const L: usize> PartialEq for Secret<L> {
    fn eq(&self, other: &Self) -> bool {
        secure_eq(&self.0, &other.0)
    }
}
impl<const L: usize> Eq for Secret<L> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_eq_basics() {
        assert!(secure_eq(&[1u8, 2, 3], &[1u8, 2, 3]));
        assert!(!secure_eq(&[1u8, 2, 3], &[1u8, 2, 4]));
        assert!(!secure_eq(&[1u8, 2], &[1u8, 2, 3]));
    }

    #[test]
    fn move_bytes_destroys_source() {
        let mut src = [7u8; 32];
        let s: Secret<32> = Secret::move_bytes(&mut src);
        assert_eq!(s.as_bytes(), &[7u8; 32]);
        assert_eq!(src, [0u8; 32]);
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Size of all scratch I/O buffers, at least twice the maximum physical MTU.
pub const BUF_SIZE: usize = 16384;

/// A fixed-size I/O scratch buffer with a current length.
///
/// Buffers are handed back and forth between the node and the host and are
/// expensive enough to allocate that they are recycled through a process-wide
/// freelist rather than freed.
pub struct Buf {
    data: Box<[u8; BUF_SIZE]>,
    len: usize,
}

impl Buf {
    fn new() -> Self {
        Self { data: Box::new([0u8; BUF_SIZE]), len: 0 }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the valid length, panicking in debug if out of range.
    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= BUF_SIZE);
        self.len = len;
    }

    /// Copy a slice into the buffer and set the length, or None if too large.
    pub fn from_slice(b: &[u8]) -> Option<PooledBuf> {
        if b.len() > BUF_SIZE {
            return None;
        }
        let mut buf = alloc();
        buf.data[..b.len()].copy_from_slice(b);
        buf.len = b.len();
        Some(buf)
    }

    /// Append bytes, returning false on overflow (buffer unchanged).
    pub fn append(&mut self, b: &[u8]) -> bool {
        let end = self.len + b.len();
        if end > BUF_SIZE {
            return false;
        }
        self.data[self.len..end].copy_from_slice(b);
        self.len = end;
        true
    }

    #[inline(always)]
    pub fn as_full_mut(&mut self) -> &mut [u8; BUF_SIZE] {
        &mut self.data
    }
}

impl Deref for Buf {
    type Target = [u8];
    #[inline(always)]
    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for Buf {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

static POOL: Mutex<Vec<Buf>> = Mutex::new(Vec::new());

/// Get a buffer from the pool, allocating if the pool is empty.
pub fn alloc() -> PooledBuf {
    let b = POOL.lock().unwrap().pop().unwrap_or_else(Buf::new);
    PooledBuf(Some(b))
}

/// An owned pooled buffer that returns to the freelist on drop.
pub struct PooledBuf(Option<Buf>);

impl PooledBuf {
    /// Release without returning to the pool, for buffers whose ownership
    /// passed to the host and came back through a process call.
    pub fn into_inner(mut self) -> Buf {
        self.0.take().unwrap()
    }
}

impl From<Buf> for PooledBuf {
    fn from(b: Buf) -> Self {
        Self(Some(b))
    }
}

impl Deref for PooledBuf {
    type Target = Buf;
    #[inline(always)]
    fn deref(&self) -> &Buf {
        self.0.as_ref().unwrap()
    }
}

impl DerefMut for PooledBuf {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Buf {
        self.0.as_mut().unwrap()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(mut b) = self.0.take() {
            b.len = 0;
            let mut pool = POOL.lock().unwrap();
            // Bound the freelist so a burst does not pin memory forever.
            if pool.len() < 128 {
                pool.push(b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles() {
        let mut b = alloc();
        assert!(b.is_empty());
        assert!(b.append(&[1, 2, 3]));
        assert_eq!(&b[..], &[1, 2, 3]);
        drop(b);
        let b2 = alloc();
        assert!(b2.is_empty());
    }

    #[test]
    fn append_respects_capacity() {
        let mut b = alloc();
        assert!(b.append(&[0u8; BUF_SIZE]));
        assert!(!b.append(&[0u8]));
        assert_eq!(b.len(), BUF_SIZE);
    }
}

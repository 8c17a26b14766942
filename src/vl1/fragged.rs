/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::util::buffer::{self, PooledBuf};
use crate::vl1::protocol::{HEADER_SIZE, MAX_FRAGMENTS};

/// In-place defragmenter for one packet at a time.
///
/// Tracks at most one packet (keyed by its counter); a fragment bearing a
/// different counter resets the state and starts assembling the new packet,
/// so a stale partial assembly can never hold buffers past the next packet.
pub struct Fragged {
    counter: u64,
    have: u16,
    count: u8,
    frags: [Option<PooledBuf>; MAX_FRAGMENTS],
}

impl Fragged {
    pub fn new() -> Self {
        Self { counter: 0, have: 0, count: 0, frags: Default::default() }
    }

    /// Add a fragment; returns the assembled packet once all fragments of
    /// the current counter have arrived. Fragment payloads (everything past
    /// the per-fragment header) are concatenated in fragment order behind
    /// fragment 0's full header.
    ///
    /// Returns None and drops the fragment on any inconsistency; fragment
    /// headers are unauthenticated so this must tolerate garbage.
    pub fn assemble(&mut self, counter: u64, fragment_no: u8, fragment_count: u8, fragment: PooledBuf) -> Option<PooledBuf> {
        if fragment_no >= fragment_count || fragment_count as usize > MAX_FRAGMENTS || fragment.len() < HEADER_SIZE {
            return None;
        }

        if counter != self.counter || fragment_count != self.count {
            self.reset();
            self.counter = counter;
            self.count = fragment_count;
        }

        let got = 1u16 << fragment_no;
        if self.have & got != 0 {
            return None;
        }
        self.have |= got;
        self.frags[fragment_no as usize] = Some(fragment);

        if self.have != (1u16 << self.count) - 1 {
            return None;
        }

        let mut assembled = buffer::alloc();
        for (i, f) in self.frags.iter_mut().take(self.count as usize).enumerate() {
            let f = f.take()?;
            let part = if i == 0 { &f[..] } else { &f[HEADER_SIZE..] };
            if !assembled.append(part) {
                self.reset();
                return None;
            }
        }
        self.reset();
        Some(assembled)
    }

    fn reset(&mut self) {
        self.counter = 0;
        self.have = 0;
        self.count = 0;
        for f in self.frags.iter_mut() {
            *f = None;
        }
    }
}

impl Default for Fragged {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::buffer::Buf;

    fn frag(header_counter: u8, body: &[u8]) -> PooledBuf {
        let mut v = vec![header_counter; HEADER_SIZE];
        v.extend_from_slice(body);
        Buf::from_slice(&v).unwrap()
    }

    #[test]
    fn single_fragment_passes_through() {
        let mut f = Fragged::new();
        let out = f.assemble(7, 0, 1, frag(1, b"payload")).unwrap();
        assert_eq!(&out[HEADER_SIZE..], b"payload");
    }

    #[test]
    fn out_of_order_assembly() {
        let mut f = Fragged::new();
        assert!(f.assemble(9, 2, 3, frag(1, b"cc")).is_none());
        assert!(f.assemble(9, 0, 3, frag(1, b"aa")).is_none());
        let out = f.assemble(9, 1, 3, frag(1, b"bb")).unwrap();
        assert_eq!(&out[HEADER_SIZE..], b"aabbcc");
    }

    #[test]
    fn newer_counter_evicts_stale_partial() {
        let mut f = Fragged::new();
        assert!(f.assemble(1, 0, 2, frag(1, b"old")).is_none());
        assert!(f.assemble(2, 0, 2, frag(2, b"n0")).is_none());
        let out = f.assemble(2, 1, 2, frag(2, b"n1")).unwrap();
        assert_eq!(&out[HEADER_SIZE..], b"n0n1");
    }

    #[test]
    fn garbage_fragments_rejected() {
        let mut f = Fragged::new();
        assert!(f.assemble(1, 3, 2, frag(1, b"x")).is_none());
        assert!(f.assemble(1, 0, (MAX_FRAGMENTS + 1) as u8, frag(1, b"x")).is_none());
        // Duplicate fragment is dropped without completing.
        assert!(f.assemble(4, 0, 2, frag(1, b"p")).is_none());
        assert!(f.assemble(4, 0, 2, frag(1, b"p")).is_none());
    }
}

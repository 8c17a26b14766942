/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::vl1::endpoint::Endpoint;
use crate::vl1::protocol::PATH_LIVENESS_WINDOW;

/// One place a peer has been reached: an endpoint plus liveness bookkeeping.
pub struct Path {
    pub endpoint: Endpoint,
    last_send: AtomicI64,
    last_receive: AtomicI64,
    preferred: AtomicBool,
}

impl Path {
    pub fn new(endpoint: Endpoint, now: i64) -> Self {
        Self {
            endpoint,
            last_send: AtomicI64::new(0),
            last_receive: AtomicI64::new(now),
            preferred: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn sent(&self, now: i64) {
        self.last_send.store(now, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn received(&self, now: i64) {
        self.last_receive.store(now, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    /// A path is alive while packets keep arriving inside the liveness window.
    pub fn alive(&self, now: i64) -> bool {
        now - self.last_receive() <= PATH_LIVENESS_WINDOW
    }

    pub fn preferred(&self) -> bool {
        self.preferred.load(Ordering::Relaxed)
    }

    pub fn set_preferred(&self, p: bool) {
        self.preferred.store(p, Ordering::Relaxed);
    }

    /// Ranking key for path selection: alive and preferred first, then IPv6
    /// over IPv4, then most recent receive. Higher compares greater.
    pub fn rank(&self, now: i64) -> (bool, bool, u8, i64) {
        let family = match self.endpoint.ip() {
            Some(IpAddr::V6(_)) => 2,
            Some(IpAddr::V4(_)) => 1,
            None => 0,
        };
        (self.alive(now), self.preferred(), family, self.last_receive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp(s: &str) -> Endpoint {
        Endpoint::IpUdp(s.parse().unwrap())
    }

    #[test]
    fn liveness_window() {
        let p = Path::new(udp("10.0.0.1:9993"), 1000);
        assert!(p.alive(1000 + PATH_LIVENESS_WINDOW));
        assert!(!p.alive(1001 + PATH_LIVENESS_WINDOW));
        p.received(50_000);
        assert!(p.alive(60_000));
    }

    #[test]
    fn ranking_prefers_live_v6_recent() {
        let now = 100_000;
        let v4 = Path::new(udp("10.0.0.1:9993"), now);
        let v6 = Path::new(udp("[fe80::1]:9993"), now);
        assert!(v6.rank(now) > v4.rank(now));
        let dead = Path::new(udp("[fe80::2]:9993"), 1);
        assert!(v4.rank(now) > dead.rank(now));
        let recent = Path::new(udp("10.0.0.2:9993"), now + 5);
        assert!(recent.rank(now + 5) > v4.rank(now + 5));
    }
}

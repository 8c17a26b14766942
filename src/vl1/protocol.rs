/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::crypto::aead::AES_GCM_TAG_SIZE;
use crate::util::buffer::BUF_SIZE;

/* Transport constants */

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 9993;

/// Minimum physical UDP MTU for the protocol to function.
pub const MIN_UDP_MTU: usize = 1400;
/// Default physical UDP MTU, a safe value for almost all real paths.
pub const DEFAULT_UDP_MTU: usize = 1432;
/// Maximum physical UDP payload plus headroom for future expansion.
pub const MAX_UDP_MTU: usize = 10100 + 224;

/* Packet framing */
/*
Header:
    [0..8]   64-bit send counter (AEAD nonce material, fragment group id)
    [8..13]  destination address
    [13..18] source address
    [18]     fragment number (0-based)
    [19]     fragment count (1..=MAX_FRAGMENTS)
    [20]     flags: bit 0 = cleartext (HELLO only)
Payload (fragment 0 starts with the verb byte):
    [21..]   encrypted verb + body, followed by the 16-byte GCM tag,
             except cleartext HELLO which is authenticated by an
             identity signature instead.
*/

pub const HEADER_SIZE: usize = 21;

pub const COUNTER_INDEX: usize = 0;
pub const DEST_INDEX: usize = 8;
pub const SRC_INDEX: usize = 13;
pub const FRAGMENT_NO_INDEX: usize = 18;
pub const FRAGMENT_COUNT_INDEX: usize = 19;
pub const FLAGS_INDEX: usize = 20;

/// Bytes of header covered as AEAD associated data: both addresses. The
/// counter is already bound through the nonce and the fragment fields are
/// consumed by reassembly before decryption.
pub const AAD_RANGE: std::ops::Range<usize> = DEST_INDEX..FRAGMENT_NO_INDEX;

pub const FLAG_CLEARTEXT: u8 = 0x01;

pub const MAX_FRAGMENTS: usize = 16;

/// Smallest packet that can possibly be valid: header, verb, tag.
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + 1 + AES_GCM_TAG_SIZE;

/// Largest payload (verb byte included) across all fragments of one packet.
pub const MAX_PACKET_PAYLOAD: usize = BUF_SIZE - HEADER_SIZE - AES_GCM_TAG_SIZE;

/// Hard cap on USER_MESSAGE payloads: one packet minus framing and type id.
pub const MAX_USER_MESSAGE_SIZE: usize = MAX_PACKET_PAYLOAD - 1 - 8;

/* Verbs */

pub const VERB_NOP: u8 = 0x00;
pub const VERB_HELLO: u8 = 0x01;
pub const VERB_ERROR: u8 = 0x02;
pub const VERB_OK: u8 = 0x03;
pub const VERB_WHOIS: u8 = 0x04;
pub const VERB_RENDEZVOUS: u8 = 0x05;
pub const VERB_FRAME: u8 = 0x06;
pub const VERB_EXT_FRAME: u8 = 0x07;
pub const VERB_ECHO: u8 = 0x08;
pub const VERB_MULTICAST_LIKE: u8 = 0x09;
pub const VERB_NETWORK_CONFIG_REQUEST: u8 = 0x0b;
pub const VERB_NETWORK_CONFIG: u8 = 0x0c;
pub const VERB_USER_MESSAGE: u8 = 0x14;

/// In-packet error codes carried by VERB_ERROR.
pub const ERROR_OBJ_NOT_FOUND: u8 = 0x01;
pub const ERROR_NETWORK_ACCESS_DENIED: u8 = 0x02;
pub const ERROR_UNSUPPORTED_OPERATION: u8 = 0x03;

pub const PROTOCOL_VERSION: u8 = 12;

/* Anti-replay */

/// Reorder tolerance of the per-peer replay filter; one bit per counter, so
/// this must match the width of the filter's bitmap word.
pub const COUNTER_WINDOW_SIZE: usize = u64::BITS as usize;
pub const COUNTER_MAX_SKIP_AHEAD: u64 = 1 << 24;

/* Timing (all milliseconds) */

/// A path with no receive inside this window is no longer alive.
pub const PATH_LIVENESS_WINDOW: i64 = 45_000;
/// Idle paths get a NOP keepalive after this long to hold NAT mappings open.
pub const PATH_KEEPALIVE_INTERVAL: i64 = 14_000;
/// HELLO is re-sent to every peer this often to refresh latency and liveness.
pub const HELLO_INTERVAL: i64 = 60_000;
/// Peers with no authenticated receive for this long are evicted.
pub const PEER_EXPIRATION: i64 = 500_000;
/// Retry interval for outstanding WHOIS lookups.
pub const WHOIS_RETRY_INTERVAL: i64 = 1_000;
pub const WHOIS_MAX_RETRIES: u8 = 3;
/// Config request retry while a network is still awaiting its first config.
pub const CONFIG_REQUEST_INTERVAL: i64 = 5_000;
/// Periodic config refresh once a network is operating.
pub const CONFIG_REFRESH_INTERVAL: i64 = 60_000;
/// Multicast subscriptions are re-announced this often.
pub const MULTICAST_ANNOUNCE_INTERVAL: i64 = 60_000;
/// Certificates are re-validated against the clock this often.
pub const TRUST_STORE_REVALIDATE_INTERVAL: i64 = 3_600_000;
/// Background tasks never sleep longer than this even when fully idle.
pub const MAX_BACKGROUND_INTERVAL: i64 = 1_000;

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::state::StateObjectType;
use crate::vl1::address::Address;
use crate::vl1::endpoint::Endpoint;
use crate::vl2::networkid::NetworkId;

/// Why a VL1 packet was discarded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TracePacketDropReason {
    Unspecified = 0,
    PeerTooOld = 1,
    MalformedPacket = 2,
    MacFailed = 3,
    RateLimitExceeded = 4,
    InvalidObject = 5,
    InvalidCompressedData = 6,
    UnrecognizedVerb = 7,
    ReplyNotExpected = 8,
}

/// Why a VL2 frame was discarded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TraceFrameDropReason {
    Unspecified = 0,
    BridgingNotAllowedRemote = 1,
    BridgingNotAllowedLocal = 2,
    MulticastDisabled = 3,
    BroadcastDisabled = 4,
    FilterBlocked = 5,
    FilterBlockedAtBridgeReplication = 6,
    PermissionDenied = 7,
}

/// Diagnostic events surfaced through `Event::Trace`.
///
/// These are fire-and-forget observability, never control flow: a host that
/// ignores every trace sees identical node behavior.
#[derive(Clone, Debug)]
pub enum TraceEvent {
    /// A wire packet was dropped before or during authentication.
    PacketDropped {
        source: Option<Address>,
        endpoint: Option<Endpoint>,
        reason: TracePacketDropReason,
    },
    /// A virtual network frame was dropped by VL2 policy or the rule engine.
    FrameDropped {
        network_id: NetworkId,
        source: Option<Address>,
        reason: TraceFrameDropReason,
    },
    /// A persisted object failed to decode and was ignored or regenerated.
    CorruptStateObject { object_type: StateObjectType },
    /// A credential (network config or certificate) was rejected.
    CredentialRejected { source: Option<Address>, network_id: Option<NetworkId> },
}

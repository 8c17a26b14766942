/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::trace::TraceEvent;
use crate::vl1::fingerprint::Fingerprint;

/// A message delivered by `VERB_USER_MESSAGE`, surfaced as an event.
#[derive(Clone, Debug)]
pub struct UserMessage {
    /// Strong identity of the sender.
    pub source: Fingerprint,
    /// Application-defined message type.
    pub type_id: u64,
    pub data: Vec<u8>,
}

/// Node lifecycle and diagnostic events delivered through the host's event
/// callback.
#[derive(Clone, Debug)]
pub enum Event {
    /// The node is up. Always the first event, delivered exactly once and
    /// before the constructor returns.
    Up,
    /// Connectivity to the network (roots) appears lost. Hysteresis-smoothed;
    /// the node keeps operating and will come back with `Online`.
    Offline,
    /// Connectivity regained.
    Online,
    /// The node is shutting down. The last event.
    Down,
    /// A diagnostic trace.
    Trace(TraceEvent),
    /// An inbound user message.
    UserMessage(UserMessage),
}

impl Event {
    /// Numeric event code at the ABI boundary. Code 4 is reserved (it
    /// formerly signaled an identity address collision).
    pub fn code(&self) -> u32 {
        match self {
            Self::Up => 0,
            Self::Offline => 1,
            Self::Online => 2,
            Self::Down => 3,
            Self::Trace(_) => 5,
            Self::UserMessage(_) => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_code_four_is_skipped() {
        assert_eq!(Event::Down.code(), 3);
        assert_eq!(Event::Trace(TraceEvent::CorruptStateObject { object_type: crate::state::StateObjectType::Locator }).code(), 5);
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! The ZeroTier node core: a peer-to-peer virtual Ethernet engine.
//!
//! This crate contains only the engine. It opens no sockets, reads no clock,
//! touches no filesystem, and spawns no threads: the host drives it through
//! [`Node`]'s process calls (always passing the current time) and the engine
//! acts on the world exclusively through the [`HostSystem`] trait it is
//! constructed with.

pub mod cert;
pub mod crypto;
pub mod error;
pub mod event;
pub mod host;
pub mod node;
pub mod state;
pub mod trace;
pub mod util;
pub mod vl1;
pub mod vl2;

pub use error::ResultCode;
pub use event::Event;
pub use host::HostSystem;
pub use node::{NetworkSnapshot, Node, NodeStatus, PeerSnapshot};
pub use state::StateObjectType;
pub use vl1::{Address, Endpoint, Fingerprint, Identity, IdentityType, Locator};
pub use vl2::{MulticastGroup, NetworkConfig, NetworkId};

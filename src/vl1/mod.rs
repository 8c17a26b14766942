/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

pub mod address;
pub mod antireplay;
pub mod endpoint;
pub mod fingerprint;
pub mod fragged;
pub mod identity;
pub mod locator;
pub mod mac;
pub mod path;
pub mod peer;
pub mod protocol;

pub use address::Address;
pub use endpoint::Endpoint;
pub use fingerprint::Fingerprint;
pub use identity::{Identity, IdentityType};
pub use locator::Locator;
pub use mac::Mac;
pub use path::Path;
pub use peer::Peer;

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

pub mod aead;
pub mod c25519;
pub mod hash;
pub mod p384;
pub mod secret;

pub use secret::{secure_eq, Secret};

// Re-export the RNG dependency so callers use the exact same version.
pub use rand_core;

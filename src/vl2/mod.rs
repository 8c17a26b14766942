/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

pub mod multicastgroup;
pub mod network;
pub mod networkconfig;
pub mod networkid;
pub mod rules;

pub use multicastgroup::MulticastGroup;
pub use network::{Network, VirtualNetworkStatus, VirtualNetworkType};
pub use networkconfig::NetworkConfig;
pub use networkid::NetworkId;

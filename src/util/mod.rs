/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

pub mod buffer;
pub mod hex;
pub mod marshal;

pub use buffer::{Buf, PooledBuf, BUF_SIZE};
pub use marshal::{MarshalReader, MarshalWriter};

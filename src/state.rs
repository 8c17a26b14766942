/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::util::hex;

/// Types of objects the node asks the host to persist.
///
/// Object IDs are short arrays of u64 whose required length depends on the
/// type. The host may store these anywhere; `canonical_path` is the
/// conventional filesystem layout for hosts that use one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StateObjectType {
    /// Public identity, ID length 0.
    IdentityPublic,
    /// Full identity with secret keys, ID length 0. The host should restrict
    /// read permissions on this object. Loss is fatal to the node's address.
    IdentitySecret,
    /// Our signed locator, ID length 0.
    Locator,
    /// A peer record; ID is one u64 holding the 40-bit address.
    Peer,
    /// A network configuration; ID is one u64 holding the network ID.
    NetworkConfig,
    /// Trust store membership and local trust flags, ID length 0.
    TrustStore,
    /// A certificate; ID is six u64s holding the 384-bit serial.
    Cert,
}

impl StateObjectType {
    /// Numeric type code at the ABI boundary.
    pub fn to_u32(self) -> u32 {
        match self {
            Self::IdentityPublic => 1,
            Self::IdentitySecret => 2,
            Self::Locator => 3,
            Self::Peer => 5,
            Self::NetworkConfig => 6,
            Self::TrustStore => 7,
            Self::Cert => 8,
        }
    }

    /// Required ID length in u64s.
    pub fn id_size(self) -> usize {
        match self {
            Self::IdentityPublic | Self::IdentitySecret | Self::Locator | Self::TrustStore => 0,
            Self::Peer | Self::NetworkConfig => 1,
            Self::Cert => 6,
        }
    }

    /// Conventional path for hosts that persist to a filesystem.
    pub fn canonical_path(self, id: &[u64]) -> String {
        debug_assert_eq!(id.len(), self.id_size());
        match self {
            Self::IdentityPublic => "identity.public".into(),
            Self::IdentitySecret => "identity.secret".into(),
            Self::Locator => "locator".into(),
            Self::TrustStore => "trust".into(),
            Self::Peer => format!("peers.d/{}", hex::to_string_u64(id[0], 10)),
            Self::NetworkConfig => format!("networks.d/{}.conf", hex::to_string_u64(id[0], 16)),
            Self::Cert => {
                let mut s = String::with_capacity(96 + 8);
                s.push_str("certs.d/");
                for w in id {
                    s.push_str(&hex::to_string_u64(*w, 16));
                }
                s
            }
        }
    }
}

/// Pack a 48-byte certificate serial into the six-u64 object ID form.
pub fn cert_serial_to_id(serial: &[u8; 48]) -> [u64; 6] {
    std::array::from_fn(|i| u64::from_be_bytes(serial[i * 8..(i + 1) * 8].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths() {
        assert_eq!(StateObjectType::IdentitySecret.canonical_path(&[]), "identity.secret");
        assert_eq!(StateObjectType::Peer.canonical_path(&[0xdeadbeef01]), "peers.d/deadbeef01");
        assert_eq!(
            StateObjectType::NetworkConfig.canonical_path(&[0x8056c2e21c000001]),
            "networks.d/8056c2e21c000001.conf"
        );
        let serial = [0xabu8; 48];
        let id = cert_serial_to_id(&serial);
        assert_eq!(StateObjectType::Cert.canonical_path(&id).len(), "certs.d/".len() + 96);
    }
}

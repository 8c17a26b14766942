/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

mod certificate;
mod subject;
mod trust;

pub use certificate::{Certificate, CERTIFICATE_SERIAL_SIZE};
pub use subject::{Name, Subject, SubjectIdentity, SubjectNetwork, SubjectUniqueId, CERTIFICATE_MAX_STRING_LENGTH};
pub use trust::{TrustStore, LOCAL_TRUST_FLAG_ROOT_CA, LOCAL_TRUST_FLAG_ZEROTIER_ROOT_SET};

use thiserror::Error;

/// Certificate verification outcomes.
///
/// Positive codes are informational results (the certificate itself is not
/// invalid); negative codes are hard failures. The numeric values are part of
/// the public ABI.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum CertificateError {
    #[error("a newer certificate for this subject is already known")]
    HaveNewerCert,
    #[error("invalid format")]
    InvalidFormat,
    #[error("an identity in the certificate is invalid or failed validation")]
    InvalidIdentity,
    #[error("primary issuer signature invalid")]
    InvalidPrimarySignature,
    #[error("certificate chain does not terminate at a trusted root")]
    InvalidChain,
    #[error("a signed component (such as a locator) has an invalid signature")]
    InvalidComponentSignature,
    #[error("subject unique ID proof signature invalid")]
    InvalidUniqueIdProof,
    #[error("required fields missing")]
    MissingRequiredFields,
    #[error("certificate is expired or not yet in effect")]
    OutOfValidTimeWindow,
}

impl CertificateError {
    /// Numeric value at the ABI boundary; zero is reserved for "none".
    pub fn to_i32(self) -> i32 {
        match self {
            Self::HaveNewerCert => 1,
            Self::InvalidFormat => -1,
            Self::InvalidIdentity => -2,
            Self::InvalidPrimarySignature => -3,
            Self::InvalidChain => -4,
            Self::InvalidComponentSignature => -5,
            Self::InvalidUniqueIdProof => -6,
            Self::MissingRequiredFields => -7,
            Self::OutOfValidTimeWindow => -8,
        }
    }

    /// True for informational (non-fatal) outcomes.
    pub fn is_informational(self) -> bool {
        self.to_i32() > 0
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use thiserror::Error;

/// Result codes returned by node operations and process calls.
///
/// Codes in `[100, 1000)` are fatal: the node instance should be considered
/// dead and deleted. Codes `>= 1000` are errors reported to the caller after
/// which the node continues to operate normally.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum ResultCode {
    #[error("ok")]
    Ok,
    #[error("out of memory")]
    FatalOutOfMemory,
    #[error("data store failed")]
    FatalDataStoreFailed,
    #[error("fatal internal error")]
    FatalInternal,
    #[error("network not found")]
    ErrorNetworkNotFound,
    #[error("unsupported operation")]
    ErrorUnsupportedOperation,
    #[error("bad parameter")]
    ErrorBadParameter,
    #[error("invalid credential")]
    ErrorInvalidCredential,
    #[error("colliding object")]
    ErrorCollidingObject,
    #[error("internal error")]
    ErrorInternal,
}

impl ResultCode {
    /// Numeric value as it appears at the public ABI boundary.
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::FatalOutOfMemory => 100,
            Self::FatalDataStoreFailed => 101,
            Self::FatalInternal => 102,
            Self::ErrorNetworkNotFound => 1000,
            Self::ErrorUnsupportedOperation => 1001,
            Self::ErrorBadParameter => 1002,
            Self::ErrorInvalidCredential => 1003,
            Self::ErrorCollidingObject => 1004,
            Self::ErrorInternal => 1005,
        }
    }

    pub fn is_fatal(self) -> bool {
        let c = self.to_u32();
        (100..1000).contains(&c)
    }
}

/// Returned when a serialized or textual object cannot be parsed.
///
/// Carries no detail on purpose: the object either parses completely or it
/// does not, and unparseable input arriving from the wire is attacker
/// controlled.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("invalid object format")]
pub struct InvalidFormatError;

/// Returned when an API parameter is unusable, e.g. an identity with no
/// private key passed to a signing operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("invalid parameter: {0}")]
pub struct InvalidParameterError(pub &'static str);

impl From<InvalidFormatError> for ResultCode {
    fn from(_: InvalidFormatError) -> Self {
        ResultCode::ErrorBadParameter
    }
}

impl From<InvalidParameterError> for ResultCode {
    fn from(_: InvalidParameterError) -> Self {
        ResultCode::ErrorBadParameter
    }
}

#[cfg(test)]
mod tests {
    use super::ResultCode;

    #[test]
    fn fatality_partition() {
        for c in [
            ResultCode::Ok,
            ResultCode::FatalOutOfMemory,
            ResultCode::FatalDataStoreFailed,
            ResultCode::FatalInternal,
            ResultCode::ErrorNetworkNotFound,
            ResultCode::ErrorUnsupportedOperation,
            ResultCode::ErrorBadParameter,
            ResultCode::ErrorInvalidCredential,
            ResultCode::ErrorCollidingObject,
            ResultCode::ErrorInternal,
        ] {
            assert_eq!(c.is_fatal(), (100..1000).contains(&c.to_u32()));
        }
        assert!(ResultCode::FatalDataStoreFailed.is_fatal());
        assert!(!ResultCode::ErrorBadParameter.is_fatal());
    }
}

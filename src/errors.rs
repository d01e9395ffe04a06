//! Error types for the DC-net core.
//!
//! Follows a two-tier scheme: [`CallerError`] covers mistakes made by the
//! calling application (bad configuration, malformed input bytes), while
//! [`InternalError`] covers everything that can go wrong once a session is
//! running, including protocol errors attributable to a specific peer.
//! Setup errors are fatal to the session; round errors are recovered at the
//! round boundary by the relay's round driver.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::protocol::PeerId;
use thiserror::Error;

/// Convenience alias for the crate-wide error type.
pub type Result<T> = std::result::Result<T, InternalError>;

/// Errors induced by the calling application.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum CallerError {
    /// The input provided to a participant constructor was malformed.
    #[error("the protocol input was not well-formed")]
    BadInput,
    /// The session configuration failed validation.
    #[error("the session configuration was not valid")]
    InvalidConfiguration,
    /// A value could not be serialized.
    #[error("serialization failed")]
    SerializationFailed,
    /// Bytes received from a peer or the caller could not be parsed.
    #[error("deserialization failed")]
    DeserializationFailed,
    /// A message was passed to a participant after it terminated.
    #[error("the protocol has already terminated")]
    ProtocolAlreadyTerminated,
}

/// Errors arising during a running session.
///
/// The variants distinguish the protocol's failure classes: configuration,
/// protocol-version skew, transport, and cryptographic failure.
/// [`InternalError::exit_code`] maps each class to the process exit code
/// the enclosing binary should report.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum InternalError {
    /// An internal invariant was violated; this is a bug in this crate.
    #[error("internal invariant failed")]
    InternalInvariantFailed,
    /// A peer violated the protocol. Carries the offender when known.
    #[error("protocol error{}", .0.map(|p| format!(" (attributed to {p})")).unwrap_or_default())]
    ProtocolError(Option<PeerId>),
    /// The calling application misused the API.
    #[error(transparent)]
    CallingApplicationMistake(#[from] CallerError),
    /// A peer announced a protocol version different from ours.
    #[error("protocol version mismatch: peer announced {theirs}, expected {ours}")]
    VersionMismatch {
        /// The version the peer announced.
        theirs: u32,
        /// The version this node speaks.
        ours: u32,
    },
    /// A group element or scalar could not be decoded from its wire bytes.
    #[error("could not decode a group element or scalar")]
    UnmarshalFailed,
    /// A shuffle proof failed verification.
    #[error("shuffle proof failed verification")]
    ShuffleProofInvalid,
    /// The decoded payload failed AES-GCM authentication.
    #[error("payload failed authentication; round disrupted")]
    PayloadAuthenticationFailed,
    /// A peer disconnected before setup completed.
    #[error("peer {0} disconnected before setup completed")]
    PeerDisconnected(PeerId),
}

impl InternalError {
    /// Map this error to the process exit code of its failure class:
    /// 1 configuration, 2 version mismatch, 3 cryptographic failure,
    /// 4 peer disconnect before setup completed.
    ///
    /// `0` is reserved for normal termination and never returned here.
    pub fn exit_code(&self) -> i32 {
        match self {
            InternalError::CallingApplicationMistake(_) => 1,
            InternalError::VersionMismatch { .. } => 2,
            InternalError::ShuffleProofInvalid
            | InternalError::UnmarshalFailed
            | InternalError::PayloadAuthenticationFailed => 3,
            InternalError::PeerDisconnected(_) => 4,
            InternalError::InternalInvariantFailed | InternalError::ProtocolError(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PeerId, Role};

    #[test]
    fn exit_codes_match_the_failure_classes() {
        assert_eq!(
            InternalError::CallingApplicationMistake(CallerError::BadInput).exit_code(),
            1
        );
        assert_eq!(
            InternalError::VersionMismatch { theirs: 0, ours: 1 }.exit_code(),
            2
        );
        assert_eq!(InternalError::ShuffleProofInvalid.exit_code(), 3);
        assert_eq!(
            InternalError::PeerDisconnected(PeerId::new(Role::Client, 0)).exit_code(),
            4
        );
    }
}

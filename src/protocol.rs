//! Session-level identifiers and shared parameters.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::errors::{CallerError, Result};
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The protocol version this crate speaks. Announced in every handshake and
/// key announcement; any mismatch closes the connection.
pub const PROTOCOL_VERSION: u32 = 1;

/// A unique identifier for one protocol session.
///
/// All participants of a session must agree on this value out of band (in
/// practice, the relay assigns it and the enclosing deployment distributes
/// it alongside the roster).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct SessionId(u128);

impl SessionId {
    /// Draw a fresh random session identifier.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        SessionId(rng.gen())
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {:08x}", (self.0 >> 96) as u32)
    }
}

/// The role a participant plays in the star.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Role {
    /// The single hub that sequences rounds and combines cells.
    Relay,
    /// A member of the anonymity set.
    Client,
    /// A cell-cancelling server.
    Trustee,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Relay => write!(f, "relay"),
            Role::Client => write!(f, "client"),
            Role::Trustee => write!(f, "trustee"),
        }
    }
}

/// A participant identity within one session: a role plus an index unique
/// within that role. The relay is always `(Relay, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PeerId {
    role: Role,
    index: u32,
}

impl PeerId {
    /// Construct a peer identity.
    pub fn new(role: Role, index: u32) -> Self {
        Self { role, index }
    }

    /// The relay's identity.
    pub fn relay() -> Self {
        Self::new(Role::Relay, 0)
    }

    /// The role of this peer.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The index of this peer within its role.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.role, self.index)
    }
}

/// The parameters every participant of a session must agree on.
///
/// The relay constructs this from its [`Config`][crate::config::Config] and
/// announces the numeric fields in the handshake frame; clients and
/// trustees check them against their own expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    n_clients: u32,
    n_trustees: u32,
    payload_len: u32,
}

impl SessionConfig {
    /// Construct and validate session parameters.
    ///
    /// At least one client and one trustee must exist.
    pub fn new(n_clients: u32, n_trustees: u32, payload_len: u32) -> Result<Self> {
        if n_clients == 0 || n_trustees == 0 {
            Err(CallerError::InvalidConfiguration)?;
        }
        Ok(Self {
            n_clients,
            n_trustees,
            payload_len,
        })
    }

    /// Number of clients in the session.
    pub fn n_clients(&self) -> u32 {
        self.n_clients
    }

    /// Number of trustees in the session.
    pub fn n_trustees(&self) -> u32 {
        self.n_trustees
    }

    /// Cleartext payload bytes per round.
    pub fn payload_len(&self) -> u32 {
        self.payload_len
    }

    /// Bytes of a wire cell: the payload plus the AES-GCM tag the slot
    /// owner's wrapped payload carries. Zero-length payloads take no wrap
    /// and produce empty cells.
    pub fn cell_len(&self) -> usize {
        if self.payload_len == 0 {
            0
        } else {
            self.payload_len as usize + crate::equivocation::GCM_TAG_LEN
        }
    }

    /// All client identities of the session, in index order.
    pub fn client_ids(&self) -> Vec<PeerId> {
        (0..self.n_clients)
            .map(|i| PeerId::new(Role::Client, i))
            .collect()
    }

    /// All trustee identities of the session, in index order.
    pub fn trustee_ids(&self) -> Vec<PeerId> {
        (0..self.n_trustees)
            .map(|i| PeerId::new(Role::Trustee, i))
            .collect()
    }

    /// All non-relay identities of the session.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids = self.client_ids();
        ids.extend(self.trustee_ids());
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_rejects_empty_roles() {
        assert!(SessionConfig::new(0, 1, 4).is_err());
        assert!(SessionConfig::new(1, 0, 4).is_err());
        assert!(SessionConfig::new(1, 1, 4).is_ok());
    }

    #[test]
    fn cell_len_accounts_for_the_payload_wrap() {
        let config = SessionConfig::new(2, 1, 4).unwrap();
        assert_eq!(config.cell_len(), 20);

        let empty = SessionConfig::new(2, 1, 0).unwrap();
        assert_eq!(empty.cell_len(), 0);
    }
}

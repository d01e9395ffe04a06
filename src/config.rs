//! Node configuration.
//!
//! Loading (files, flags, environment) is the enclosing application's
//! concern; this module defines the typed options, their validation, and
//! the process exit codes. Validation failures are configuration errors
//! and fail fast at startup.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    protocol::{Role, SessionConfig},
};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

/// The cipher suite a session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuiteKind {
    /// Quadratic residues modulo a 512-bit safe prime (testing only).
    Qr512,
    /// Quadratic residues modulo the 1024-bit MODP safe prime.
    Qr1024,
    /// Quadratic residues modulo the 2048-bit MODP safe prime.
    Qr2048,
    /// The Ristretto group over curve25519.
    Ec25519,
}

impl FromStr for SuiteKind {
    type Err = CallerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QR512" => Ok(SuiteKind::Qr512),
            "QR1024" => Ok(SuiteKind::Qr1024),
            "QR2048" => Ok(SuiteKind::Qr2048),
            "EC25519" => Ok(SuiteKind::Ec25519),
            _ => Err(CallerError::InvalidConfiguration),
        }
    }
}

impl FromStr for Role {
    type Err = CallerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relay" => Ok(Role::Relay),
            "client" => Ok(Role::Client),
            "trustee" => Ok(Role::Trustee),
            _ => Err(CallerError::InvalidConfiguration),
        }
    }
}

/// Per-round contribution deadline used when none is configured.
pub const DEFAULT_ROUND_DEADLINE: Duration = Duration::from_secs(1);

/// A node's validated configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Which role this node plays.
    pub role: Role,
    /// The cipher suite of the session.
    pub suite: SuiteKind,
    /// Cleartext payload bytes per round.
    pub payload_length: u32,
    /// Port the relay listens on. Relay only.
    pub listen_port: Option<u16>,
    /// `host:port` of the relay. Clients and trustees only.
    pub relay_address: Option<String>,
    /// Number of clients in the session.
    pub n_clients: u32,
    /// Number of trustees in the session.
    pub n_trustees: u32,
    /// This node's index within its role.
    pub own_index: u32,
    /// How long the relay waits for a round's contributions.
    #[serde(default = "default_round_deadline")]
    pub round_deadline: Duration,
}

fn default_round_deadline() -> Duration {
    DEFAULT_ROUND_DEADLINE
}

impl Config {
    /// Check the option combination is coherent for the configured role.
    pub fn validate(&self) -> Result<()> {
        if self.n_clients == 0 || self.n_trustees == 0 {
            Err(CallerError::InvalidConfiguration)?;
        }
        match self.role {
            Role::Relay => {
                if self.listen_port.is_none() || self.own_index != 0 {
                    Err(CallerError::InvalidConfiguration)?;
                }
            }
            Role::Client => {
                if self.relay_address.is_none() || self.own_index >= self.n_clients {
                    Err(CallerError::InvalidConfiguration)?;
                }
            }
            Role::Trustee => {
                if self.relay_address.is_none() || self.own_index >= self.n_trustees {
                    Err(CallerError::InvalidConfiguration)?;
                }
            }
        }
        Ok(())
    }

    /// The session parameters this configuration describes.
    pub fn session_config(&self) -> Result<SessionConfig> {
        SessionConfig::new(self.n_clients, self.n_trustees, self.payload_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_config() -> Config {
        Config {
            role: Role::Relay,
            suite: SuiteKind::Qr512,
            payload_length: 4,
            listen_port: Some(7007),
            relay_address: None,
            n_clients: 2,
            n_trustees: 1,
            own_index: 0,
            round_deadline: DEFAULT_ROUND_DEADLINE,
        }
    }

    #[test]
    fn relay_configuration_validates() {
        assert!(relay_config().validate().is_ok());
    }

    #[test]
    fn relay_without_listen_port_is_rejected() {
        let mut config = relay_config();
        config.listen_port = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_index_must_be_in_range() {
        let mut config = relay_config();
        config.role = Role::Client;
        config.relay_address = Some("relay.example:7007".into());
        config.own_index = 2;
        assert!(config.validate().is_err());
        config.own_index = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn group_counts_must_be_positive() {
        let mut config = relay_config();
        config.n_trustees = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn suite_names_parse() {
        assert_eq!("QR512".parse::<SuiteKind>().unwrap(), SuiteKind::Qr512);
        assert_eq!("ec25519".parse::<SuiteKind>().unwrap(), SuiteKind::Ec25519);
        assert!("QR4096".parse::<SuiteKind>().is_err());
        assert_eq!("trustee".parse::<Role>().unwrap(), Role::Trustee);
        assert!("auditor".parse::<Role>().is_err());
    }
}

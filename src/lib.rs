//! Cryptographic core of a DC-net (Dining Cryptographers) anonymous
//! broadcast channel.
//!
//! Three roles cooperate in a star around a single relay:
//! - **Clients** own the anonymity set. Each round, every client emits a
//!   pseudorandom cell derived from its pairwise shared secrets; exactly one
//!   client (the slot owner) additionally XORs its payload into the cell.
//! - **Trustees** emit the cancelling counterpart cells, so that the XOR of
//!   everything reveals the owner's payload without revealing the owner.
//! - The **relay** sequences rounds, combines cells, and broadcasts results.
//!
//! # High-level protocol description
//! The protocol runs in two phases:
//! - During *setup*, clients and trustees announce long-term public keys
//!   through the relay and derive pairwise Diffie-Hellman secrets. The
//!   trustees then run a chained shuffle over fresh client ephemeral keys,
//!   producing a slot schedule in which each client can locate its own slot
//!   but nobody can link a slot to a long-term identity.
//! - During *operation*, the relay drives numbered rounds: it broadcasts a
//!   beacon, collects one cell from every client and trustee, XOR-decodes
//!   the open slot, unwraps the owner's payload through the
//!   [equivocation guard][crate::equivocation], and broadcasts the outcome.
//!   A history scalar binds every round to the cumulative transcript so a
//!   misbehaving relay cannot show different transcripts to different
//!   clients without destroying the payload.
//!
//! All networking is left to the caller: participants are driven entirely by
//! [`process_message`][crate::participant::ProtocolParticipant::process_message]
//! over a reliable, ordered, authenticated stream per peer. The
//! [`session`] module shows a complete local deployment over threads and
//! channels.

#![warn(missing_docs)]

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

/// Serialize a value with the crate-wide wire-compatible encoder.
macro_rules! serialize {
    ($x:expr) => {{
        bincode::serialize($x).map_err(|_| {
            crate::errors::InternalError::from(crate::errors::CallerError::SerializationFailed)
        })
    }};
}

/// Deserialize bytes produced by [`serialize!`], without trusting them.
macro_rules! deserialize {
    ($x:expr) => {{
        bincode::deserialize($x).map_err(|_| {
            crate::errors::InternalError::from(crate::errors::CallerError::DeserializationFailed)
        })
    }};
}

pub mod cell;
pub mod client;
pub mod config;
pub mod ec25519;
pub mod equivocation;
pub mod errors;
mod local_storage;
pub mod messages;
pub mod participant;
pub mod protocol;
pub mod qr;
pub mod relay;
pub mod session;
pub mod shuffle;
pub mod suite;
pub mod trustee;
mod utils;

pub use client::{ClientInput, ClientParticipant};
pub use config::{Config, SuiteKind};
pub use ec25519::EC25519;
pub use errors::{CallerError, InternalError, Result};
pub use messages::{Message, MessageType, ResultFrame, RoundOutcome};
pub use participant::{ProcessOutcome, ProtocolParticipant, Status};
pub use protocol::{PeerId, Role, SessionConfig, SessionId, PROTOCOL_VERSION};
pub use qr::{QR1024, QR2048, QR512};
pub use relay::RelayParticipant;
pub use session::LocalSession;
pub use suite::Suite;
pub use trustee::{TrusteeInput, TrusteeParticipant};

//! Message envelope and wire frame formats.
//!
//! Participants exchange [`Message`]s: a typed envelope around an opaque
//! payload. Payloads are the explicit big-endian frames of the wire
//! protocol, parsed through a checked frame reader so that a truncated or
//! padded frame surfaces as a typed error, never a panic or a mis-slice.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    protocol::{PeerId, SessionId},
    utils::{put_len_prefixed, FrameReader},
};
use serde::{Deserialize, Serialize};

/// The type of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Key announcement and session-parameter messages.
    Setup(SetupMessageType),
    /// Ephemeral-key shuffle messages.
    Shuffle(ShuffleMessageType),
    /// Per-round messages.
    Round(RoundMessageType),
}

/// Message types exchanged during key setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupMessageType {
    /// Self-addressed kick-off message that makes a client or trustee open
    /// the conversation with the relay.
    Ready,
    /// Trustee announces its long-term public key to the relay.
    TrusteeKey,
    /// Client announces its long-term public key to the relay.
    ClientHello,
    /// Relay replies with the session parameters (and, for clients, the
    /// trustee public keys).
    SessionParams,
    /// Relay forwards the vector of client public keys to a trustee.
    ClientRoster,
    /// Trustee sends its equivocation scalar after deriving its secrets.
    SigmaContribution,
}

/// Message types of the trustee shuffle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuffleMessageType {
    /// Client submits its ephemeral public key for the current epoch.
    EphemeralKey,
    /// Relay hands the running shuffle state to the next trustee.
    Request,
    /// Trustee returns its shuffled state and proof.
    Reply,
    /// Relay broadcasts the verified shuffle chain to the clients.
    Schedule,
}

/// Message types of the round protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundMessageType {
    /// Relay starts a round.
    Beacon,
    /// Client contribution: cell plus kappa scalar.
    ClientCell,
    /// Trustee contribution: cell only.
    TrusteeCell,
    /// Relay announces the round outcome.
    Result,
}

/// A typed message between two participants of a session.
///
/// The payload bytes are untrusted until parsed by the appropriate frame
/// type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    session_id: SessionId,
    from: PeerId,
    to: PeerId,
    /// Payload bytes, unvalidated until a frame parser accepts them.
    pub(crate) unverified_bytes: Vec<u8>,
}

impl Message {
    /// Construct a message carrying an already-encoded frame.
    pub fn new(
        message_type: MessageType,
        session_id: SessionId,
        from: PeerId,
        to: PeerId,
        frame: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            session_id,
            from,
            to,
            unverified_bytes: frame,
        }
    }

    /// The message type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The session this message belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The sender.
    pub fn from(&self) -> PeerId {
        self.from
    }

    /// The intended recipient.
    pub fn to(&self) -> PeerId {
        self.to
    }

    /// Serialize the whole envelope for a byte-stream transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialize!(self)
    }

    /// Parse an envelope received from a byte-stream transport.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        deserialize!(bytes)
    }
}

/// Public-key announcement: `[u32 version][u32 key_len][key]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAnnouncement {
    /// Protocol version the announcer speaks.
    pub version: u32,
    /// Canonical encoding of the announced public key.
    pub key: Vec<u8>,
}

impl KeyAnnouncement {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = self.version.to_be_bytes().to_vec();
        put_len_prefixed(&mut frame, &self.key);
        frame
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let version = reader.take_u32()?;
        let key = reader.take_len_prefixed()?.to_vec();
        reader.finish()?;
        Ok(Self { version, key })
    }
}

/// Handshake parameters:
/// `[u32 version][u32 cell_size][u32 n_clients][u32 n_trustees][u32 own_index]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol version the relay speaks.
    pub version: u32,
    /// Bytes per wire cell (payload plus authentication tag).
    pub cell_size: u32,
    /// Number of clients in the session.
    pub n_clients: u32,
    /// Number of trustees in the session.
    pub n_trustees: u32,
    /// The recipient's index within its role.
    pub own_index: u32,
}

impl Handshake {
    const LEN: usize = 20;

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(Self::LEN);
        frame.extend_from_slice(&self.version.to_be_bytes());
        frame.extend_from_slice(&self.cell_size.to_be_bytes());
        frame.extend_from_slice(&self.n_clients.to_be_bytes());
        frame.extend_from_slice(&self.n_trustees.to_be_bytes());
        frame.extend_from_slice(&self.own_index.to_be_bytes());
        frame
    }

    fn read(reader: &mut FrameReader<'_>) -> Result<Self> {
        Ok(Self {
            version: reader.take_u32()?,
            cell_size: reader.take_u32()?,
            n_clients: reader.take_u32()?,
            n_trustees: reader.take_u32()?,
            own_index: reader.take_u32()?,
        })
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let handshake = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(handshake)
    }
}

/// Session parameters sent to a connecting peer: the handshake, followed by
/// a (possibly empty) public-key vector `[u32 count]([u32 len][key])*`.
/// Clients receive the trustee keys here; trustees receive an empty vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParamsFrame {
    /// The numeric session parameters.
    pub handshake: Handshake,
    /// Trustee public keys, in trustee-index order.
    pub trustee_keys: Vec<Vec<u8>>,
}

impl SessionParamsFrame {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = self.handshake.encode();
        put_key_vector(&mut frame, &self.trustee_keys);
        frame
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let handshake = Handshake::read(&mut reader)?;
        let trustee_keys = read_key_vector(&mut reader)?;
        reader.finish()?;
        Ok(Self {
            handshake,
            trustee_keys,
        })
    }
}

/// Public-key vector: `[u32 count]([u32 key_len][key])*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVector {
    /// The keys, in announcement order.
    pub keys: Vec<Vec<u8>>,
}

impl KeyVector {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        put_key_vector(&mut frame, &self.keys);
        frame
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let keys = read_key_vector(&mut reader)?;
        reader.finish()?;
        Ok(Self { keys })
    }
}

fn put_key_vector(frame: &mut Vec<u8>, keys: &[Vec<u8>]) {
    frame.extend_from_slice(&(keys.len() as u32).to_be_bytes());
    for key in keys {
        put_len_prefixed(frame, key);
    }
}

fn read_key_vector(reader: &mut FrameReader<'_>) -> Result<Vec<Vec<u8>>> {
    let count = reader.take_u32()? as usize;
    let mut keys = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        keys.push(reader.take_len_prefixed()?.to_vec());
    }
    Ok(keys)
}

/// One link of the shuffle chain:
/// `[u32 base_len][base][u32 keys_len][keys][u32 proof_len][proof]`,
/// where `keys` is the concatenation of fixed-width point encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleFrame {
    /// Canonical encoding of the shuffle base.
    pub base: Vec<u8>,
    /// Canonical encodings of the (re-encrypted) ephemeral keys.
    pub keys: Vec<Vec<u8>>,
    /// Shuffle proof; empty on requests and on the chain's initial state.
    pub proof: Vec<u8>,
}

impl ShuffleFrame {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        put_len_prefixed(&mut frame, &self.base);
        let concatenated: Vec<u8> = self.keys.iter().flatten().copied().collect();
        put_len_prefixed(&mut frame, &concatenated);
        put_len_prefixed(&mut frame, &self.proof);
        frame
    }

    fn read(reader: &mut FrameReader<'_>, element_len: usize) -> Result<Self> {
        let base = reader.take_len_prefixed()?.to_vec();
        let concatenated = reader.take_len_prefixed()?;
        if element_len == 0 || concatenated.len() % element_len != 0 {
            Err(CallerError::DeserializationFailed)?;
        }
        let keys = concatenated
            .chunks_exact(element_len)
            .map(|chunk| chunk.to_vec())
            .collect();
        let proof = reader.take_len_prefixed()?.to_vec();
        Ok(Self { base, keys, proof })
    }

    /// Parse from wire bytes. The suite's fixed element width is needed to
    /// split the concatenated key encodings.
    pub fn decode(bytes: &[u8], element_len: usize) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let frame = Self::read(&mut reader, element_len)?;
        reader.finish()?;
        Ok(frame)
    }
}

/// The full shuffle chain the relay broadcasts: the initial state followed
/// by every trustee's link, `[u32 n_steps]` then `n_steps + 1` shuffle
/// frames (the initial state first, with an empty proof).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleFrame {
    /// The pre-shuffle state `(g, [E_1 .. E_N])`.
    pub initial: ShuffleFrame,
    /// One link per trustee, in shuffle order.
    pub steps: Vec<ShuffleFrame>,
}

impl ScheduleFrame {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = (self.steps.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&self.initial.encode());
        for step in &self.steps {
            frame.extend_from_slice(&step.encode());
        }
        frame
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8], element_len: usize) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let n_steps = reader.take_u32()? as usize;
        let initial = ShuffleFrame::read(&mut reader, element_len)?;
        let mut steps = Vec::with_capacity(n_steps.min(1024));
        for _ in 0..n_steps {
            steps.push(ShuffleFrame::read(&mut reader, element_len)?);
        }
        reader.finish()?;
        Ok(Self { initial, steps })
    }

    /// The final shuffled state.
    pub fn last(&self) -> &ShuffleFrame {
        self.steps.last().unwrap_or(&self.initial)
    }
}

/// A per-round contribution:
/// `[u32 round][u32 payload_len][cell][u32 kappa_len][kappa]`.
/// Trustees send `kappa_len = 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellFrame {
    /// The round this cell belongs to.
    pub round: u32,
    /// The pseudorandom cell.
    pub cell: Vec<u8>,
    /// The sender's kappa scalar; empty for trustees.
    pub kappa: Vec<u8>,
}

impl CellFrame {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = self.round.to_be_bytes().to_vec();
        put_len_prefixed(&mut frame, &self.cell);
        put_len_prefixed(&mut frame, &self.kappa);
        frame
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let round = reader.take_u32()?;
        let cell = reader.take_len_prefixed()?.to_vec();
        let kappa = reader.take_len_prefixed()?.to_vec();
        reader.finish()?;
        Ok(Self { round, cell, kappa })
    }
}

/// Round-start beacon: `[u32 round][u32 open_slot]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconFrame {
    /// The round being started.
    pub round: u32,
    /// The schedule position whose owner may speak this round.
    pub open_slot: u32,
}

impl BeaconFrame {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = self.round.to_be_bytes().to_vec();
        frame.extend_from_slice(&self.open_slot.to_be_bytes());
        frame
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let round = reader.take_u32()?;
        let open_slot = reader.take_u32()?;
        reader.finish()?;
        Ok(Self { round, open_slot })
    }
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundOutcome {
    /// The slot owner's payload was recovered and authenticated.
    Decoded,
    /// The payload failed authentication; it was discarded.
    Disrupted,
    /// A contribution was missing at the deadline.
    Lost,
}

impl RoundOutcome {
    fn to_byte(self) -> u8 {
        match self {
            RoundOutcome::Decoded => 0,
            RoundOutcome::Disrupted => 1,
            RoundOutcome::Lost => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(RoundOutcome::Decoded),
            1 => Ok(RoundOutcome::Disrupted),
            2 => Ok(RoundOutcome::Lost),
            _ => Err(CallerError::DeserializationFailed)?,
        }
    }
}

/// Round result broadcast: `[u32 round][u8 outcome][payload]`.
///
/// These bytes are also the round transcript fed into the history update,
/// so every participant must observe them identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFrame {
    /// The round being resolved.
    pub round: u32,
    /// How the round ended.
    pub outcome: RoundOutcome,
    /// The decoded payload; empty unless `outcome` is `Decoded`.
    pub payload: Vec<u8>,
}

impl ResultFrame {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = self.round.to_be_bytes().to_vec();
        frame.push(self.outcome.to_byte());
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let round = reader.take_u32()?;
        let outcome = RoundOutcome::from_byte(reader.take_u8()?)?;
        let payload = reader.take_bytes(bytes.len() - 5)?.to_vec();
        reader.finish()?;
        Ok(Self {
            round,
            outcome,
            payload,
        })
    }
}

/// Trustee sigma announcement: `[u32 len][sigma]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigmaFrame {
    /// Canonical encoding of the trustee's sigma scalar.
    pub sigma: Vec<u8>,
}

impl SigmaFrame {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        put_len_prefixed(&mut frame, &self.sigma);
        frame
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(bytes);
        let sigma = reader.take_len_prefixed()?.to_vec();
        reader.finish()?;
        Ok(Self { sigma })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_envelope_round_trips() {
        use crate::protocol::Role;
        let mut rng = crate::utils::testing::init_testing();
        let message = Message::new(
            MessageType::Round(RoundMessageType::Beacon),
            SessionId::random(&mut rng),
            PeerId::relay(),
            PeerId::new(Role::Client, 1),
            vec![0, 0, 0, 7, 0, 0, 0, 1],
        );
        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.message_type(), message.message_type());
        assert_eq!(decoded.session_id(), message.session_id());
        assert_eq!(decoded.from(), message.from());
        assert_eq!(decoded.to(), message.to());
        assert_eq!(decoded.unverified_bytes, message.unverified_bytes);
    }

    #[test]
    fn key_announcement_round_trips() {
        let announcement = KeyAnnouncement {
            version: 1,
            key: vec![0xab; 64],
        };
        let decoded = KeyAnnouncement::decode(&announcement.encode()).unwrap();
        assert_eq!(announcement, decoded);
    }

    #[test]
    fn handshake_round_trips_and_is_fixed_width() {
        let handshake = Handshake {
            version: 1,
            cell_size: 20,
            n_clients: 2,
            n_trustees: 1,
            own_index: 0,
        };
        let bytes = handshake.encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(Handshake::decode(&bytes).unwrap(), handshake);
        assert!(Handshake::decode(&bytes[..19]).is_err());
    }

    #[test]
    fn shuffle_frame_round_trips() {
        let frame = ShuffleFrame {
            base: vec![1; 64],
            keys: vec![vec![2; 64], vec![3; 64]],
            proof: vec![9; 50],
        };
        let decoded = ShuffleFrame::decode(&frame.encode(), 64).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn shuffle_frame_rejects_misaligned_keys() {
        let frame = ShuffleFrame {
            base: vec![1; 64],
            keys: vec![vec![2; 64]],
            proof: vec![],
        };
        // Parsing with the wrong element width must fail rather than split
        // keys at the wrong boundary.
        assert!(ShuffleFrame::decode(&frame.encode(), 48).is_err());
    }

    #[test]
    fn schedule_frame_round_trips() {
        let initial = ShuffleFrame {
            base: vec![4; 32],
            keys: vec![vec![5; 32], vec![6; 32]],
            proof: vec![],
        };
        let step = ShuffleFrame {
            base: vec![7; 32],
            keys: vec![vec![8; 32], vec![9; 32]],
            proof: vec![0xaa; 96],
        };
        let schedule = ScheduleFrame {
            initial,
            steps: vec![step],
        };
        let decoded = ScheduleFrame::decode(&schedule.encode(), 32).unwrap();
        assert_eq!(schedule, decoded);
        assert_eq!(decoded.last(), &schedule.steps[0]);
    }

    #[test]
    fn cell_frame_round_trips() {
        let frame = CellFrame {
            round: 7,
            cell: vec![0xde, 0xad, 0xbe, 0xef],
            kappa: vec![0x42; 64],
        };
        assert_eq!(CellFrame::decode(&frame.encode()).unwrap(), frame);

        let trustee_frame = CellFrame {
            round: 7,
            cell: vec![0x11; 4],
            kappa: vec![],
        };
        assert_eq!(
            CellFrame::decode(&trustee_frame.encode()).unwrap(),
            trustee_frame
        );
    }

    #[test]
    fn result_frame_round_trips() {
        for outcome in [
            RoundOutcome::Decoded,
            RoundOutcome::Disrupted,
            RoundOutcome::Lost,
        ] {
            let frame = ResultFrame {
                round: 3,
                outcome,
                payload: vec![1, 2, 3, 4],
            };
            assert_eq!(ResultFrame::decode(&frame.encode()).unwrap(), frame);
        }
        // Unknown outcome bytes are rejected.
        assert!(ResultFrame::decode(&[0, 0, 0, 1, 9]).is_err());
    }
}

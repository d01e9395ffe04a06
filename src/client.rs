//! The client participant.
//!
//! A client announces its long-term key, derives one shared secret per
//! trustee, submits an ephemeral key for the shuffle, locates its slot in
//! the broadcast schedule, and then contributes one cell (and one kappa
//! scalar) per round. When the open slot is its own, the next queued
//! payload rides along, wrapped by the equivocation guard.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    cell::CellCodec,
    equivocation::EquivocationGuard,
    errors::{CallerError, InternalError, Result},
    messages::{
        BeaconFrame, CellFrame, KeyAnnouncement, Message, MessageType, ResultFrame, RoundMessageType,
        RoundOutcome, ScheduleFrame, SessionParamsFrame, SetupMessageType, ShuffleFrame,
        ShuffleMessageType,
    },
    participant::{ProcessOutcome, ProtocolParticipant, Status},
    protocol::{PeerId, SessionConfig, SessionId, PROTOCOL_VERSION},
    shuffle::{self, ShuffleState},
    suite::{ElementOps, ScalarOps, Suite},
};
use rand::{CryptoRng, RngCore};
use std::collections::VecDeque;
use tracing::{error, info, instrument, warn};

/// Construction input for a client: its long-term keypair.
#[derive(Clone)]
pub struct ClientInput<S: Suite> {
    keypair: (S::Scalar, S::Element),
}

// Custom Debug to avoid leaking the private key.
impl<S: Suite> std::fmt::Debug for ClientInput<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInput")
            .field("public", &self.keypair.1)
            .field("private", &"[redacted]")
            .finish()
    }
}

impl<S: Suite> ClientInput<S> {
    /// Wrap an externally persisted long-term keypair.
    pub fn new(private: S::Scalar, public: S::Element) -> Self {
        Self {
            keypair: (private, public),
        }
    }

    /// Generate a fresh identity, for deployments that do not persist one.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let (private, public) = S::keypair(rng);
        Self::new(private, public)
    }
}

/// The client's setup progress, mirroring its protocol states.
enum ClientState<S: Suite> {
    /// Waiting for the kick-off to contact the relay.
    Connect,
    /// Key announced; waiting for the session parameters.
    AwaitParams,
    /// Secrets derived, ephemeral key submitted; waiting for the schedule.
    AwaitSchedule {
        codec: CellCodec,
        sigma: S::Scalar,
        ephemeral_private: S::Scalar,
    },
    /// Setup complete; processing rounds.
    Round {
        codec: CellCodec,
        sigma: S::Scalar,
        /// The schedule position this client owns.
        slot: u32,
        /// The round currently expected from the relay.
        round: u32,
    },
    /// The session ended.
    Terminated,
}

// Custom Debug: the ephemeral private key held while awaiting the
// schedule must not reach a log line.
impl<S: Suite> std::fmt::Debug for ClientState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Connect => write!(f, "Connect"),
            ClientState::AwaitParams => write!(f, "AwaitParams"),
            ClientState::AwaitSchedule { .. } => write!(f, "AwaitSchedule"),
            ClientState::Round { slot, round, .. } => f
                .debug_struct("Round")
                .field("slot", slot)
                .field("round", round)
                .finish(),
            ClientState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// A [`ProtocolParticipant`] playing the client role.
#[derive(Debug)]
pub struct ClientParticipant<S: Suite> {
    session_id: SessionId,
    id: PeerId,
    config: SessionConfig,
    input: ClientInput<S>,
    state: ClientState<S>,
    guard: EquivocationGuard<S>,
    outgoing: VecDeque<Vec<u8>>,
}

impl<S: Suite> ClientParticipant<S> {
    /// The kick-off message to seed this client's inbox with.
    pub fn initialize_message(&self) -> Message {
        Message::new(
            MessageType::Setup(SetupMessageType::Ready),
            self.session_id,
            self.id,
            self.id,
            Vec::new(),
        )
    }

    /// Queue a payload to broadcast the next time this client owns the
    /// open slot. Must be exactly the session's payload length.
    pub fn queue_payload(&mut self, payload: Vec<u8>) -> Result<()> {
        if payload.len() != self.config.payload_len() as usize {
            Err(CallerError::BadInput)?;
        }
        self.outgoing.push_back(payload);
        Ok(())
    }

    /// Canonical bytes of the current history scalar, for cross-checking
    /// transcript agreement.
    pub fn history_bytes(&self) -> Vec<u8> {
        self.guard.history_bytes()
    }

    fn relay(&self) -> PeerId {
        PeerId::relay()
    }

    fn message_to_relay(&self, message_type: MessageType, frame: Vec<u8>) -> Message {
        Message::new(message_type, self.session_id, self.id, self.relay(), frame)
    }

    /// Open the conversation: announce our long-term public key.
    fn handle_ready(&mut self) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, ClientState::Connect) {
            return Err(InternalError::ProtocolError(Some(self.id)));
        }
        let announcement = KeyAnnouncement {
            version: PROTOCOL_VERSION,
            key: self.input.keypair.1.to_bytes(),
        };
        self.state = ClientState::AwaitParams;
        Ok(ProcessOutcome::Processed(vec![self.message_to_relay(
            MessageType::Setup(SetupMessageType::ClientHello),
            announcement.encode(),
        )]))
    }

    /// Receive the session parameters and the trustee roster; derive the
    /// pairwise secrets and submit our ephemeral key.
    fn handle_session_params<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, ClientState::AwaitParams) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        let frame = SessionParamsFrame::decode(&message.unverified_bytes)?;
        if frame.handshake.version != PROTOCOL_VERSION {
            return Err(InternalError::VersionMismatch {
                theirs: frame.handshake.version,
                ours: PROTOCOL_VERSION,
            });
        }
        if frame.handshake.n_clients != self.config.n_clients()
            || frame.handshake.n_trustees != self.config.n_trustees()
            || frame.handshake.cell_size as usize != self.config.cell_len()
            || frame.handshake.own_index != self.id.index()
            || frame.trustee_keys.len() != self.config.n_trustees() as usize
        {
            error!("relay announced session parameters we were not configured for");
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        // One shared secret per trustee; invariant: the trustee derives the
        // same element from our announced key.
        let mut secrets = Vec::with_capacity(frame.trustee_keys.len());
        for key in &frame.trustee_keys {
            let trustee_public =
                S::Element::try_from_bytes(key).map_err(|_| InternalError::UnmarshalFailed)?;
            secrets.push(S::shared_secret(&self.input.keypair.0, &trustee_public));
        }

        let codec = CellCodec::setup::<S>(&secrets, self.config.cell_len());
        let sigma = EquivocationGuard::<S>::sigma(&secrets);

        let (ephemeral_private, ephemeral_public) = S::keypair(rng);
        let announcement = KeyAnnouncement {
            version: PROTOCOL_VERSION,
            key: ephemeral_public.to_bytes(),
        };

        info!("derived {} pairwise secrets", secrets.len());
        self.state = ClientState::AwaitSchedule {
            codec,
            sigma,
            ephemeral_private,
        };
        Ok(ProcessOutcome::Processed(vec![self.message_to_relay(
            MessageType::Shuffle(ShuffleMessageType::EphemeralKey),
            announcement.encode(),
        )]))
    }

    /// Receive the shuffle chain, verify every link, and locate our slot.
    fn handle_schedule(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, ClientState::AwaitSchedule { .. }) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        // Any failure from here on is fatal to the session, so the state
        // moves to `Terminated` up front and only a full success replaces
        // it with `Round`.
        let ClientState::AwaitSchedule {
            codec,
            sigma,
            ephemeral_private,
        } = std::mem::replace(&mut self.state, ClientState::Terminated)
        else {
            return Err(InternalError::InternalInvariantFailed);
        };

        let frame = ScheduleFrame::decode(&message.unverified_bytes, S::element_len())?;
        let initial = decode_state::<S>(&frame.initial)?;
        let steps = frame
            .steps
            .iter()
            .map(|step| Ok((decode_state::<S>(step)?, step.proof.clone())))
            .collect::<Result<Vec<_>>>()?;

        if !shuffle::verify_chain(&initial, &steps) {
            error!("shuffle chain failed verification; aborting setup");
            return Err(InternalError::ShuffleProofInvalid);
        }

        let last = &steps
            .last()
            .ok_or(InternalError::ShuffleProofInvalid)?
            .0;
        let Some(slot) = shuffle::find_slot(last, &ephemeral_private) else {
            error!("no unique slot in the shuffled schedule");
            return Err(InternalError::ProtocolError(Some(message.from())));
        };

        info!(slot, "schedule verified");
        self.state = ClientState::Round {
            codec,
            sigma,
            slot: slot as u32,
            round: 0,
        };
        Ok(ProcessOutcome::Incomplete)
    }

    /// Contribute our cell and kappa for the beaconed round.
    fn handle_beacon<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<ResultFrame>> {
        let beacon = BeaconFrame::decode(&message.unverified_bytes)?;
        let ClientState::Round {
            codec,
            sigma,
            slot,
            round,
        } = &self.state
        else {
            return Err(InternalError::ProtocolError(Some(message.from())));
        };
        if beacon.round != *round {
            error!(
                expected = *round,
                got = beacon.round,
                "beacon for an unexpected round"
            );
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        let is_owner = beacon.open_slot == *slot && self.config.payload_len() > 0;
        let payload = if is_owner {
            // Nothing queued means an all-zero payload; the slot stays
            // indistinguishable from silence to everyone but us.
            Some(
                self.outgoing
                    .pop_front()
                    .unwrap_or_else(|| vec![0u8; self.config.payload_len() as usize]),
            )
        } else {
            None
        };

        let (wrapped, kappa) = self
            .guard
            .client_contribution(rng, payload.as_deref(), sigma)?;
        let cell = codec.encode_with_payload(beacon.round, wrapped.as_deref())?;

        let frame = CellFrame {
            round: beacon.round,
            cell,
            kappa: kappa.to_bytes(),
        };
        Ok(ProcessOutcome::Processed(vec![self.message_to_relay(
            MessageType::Round(RoundMessageType::ClientCell),
            frame.encode(),
        )]))
    }

    /// Observe a round result: fold it into the history and surface it.
    fn handle_result(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        let frame = ResultFrame::decode(&message.unverified_bytes)?;
        let ClientState::Round { round, .. } = &mut self.state else {
            return Err(InternalError::ProtocolError(Some(message.from())));
        };
        if frame.round != *round {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        // Lost rounds leave the history untouched; everything else binds
        // the broadcast transcript into the chain.
        if frame.outcome != RoundOutcome::Lost {
            self.guard.update_history(&message.unverified_bytes);
        } else {
            warn!(round = frame.round, "round lost");
        }
        *round += 1;

        Ok(ProcessOutcome::Output(frame, Vec::new()))
    }
}

/// Decode a shuffle wire frame into group elements.
fn decode_state<S: Suite>(frame: &ShuffleFrame) -> Result<ShuffleState<S>> {
    let base =
        S::Element::try_from_bytes(&frame.base).map_err(|_| InternalError::UnmarshalFailed)?;
    let keys = frame
        .keys
        .iter()
        .map(|key| S::Element::try_from_bytes(key).map_err(|_| InternalError::UnmarshalFailed))
        .collect::<Result<Vec<_>>>()?;
    Ok(ShuffleState { base, keys })
}

impl<S: Suite> ProtocolParticipant for ClientParticipant<S> {
    type Input = ClientInput<S>;
    type Output = ResultFrame;

    fn new(
        session_id: SessionId,
        id: PeerId,
        config: SessionConfig,
        input: Self::Input,
    ) -> Result<Self> {
        if id.role() != crate::protocol::Role::Client || id.index() >= config.n_clients() {
            Err(CallerError::BadInput)?;
        }
        Ok(Self {
            session_id,
            id,
            config,
            input,
            state: ClientState::Connect,
            guard: EquivocationGuard::new(),
            outgoing: VecDeque::new(),
        })
    }

    fn id(&self) -> PeerId {
        self.id
    }

    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn status(&self) -> Status {
        match self.state {
            ClientState::Round { .. } => Status::Ready,
            ClientState::Terminated => Status::Terminated,
            _ => Status::AwaitingSetup,
        }
    }

    #[instrument(skip_all, fields(id = %self.id))]
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>> {
        if matches!(self.state, ClientState::Terminated) {
            Err(CallerError::ProtocolAlreadyTerminated)?;
        }
        if message.session_id() != self.session_id || message.to() != self.id {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        match message.message_type() {
            MessageType::Setup(SetupMessageType::Ready) => self.handle_ready(),
            MessageType::Setup(SetupMessageType::SessionParams) => {
                self.handle_session_params(rng, message)
            }
            MessageType::Shuffle(ShuffleMessageType::Schedule) => self.handle_schedule(message),
            MessageType::Round(RoundMessageType::Beacon) => self.handle_beacon(rng, message),
            MessageType::Round(RoundMessageType::Result) => self.handle_result(message),
            message_type => {
                error!("invalid message type sent to a client: {:?}", message_type);
                Err(InternalError::ProtocolError(Some(message.from())))
            }
        }
    }
}

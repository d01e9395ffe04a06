//! The trustee participant.
//!
//! A trustee announces its long-term key, derives one shared secret per
//! client from the roster the relay forwards, sends its equivocation sigma,
//! performs its link of the ephemeral-key shuffle when the relay hands it
//! the running state, and then emits one cancelling cell per round.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    cell::CellCodec,
    equivocation::EquivocationGuard,
    errors::{CallerError, InternalError, Result},
    messages::{
        BeaconFrame, CellFrame, KeyAnnouncement, KeyVector, Message, MessageType, ResultFrame,
        RoundMessageType, RoundOutcome, SessionParamsFrame, SetupMessageType, ShuffleFrame,
        ShuffleMessageType, SigmaFrame,
    },
    participant::{ProcessOutcome, ProtocolParticipant, Status},
    protocol::{PeerId, SessionConfig, SessionId, PROTOCOL_VERSION},
    shuffle::{self, ShuffleState},
    suite::{ElementOps, ScalarOps, Suite},
};
use rand::{CryptoRng, RngCore};
use tracing::{error, info, instrument, warn};

/// Construction input for a trustee: its long-term keypair.
#[derive(Clone)]
pub struct TrusteeInput<S: Suite> {
    keypair: (S::Scalar, S::Element),
}

// Custom Debug to avoid leaking the private key.
impl<S: Suite> std::fmt::Debug for TrusteeInput<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrusteeInput")
            .field("public", &self.keypair.1)
            .field("private", &"[redacted]")
            .finish()
    }
}

impl<S: Suite> TrusteeInput<S> {
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

/// The trustee's setup progress, mirroring its protocol states.
#[derive(Debug)]
enum TrusteeState {
    /// Waiting for the kick-off to contact the relay.
    Connect,
    /// Key announced; waiting for the session parameters.
    AwaitParams,
    /// Parameters checked; waiting for the client roster.
    AwaitRoster,
    /// Secrets derived; waiting for the shuffle state to transform.
    AwaitShuffleBase { codec: CellCodec },
    /// Shuffle performed; processing rounds.
    Round { codec: CellCodec, round: u32 },
    /// The session ended.
    Terminated,
}

/// A [`ProtocolParticipant`] playing the trustee role.
#[derive(Debug)]
pub struct TrusteeParticipant<S: Suite> {
    session_id: SessionId,
    id: PeerId,
    config: SessionConfig,
    input: TrusteeInput<S>,
    state: TrusteeState,
    guard: EquivocationGuard<S>,
}

impl<S: Suite> TrusteeParticipant<S> {
    /// The kick-off message to seed this trustee's inbox with.
    pub fn initialize_message(&self) -> Message {
        Message::new(
            MessageType::Setup(SetupMessageType::Ready),
            self.session_id,
            self.id,
            self.id,
            Vec::new(),
        )
    }

    /// Canonical bytes of the current history scalar, for cross-checking
    /// transcript agreement.
    pub fn history_bytes(&self) -> Vec<u8> {
        self.guard.history_bytes()
    }

    fn message_to_relay(&self, message_type: MessageType, frame: Vec<u8>) -> Message {
        Message::new(
            message_type,
            self.session_id,
            self.id,
            PeerId::relay(),
            frame,
        )
    }

    /// Open the conversation: announce our long-term public key.
    fn handle_ready(&mut self) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, TrusteeState::Connect) {
            return Err(InternalError::ProtocolError(Some(self.id)));
        }
        let announcement = KeyAnnouncement {
            version: PROTOCOL_VERSION,
            key: self.input.keypair.1.to_bytes(),
        };
        self.state = TrusteeState::AwaitParams;
        Ok(ProcessOutcome::Processed(vec![self.message_to_relay(
            MessageType::Setup(SetupMessageType::TrusteeKey),
            announcement.encode(),
        )]))
    }

    /// Check the session parameters against our configuration.
    fn handle_session_params(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, TrusteeState::AwaitParams) {
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
        {
            error!("relay announced session parameters we were not configured for");
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        self.state = TrusteeState::AwaitRoster;
        Ok(ProcessOutcome::Incomplete)
    }

    /// Derive the pairwise secret table from the client roster and send
    /// our equivocation sigma.
    fn handle_roster(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, TrusteeState::AwaitRoster) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        let roster = KeyVector::decode(&message.unverified_bytes)?;
        if roster.keys.len() != self.config.n_clients() as usize {
            error!(
                expected = self.config.n_clients(),
                got = roster.keys.len(),
                "client roster has the wrong size"
            );
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        let mut secrets = Vec::with_capacity(roster.keys.len());
        for key in &roster.keys {
            let client_public =
                S::Element::try_from_bytes(key).map_err(|_| InternalError::UnmarshalFailed)?;
            secrets.push(S::shared_secret(&self.input.keypair.0, &client_public));
        }

        let codec = CellCodec::setup::<S>(&secrets, self.config.cell_len());
        let sigma = EquivocationGuard::<S>::sigma(&secrets);

        info!("derived {} pairwise secrets", secrets.len());
        self.state = TrusteeState::AwaitShuffleBase { codec };
        let frame = SigmaFrame {
            sigma: sigma.to_bytes(),
        };
        Ok(ProcessOutcome::Processed(vec![self.message_to_relay(
            MessageType::Setup(SetupMessageType::SigmaContribution),
            frame.encode(),
        )]))
    }

    /// Perform our link of the shuffle and return it to the relay.
    fn handle_shuffle_request<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, TrusteeState::AwaitShuffleBase { .. }) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        // Failures past this point are fatal; only success restores a
        // usable state.
        let TrusteeState::AwaitShuffleBase { codec } =
            std::mem::replace(&mut self.state, TrusteeState::Terminated)
        else {
            return Err(InternalError::InternalInvariantFailed);
        };

        let frame = ShuffleFrame::decode(&message.unverified_bytes, S::element_len())?;
        let base =
            S::Element::try_from_bytes(&frame.base).map_err(|_| InternalError::UnmarshalFailed)?;
        let keys = frame
            .keys
            .iter()
            .map(|key| S::Element::try_from_bytes(key).map_err(|_| InternalError::UnmarshalFailed))
            .collect::<Result<Vec<_>>>()?;

        let input = ShuffleState::<S> { base, keys };
        let (output, proof) = shuffle::shuffle(rng, &input)?;

        let reply = ShuffleFrame {
            base: output.base.to_bytes(),
            keys: output.keys.iter().map(ElementOps::to_bytes).collect(),
            proof,
        };

        info!("shuffled {} ephemeral keys", output.keys.len());
        self.state = TrusteeState::Round { codec, round: 0 };
        Ok(ProcessOutcome::Processed(vec![self.message_to_relay(
            MessageType::Shuffle(ShuffleMessageType::Reply),
            reply.encode(),
        )]))
    }

    /// Contribute our cancelling cell for the beaconed round.
    fn handle_beacon(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        let beacon = BeaconFrame::decode(&message.unverified_bytes)?;
        let TrusteeState::Round { codec, round } = &self.state else {
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

        let frame = CellFrame {
            round: beacon.round,
            cell: codec.encode(beacon.round),
            // Trustees carry no kappa; their sigma went to the relay once
            // at setup.
            kappa: Vec::new(),
        };
        Ok(ProcessOutcome::Processed(vec![self.message_to_relay(
            MessageType::Round(RoundMessageType::TrusteeCell),
            frame.encode(),
        )]))
    }

    /// Observe a round result: fold it into the history and surface it.
    fn handle_result(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        let frame = ResultFrame::decode(&message.unverified_bytes)?;
        let TrusteeState::Round { round, .. } = &mut self.state else {
            return Err(InternalError::ProtocolError(Some(message.from())));
        };
        if frame.round != *round {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        if frame.outcome != RoundOutcome::Lost {
            self.guard.update_history(&message.unverified_bytes);
        } else {
            warn!(round = frame.round, "round lost");
        }
        *round += 1;

        Ok(ProcessOutcome::Output(frame, Vec::new()))
    }
}

impl<S: Suite> ProtocolParticipant for TrusteeParticipant<S> {
    type Input = TrusteeInput<S>;
    type Output = ResultFrame;

    fn new(
        session_id: SessionId,
        id: PeerId,
        config: SessionConfig,
        input: Self::Input,
    ) -> Result<Self> {
        if id.role() != crate::protocol::Role::Trustee || id.index() >= config.n_trustees() {
            Err(CallerError::BadInput)?;
        }
        Ok(Self {
            session_id,
            id,
            config,
            input,
            state: TrusteeState::Connect,
            guard: EquivocationGuard::new(),
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
            TrusteeState::Round { .. } => Status::Ready,
            TrusteeState::Terminated => Status::Terminated,
            _ => Status::AwaitingSetup,
        }
    }

    #[instrument(skip_all, fields(id = %self.id))]
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>> {
        if matches!(self.state, TrusteeState::Terminated) {
            Err(CallerError::ProtocolAlreadyTerminated)?;
        }
        if message.session_id() != self.session_id || message.to() != self.id {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        match message.message_type() {
            MessageType::Setup(SetupMessageType::Ready) => self.handle_ready(),
            MessageType::Setup(SetupMessageType::SessionParams) => {
                self.handle_session_params(message)
            }
            MessageType::Setup(SetupMessageType::ClientRoster) => self.handle_roster(message),
            MessageType::Shuffle(ShuffleMessageType::Request) => {
                self.handle_shuffle_request(rng, message)
            }
            MessageType::Round(RoundMessageType::Beacon) => self.handle_beacon(message),
            MessageType::Round(RoundMessageType::Result) => self.handle_result(message),
            message_type => {
                error!("invalid message type sent to a trustee: {:?}", message_type);
                Err(InternalError::ProtocolError(Some(message.from())))
            }
        }
    }
}

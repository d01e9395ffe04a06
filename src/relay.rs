//! The relay participant.
//!
//! The relay is the hub of the star: it aggregates the trustees' and
//! clients' long-term keys, hands each connecting peer its session
//! parameters, chains the trustee shuffle, and then drives rounds. Per
//! round it broadcasts a beacon, collects exactly one contribution from
//! every client and trustee, XOR-decodes the open slot, unwraps the
//! owner's payload through the equivocation guard, and broadcasts the
//! outcome.
//!
//! The relay learns nothing about slot ownership: the schedule it
//! broadcasts is the trustees' shuffled output, and the decoded payload
//! carries no sender information.
//!
//! Errors attributed to a peer during a round leave the round incomplete;
//! the caller decides whether to drop the offender and lets the round
//! deadline (see [`handle_deadline`][RelayParticipant::handle_deadline])
//! declare the round lost. Errors during setup are fatal to the session.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    cell,
    equivocation::EquivocationGuard,
    errors::{CallerError, InternalError, Result},
    local_storage::{LocalStorage, TypeTag},
    messages::{
        BeaconFrame, CellFrame, KeyAnnouncement, KeyVector, Message, MessageType, ResultFrame,
        RoundMessageType, RoundOutcome, ScheduleFrame, SessionParamsFrame, SetupMessageType,
        ShuffleFrame, ShuffleMessageType, SigmaFrame, Handshake,
    },
    participant::{ProcessOutcome, ProtocolParticipant, Status},
    protocol::{PeerId, Role, SessionConfig, SessionId, PROTOCOL_VERSION},
    shuffle::{self, ShuffleState},
    suite::{ElementOps, ScalarOps, Suite},
};
use rand::{CryptoRng, RngCore};
use std::marker::PhantomData;
use tracing::{error, info, instrument, warn};

mod storage {
    use super::*;

    pub(super) struct TrusteeKeyBytes;
    impl TypeTag for TrusteeKeyBytes {
        type Value = Vec<u8>;
    }
    pub(super) struct ClientKeyBytes;
    impl TypeTag for ClientKeyBytes {
        type Value = Vec<u8>;
    }
    pub(super) struct EphemeralKey<S: Suite> {
        _s: PhantomData<S>,
    }
    impl<S: Suite> TypeTag for EphemeralKey<S> {
        type Value = S::Element;
    }
    pub(super) struct TrusteeSigma<S: Suite> {
        _s: PhantomData<S>,
    }
    impl<S: Suite> TypeTag for TrusteeSigma<S> {
        type Value = S::Scalar;
    }
    pub(super) struct RoundCell;
    impl TypeTag for RoundCell {
        type Value = Vec<u8>;
    }
    pub(super) struct RoundKappa<S: Suite> {
        _s: PhantomData<S>,
    }
    impl<S: Suite> TypeTag for RoundKappa<S> {
        type Value = S::Scalar;
    }
}

/// The relay's protocol phase.
#[derive(Debug)]
enum RelayState<S: Suite> {
    /// Collecting trustee key announcements.
    AwaitTrustees,
    /// Collecting client hellos and ephemeral keys.
    AwaitClients,
    /// Chaining the shuffle through the trustees.
    RunShuffle {
        initial: ShuffleState<S>,
        chain: Vec<(ShuffleState<S>, Vec<u8>)>,
        /// The trustee currently holding the running state.
        next: u32,
    },
    /// Schedule broadcast; waiting for the last sigma contributions.
    AwaitSigmas,
    /// Driving rounds.
    Round { round: u32 },
    /// The session ended.
    Terminated,
}

/// A [`ProtocolParticipant`] playing the relay role.
#[derive(Debug)]
pub struct RelayParticipant<S: Suite> {
    session_id: SessionId,
    id: PeerId,
    config: SessionConfig,
    state: RelayState<S>,
    guard: EquivocationGuard<S>,
    storage: LocalStorage,
}

impl<S: Suite> RelayParticipant<S> {
    /// Canonical bytes of the current history scalar, for cross-checking
    /// transcript agreement.
    pub fn history_bytes(&self) -> Vec<u8> {
        self.guard.history_bytes()
    }

    /// The round currently being collected, if rounds have started.
    pub fn current_round(&self) -> Option<u32> {
        match self.state {
            RelayState::Round { round } => Some(round),
            _ => None,
        }
    }

    fn message_to(&self, to: PeerId, message_type: MessageType, frame: Vec<u8>) -> Message {
        Message::new(message_type, self.session_id, self.id, to, frame)
    }

    fn broadcast(&self, message_type: MessageType, frame: &[u8]) -> Vec<Message> {
        self.config
            .peer_ids()
            .into_iter()
            .map(|peer| self.message_to(peer, message_type, frame.to_vec()))
            .collect()
    }

    fn session_params_for(&self, peer: PeerId) -> Result<Message> {
        // Clients get the trustee roster along with the numbers; trustees
        // receive the roster they need (the client keys) separately once
        // it is complete.
        let trustee_keys = match peer.role() {
            Role::Client => self
                .config
                .trustee_ids()
                .iter()
                .map(|id| self.storage.retrieve::<storage::TrusteeKeyBytes>(*id).cloned())
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        let frame = SessionParamsFrame {
            handshake: Handshake {
                version: PROTOCOL_VERSION,
                cell_size: self.config.cell_len() as u32,
                n_clients: self.config.n_clients(),
                n_trustees: self.config.n_trustees(),
                own_index: peer.index(),
            },
            trustee_keys,
        };
        Ok(self.message_to(
            peer,
            MessageType::Setup(SetupMessageType::SessionParams),
            frame.encode(),
        ))
    }

    /// Validate and parse an announcement, checking the protocol version.
    fn check_announcement(&self, message: &Message) -> Result<KeyAnnouncement> {
        let announcement = KeyAnnouncement::decode(&message.unverified_bytes)?;
        if announcement.version != PROTOCOL_VERSION {
            warn!(
                peer = %message.from(),
                theirs = announcement.version,
                "closing connection: protocol version mismatch"
            );
            return Err(InternalError::VersionMismatch {
                theirs: announcement.version,
                ours: PROTOCOL_VERSION,
            });
        }
        // Keys are forwarded verbatim, but a key that does not decode as a
        // group element would poison every derived secret; reject it at
        // the door and attribute it to the announcer.
        S::Element::try_from_bytes(&announcement.key)
            .map_err(|_| InternalError::UnmarshalFailed)?;
        Ok(announcement)
    }

    /// Handle a trustee's long-term key announcement.
    fn handle_trustee_key(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, RelayState::AwaitTrustees) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        let from = message.from();
        if from.role() != Role::Trustee || from.index() >= self.config.n_trustees() {
            return Err(InternalError::ProtocolError(Some(from)));
        }

        let announcement = self.check_announcement(message)?;
        self.storage
            .store_once::<storage::TrusteeKeyBytes>(from, announcement.key)?;

        let mut replies = vec![self.session_params_for(from)?];

        if self
            .storage
            .contains_for_all_ids::<storage::TrusteeKeyBytes>(&self.config.trustee_ids())
        {
            info!("all trustee keys announced");
            self.state = RelayState::AwaitClients;
            // Clients that said hello early have been waiting for the
            // trustee roster to fill in.
            for client in self.config.client_ids() {
                if self.storage.contains::<storage::ClientKeyBytes>(client) {
                    replies.push(self.session_params_for(client)?);
                }
            }
            replies.extend(self.roster_messages_if_complete()?);
        }

        Ok(ProcessOutcome::Processed(replies))
    }

    /// Handle a client's hello.
    fn handle_client_hello(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(
            self.state,
            RelayState::AwaitTrustees | RelayState::AwaitClients
        ) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        let from = message.from();
        if from.role() != Role::Client || from.index() >= self.config.n_clients() {
            return Err(InternalError::ProtocolError(Some(from)));
        }

        let announcement = self.check_announcement(message)?;
        self.storage
            .store_once::<storage::ClientKeyBytes>(from, announcement.key)?;

        let mut replies = Vec::new();
        if matches!(self.state, RelayState::AwaitClients) {
            replies.push(self.session_params_for(from)?);
            replies.extend(self.roster_messages_if_complete()?);
        }
        Ok(ProcessOutcome::from_messages(replies))
    }

    /// Once every client key is in, forward the roster to every trustee.
    fn roster_messages_if_complete(&self) -> Result<Vec<Message>> {
        let clients = self.config.client_ids();
        if !self
            .storage
            .contains_for_all_ids::<storage::ClientKeyBytes>(&clients)
        {
            return Ok(Vec::new());
        }
        let roster = KeyVector {
            keys: clients
                .iter()
                .map(|id| self.storage.retrieve::<storage::ClientKeyBytes>(*id).cloned())
                .collect::<Result<Vec<_>>>()?,
        };
        info!("forwarding the client roster to the trustees");
        let frame = roster.encode();
        Ok(self
            .config
            .trustee_ids()
            .into_iter()
            .map(|trustee| {
                self.message_to(
                    trustee,
                    MessageType::Setup(SetupMessageType::ClientRoster),
                    frame.clone(),
                )
            })
            .collect())
    }

    /// Handle a client's ephemeral key for the shuffle epoch.
    fn handle_ephemeral_key(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, RelayState::AwaitClients) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        let from = message.from();
        if from.role() != Role::Client || from.index() >= self.config.n_clients() {
            return Err(InternalError::ProtocolError(Some(from)));
        }

        let announcement = self.check_announcement(message)?;
        let element = S::Element::try_from_bytes(&announcement.key)
            .map_err(|_| InternalError::UnmarshalFailed)?;
        self.storage
            .store_once::<storage::EphemeralKey<S>>(from, element)?;

        if !self
            .storage
            .contains_for_all_ids::<storage::EphemeralKey<S>>(&self.config.client_ids())
        {
            return Ok(ProcessOutcome::Incomplete);
        }

        // All ephemeral keys submitted: hand the initial state to the
        // first trustee.
        let keys = self
            .config
            .client_ids()
            .into_iter()
            .map(|id| self.storage.remove::<storage::EphemeralKey<S>>(id))
            .collect::<Result<Vec<_>>>()?;
        let initial = ShuffleState::<S>::initial(keys);
        let request = self.shuffle_request(0, &initial);
        info!("starting the trustee shuffle");
        self.state = RelayState::RunShuffle {
            initial,
            chain: Vec::new(),
            next: 0,
        };
        Ok(ProcessOutcome::Processed(vec![request]))
    }

    fn shuffle_request(&self, trustee_index: u32, state: &ShuffleState<S>) -> Message {
        let frame = ShuffleFrame {
            base: state.base.to_bytes(),
            keys: state.keys.iter().map(ElementOps::to_bytes).collect(),
            proof: Vec::new(),
        };
        self.message_to(
            PeerId::new(Role::Trustee, trustee_index),
            MessageType::Shuffle(ShuffleMessageType::Request),
            frame.encode(),
        )
    }

    /// Handle a trustee's shuffle reply: verify the link, then either pass
    /// the state to the next trustee or broadcast the finished schedule.
    fn handle_shuffle_reply(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        if !matches!(self.state, RelayState::RunShuffle { .. }) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        // Failures past this point are fatal to the session; only success
        // restores a usable state.
        let RelayState::RunShuffle {
            initial,
            mut chain,
            next,
        } = std::mem::replace(&mut self.state, RelayState::Terminated)
        else {
            return Err(InternalError::InternalInvariantFailed);
        };
        let from = message.from();
        if from != PeerId::new(Role::Trustee, next) {
            return Err(InternalError::ProtocolError(Some(from)));
        }

        let frame = ShuffleFrame::decode(&message.unverified_bytes, S::element_len())?;
        let base =
            S::Element::try_from_bytes(&frame.base).map_err(|_| InternalError::UnmarshalFailed)?;
        let keys = frame
            .keys
            .iter()
            .map(|key| S::Element::try_from_bytes(key).map_err(|_| InternalError::UnmarshalFailed))
            .collect::<Result<Vec<_>>>()?;
        let state = ShuffleState::<S> { base, keys };

        let previous = chain.last().map(|(state, _)| state).unwrap_or(&initial);
        if !shuffle::verify(previous, &state, &frame.proof) {
            error!(trustee = %from, "shuffle proof failed verification; aborting setup");
            return Err(InternalError::ShuffleProofInvalid);
        }

        let next = next + 1;
        if next < self.config.n_trustees() {
            let request = self.shuffle_request(next, &state);
            chain.push((state, frame.proof));
            self.state = RelayState::RunShuffle {
                initial,
                chain,
                next,
            };
            return Ok(ProcessOutcome::Processed(vec![request]));
        }
        chain.push((state, frame.proof));

        // Chain complete: publish it to the clients for independent
        // verification and slot discovery.
        info!("shuffle complete; broadcasting the schedule");
        let schedule = ScheduleFrame {
            initial: ShuffleFrame {
                base: initial.base.to_bytes(),
                keys: initial.keys.iter().map(ElementOps::to_bytes).collect(),
                proof: Vec::new(),
            },
            steps: chain
                .iter()
                .map(|(state, proof)| ShuffleFrame {
                    base: state.base.to_bytes(),
                    keys: state.keys.iter().map(ElementOps::to_bytes).collect(),
                    proof: proof.clone(),
                })
                .collect(),
        };
        let frame = schedule.encode();
        let mut messages: Vec<Message> = self
            .config
            .client_ids()
            .into_iter()
            .map(|client| {
                self.message_to(
                    client,
                    MessageType::Shuffle(ShuffleMessageType::Schedule),
                    frame.clone(),
                )
            })
            .collect();

        self.state = RelayState::AwaitSigmas;
        messages.extend(self.start_rounds_if_ready());
        Ok(ProcessOutcome::Processed(messages))
    }

    /// Handle a trustee's equivocation sigma.
    fn handle_sigma(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        let from = message.from();
        if from.role() != Role::Trustee || from.index() >= self.config.n_trustees() {
            return Err(InternalError::ProtocolError(Some(from)));
        }
        let frame = SigmaFrame::decode(&message.unverified_bytes)?;
        let sigma = S::Scalar::try_from_bytes(&frame.sigma)
            .map_err(|_| InternalError::UnmarshalFailed)?;
        self.storage
            .store_once::<storage::TrusteeSigma<S>>(from, sigma)?;

        Ok(ProcessOutcome::from_messages(self.start_rounds_if_ready()))
    }

    /// Enter round 0 once the schedule is out and every sigma arrived.
    fn start_rounds_if_ready(&mut self) -> Vec<Message> {
        if !matches!(self.state, RelayState::AwaitSigmas) {
            return Vec::new();
        }
        if !self
            .storage
            .contains_for_all_ids::<storage::TrusteeSigma<S>>(&self.config.trustee_ids())
        {
            return Vec::new();
        }
        info!("setup complete; starting round 0");
        self.state = RelayState::Round { round: 0 };
        self.beacon_messages(0)
    }

    fn beacon_messages(&self, round: u32) -> Vec<Message> {
        let beacon = BeaconFrame {
            round,
            // Slot ownership advances round-robin over the schedule.
            open_slot: round % self.config.n_clients(),
        };
        self.broadcast(
            MessageType::Round(RoundMessageType::Beacon),
            &beacon.encode(),
        )
    }

    /// Handle a per-round contribution from a client or trustee.
    fn handle_cell(&mut self, message: &Message) -> Result<ProcessOutcome<ResultFrame>> {
        let Some(round) = self.current_round() else {
            return Err(InternalError::ProtocolError(Some(message.from())));
        };
        let from = message.from();

        let expect_kappa = match (message.message_type(), from.role()) {
            (MessageType::Round(RoundMessageType::ClientCell), Role::Client) => true,
            (MessageType::Round(RoundMessageType::TrusteeCell), Role::Trustee) => false,
            _ => return Err(InternalError::ProtocolError(Some(from))),
        };

        let frame = CellFrame::decode(&message.unverified_bytes)?;
        // Streams are ordered, so a peer's contribution must be for the
        // round in flight.
        if frame.round != round || frame.cell.len() != self.config.cell_len() {
            error!(peer = %from, round = frame.round, "contribution does not match the round in flight");
            return Err(InternalError::ProtocolError(Some(from)));
        }

        if expect_kappa {
            let kappa = S::Scalar::try_from_bytes(&frame.kappa)
                .map_err(|_| InternalError::UnmarshalFailed)?;
            self.storage
                .store_once::<storage::RoundKappa<S>>(from, kappa)?;
        } else if !frame.kappa.is_empty() {
            return Err(InternalError::ProtocolError(Some(from)));
        }
        self.storage.store_once::<storage::RoundCell>(from, frame.cell)?;

        if !self
            .storage
            .contains_for_all_ids::<storage::RoundCell>(&self.config.peer_ids())
        {
            return Ok(ProcessOutcome::Incomplete);
        }
        self.resolve_round(round)
    }

    /// Decode a complete round and broadcast its result.
    fn resolve_round(&mut self, round: u32) -> Result<ProcessOutcome<ResultFrame>> {
        let cells = self
            .config
            .peer_ids()
            .into_iter()
            .map(|id| self.storage.remove::<storage::RoundCell>(id))
            .collect::<Result<Vec<_>>>()?;
        let kappas = self
            .config
            .client_ids()
            .into_iter()
            .map(|id| self.storage.remove::<storage::RoundKappa<S>>(id))
            .collect::<Result<Vec<_>>>()?;
        let sigmas = self
            .config
            .trustee_ids()
            .into_iter()
            .map(|id| {
                self.storage
                    .retrieve::<storage::TrusteeSigma<S>>(id)
                    .cloned()
            })
            .collect::<Result<Vec<_>>>()?;

        let combined = cell::decode(cells.iter().map(Vec::as_slice), self.config.cell_len());

        let (outcome, payload) = if self.config.cell_len() == 0 {
            // Zero-length payloads carry no wrap; the round advances on
            // cell arrival alone.
            (RoundOutcome::Decoded, Vec::new())
        } else {
            match self.guard.relay_decode(&combined, &kappas, &sigmas) {
                Ok(payload) => (RoundOutcome::Decoded, payload),
                Err(InternalError::PayloadAuthenticationFailed) => {
                    warn!(round, "payload failed authentication; round disrupted");
                    (RoundOutcome::Disrupted, Vec::new())
                }
                Err(other) => return Err(other),
            }
        };

        let result = ResultFrame {
            round,
            outcome,
            payload,
        };
        self.finish_round(result)
    }

    /// Broadcast a round result, advance the history and the round
    /// counter, and beacon the next round.
    fn finish_round(&mut self, result: ResultFrame) -> Result<ProcessOutcome<ResultFrame>> {
        let transcript = result.encode();

        // History moves strictly after the decode and strictly before the
        // next beacon; lost rounds do not advance it.
        if result.outcome != RoundOutcome::Lost {
            self.guard.update_history(&transcript);
        }

        let mut messages =
            self.broadcast(MessageType::Round(RoundMessageType::Result), &transcript);

        let next = result.round + 1;
        self.state = RelayState::Round { round: next };
        messages.extend(self.beacon_messages(next));

        Ok(ProcessOutcome::Output(result, messages))
    }

    /// Declare the round lost if it is still incomplete.
    ///
    /// The session driver calls this when the per-round deadline fires.
    /// Contributions already received are discarded; the offenders are
    /// noted in the log for the upper layer's blame policy. The history is
    /// not advanced for a lost round.
    pub fn handle_deadline(&mut self, round: u32) -> Result<ProcessOutcome<ResultFrame>> {
        let Some(current) = self.current_round() else {
            return Err(CallerError::ProtocolAlreadyTerminated.into());
        };
        if current != round {
            // The round resolved before the timer fired.
            return Ok(ProcessOutcome::Incomplete);
        }

        let mut missing = Vec::new();
        for peer in self.config.peer_ids() {
            if self.storage.contains::<storage::RoundCell>(peer) {
                let _ = self.storage.remove::<storage::RoundCell>(peer);
            } else {
                missing.push(peer);
            }
            if peer.role() == Role::Client && self.storage.contains::<storage::RoundKappa<S>>(peer)
            {
                let _ = self.storage.remove::<storage::RoundKappa<S>>(peer);
            }
        }
        if missing.is_empty() {
            return Err(InternalError::InternalInvariantFailed);
        }
        warn!(round, ?missing, "deadline expired; round lost");

        self.finish_round(ResultFrame {
            round,
            outcome: RoundOutcome::Lost,
            payload: Vec::new(),
        })
    }

    /// Note a peer disconnect.
    ///
    /// Before setup completes every participant is required, so the
    /// session ends with [`InternalError::PeerDisconnected`]. After setup
    /// the disconnect is logged and the round deadline handles the missing
    /// contributions; the upper layer decides whether to end the session.
    pub fn handle_disconnect(&mut self, peer: PeerId) -> Result<()> {
        warn!(peer = %peer, "peer disconnected");
        if matches!(self.state, RelayState::Round { .. }) {
            Ok(())
        } else {
            self.state = RelayState::Terminated;
            Err(InternalError::PeerDisconnected(peer))
        }
    }
}

impl<S: Suite> ProtocolParticipant for RelayParticipant<S> {
    type Input = ();
    type Output = ResultFrame;

    fn new(
        session_id: SessionId,
        id: PeerId,
        config: SessionConfig,
        _input: Self::Input,
    ) -> Result<Self> {
        if id != PeerId::relay() {
            Err(CallerError::BadInput)?;
        }
        Ok(Self {
            session_id,
            id,
            config,
            state: RelayState::AwaitTrustees,
            guard: EquivocationGuard::new(),
            storage: LocalStorage::default(),
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
            RelayState::Round { .. } => Status::Ready,
            RelayState::Terminated => Status::Terminated,
            _ => Status::AwaitingSetup,
        }
    }

    #[instrument(skip_all, fields(id = %self.id))]
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>> {
        if matches!(self.state, RelayState::Terminated) {
            Err(CallerError::ProtocolAlreadyTerminated)?;
        }
        if message.session_id() != self.session_id || message.to() != self.id {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        match message.message_type() {
            MessageType::Setup(SetupMessageType::TrusteeKey) => self.handle_trustee_key(message),
            MessageType::Setup(SetupMessageType::ClientHello) => self.handle_client_hello(message),
            MessageType::Setup(SetupMessageType::SigmaContribution) => self.handle_sigma(message),
            MessageType::Shuffle(ShuffleMessageType::EphemeralKey) => {
                self.handle_ephemeral_key(message)
            }
            MessageType::Shuffle(ShuffleMessageType::Reply) => self.handle_shuffle_reply(message),
            MessageType::Round(RoundMessageType::ClientCell)
            | MessageType::Round(RoundMessageType::TrusteeCell) => self.handle_cell(message),
            message_type => {
                error!("invalid message type sent to the relay: {:?}", message_type);
                Err(InternalError::ProtocolError(Some(message.from())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{ClientInput, ClientParticipant},
        qr::QR512,
        trustee::{TrusteeInput, TrusteeParticipant},
        utils::testing::init_testing,
    };
    use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
    use std::collections::HashMap;

    /// Rewrite or drop a message in flight. `None` drops it.
    type Mutator = Box<dyn FnMut(&Message) -> Option<Message>>;

    /// A complete local session: one relay, its clients and trustees, and
    /// FIFO inboxes standing in for the per-peer ordered streams.
    struct TestNet<S: Suite> {
        relay: RelayParticipant<S>,
        clients: Vec<ClientParticipant<S>>,
        trustees: Vec<TrusteeParticipant<S>>,
        inboxes: HashMap<PeerId, Vec<Message>>,
        events: HashMap<PeerId, Vec<ResultFrame>>,
        mutator: Option<Mutator>,
    }

    impl<S: Suite> TestNet<S> {
        fn new<R: RngCore + CryptoRng>(
            rng: &mut R,
            n_clients: u32,
            n_trustees: u32,
            payload_len: u32,
        ) -> Result<Self> {
            let session_id = SessionId::random(rng);
            let config = SessionConfig::new(n_clients, n_trustees, payload_len)?;

            let relay = RelayParticipant::<S>::new(session_id, PeerId::relay(), config, ())?;
            let clients = config
                .client_ids()
                .into_iter()
                .map(|id| {
                    ClientParticipant::new(session_id, id, config, ClientInput::generate(rng))
                })
                .collect::<Result<Vec<_>>>()?;
            let trustees = config
                .trustee_ids()
                .into_iter()
                .map(|id| {
                    TrusteeParticipant::new(session_id, id, config, TrusteeInput::generate(rng))
                })
                .collect::<Result<Vec<_>>>()?;

            let mut inboxes: HashMap<PeerId, Vec<Message>> = HashMap::new();
            inboxes.insert(PeerId::relay(), Vec::new());
            let mut events = HashMap::new();
            events.insert(PeerId::relay(), Vec::new());
            for client in &clients {
                inboxes.insert(client.id(), vec![client.initialize_message()]);
                events.insert(client.id(), Vec::new());
            }
            for trustee in &trustees {
                inboxes.insert(trustee.id(), vec![trustee.initialize_message()]);
                events.insert(trustee.id(), Vec::new());
            }

            Ok(Self {
                relay,
                clients,
                trustees,
                inboxes,
                events,
                mutator: None,
            })
        }

        /// Deliver a message, applying the mutator first.
        fn deliver(&mut self, message: Message) {
            let message = match &mut self.mutator {
                Some(mutate) => match mutate(&message) {
                    Some(message) => message,
                    None => return,
                },
                None => message,
            };
            self.inboxes
                .get_mut(&message.to())
                .expect("known recipient")
                .push(message);
        }

        /// Process one pending message at a randomly chosen participant.
        /// Per-peer delivery stays FIFO, matching the ordered streams the
        /// protocol assumes. Returns `false` once every inbox is empty.
        fn step<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<bool> {
            let busy: Vec<PeerId> = self
                .inboxes
                .iter()
                .filter(|(_, inbox)| !inbox.is_empty())
                .map(|(id, _)| *id)
                .collect();
            if busy.is_empty() {
                return Ok(false);
            }
            let id = busy[rng.gen_range(0..busy.len())];
            let message = self.inboxes.get_mut(&id).expect("known peer").remove(0);

            let outcome = match id.role() {
                Role::Relay => self.relay.process_message(rng, &message)?,
                Role::Client => {
                    self.clients[id.index() as usize].process_message(rng, &message)?
                }
                Role::Trustee => {
                    self.trustees[id.index() as usize].process_message(rng, &message)?
                }
            };
            let (output, messages) = outcome.into_parts();
            if let Some(output) = output {
                self.events.get_mut(&id).expect("known peer").push(output);
            }
            for message in messages {
                self.deliver(message);
            }
            Ok(true)
        }

        /// Process messages until the predicate holds. Panics if the
        /// network drains first: the predicate was unreachable.
        fn run_until<R: RngCore + CryptoRng>(
            &mut self,
            rng: &mut R,
            mut done: impl FnMut(&Self) -> bool,
        ) -> Result<()> {
            while !done(self) {
                if !self.step(rng)? {
                    panic!("network drained before the condition was reached");
                }
            }
            Ok(())
        }

        fn events(&self, id: PeerId) -> &[ResultFrame] {
            &self.events[&id]
        }

        fn relay_events(&self) -> &[ResultFrame] {
            self.events(PeerId::relay())
        }

        /// True once the relay and every peer observed exactly `n` round
        /// results; the relay is then collecting round `n`, its history
        /// aligned with everyone else's.
        fn all_observed(&self, n: usize) -> bool {
            self.events.values().all(|events| events.len() >= n)
                && self.relay_events().len() == n
        }

        fn all_history_bytes(&self) -> Vec<Vec<u8>> {
            let mut histories = vec![self.relay.history_bytes()];
            histories.extend(self.clients.iter().map(|c| c.history_bytes()));
            histories.extend(self.trustees.iter().map(|t| t.history_bytes()));
            histories
        }
    }

    /// Scenario: QR512, two clients, one trustee, four-byte payloads.
    /// Client 0 queues `0xDEADBEEF`; across the first two rounds (each
    /// client owns one slot) the relay must decode exactly one DEADBEEF
    /// round and one all-zeros round, without revealing which client is
    /// which.
    #[test]
    fn two_clients_one_trustee_payload_decodes() -> Result<()> {
        let mut rng = StdRng::from_seed([42u8; 32]);
        let mut net = TestNet::<QR512>::new(&mut rng, 2, 1, 4)?;
        net.clients[0].queue_payload(vec![0xde, 0xad, 0xbe, 0xef])?;
        net.clients[0].queue_payload(vec![0xde, 0xad, 0xbe, 0xef])?;

        net.run_until(&mut rng, |net| net.all_observed(2))?;

        let payloads: Vec<&[u8]> = net
            .relay_events()
            .iter()
            .map(|event| event.payload.as_slice())
            .collect();
        // Client 0 owns exactly one of the first two slots; its payload
        // appears there and the other round decodes the non-owner zeros.
        assert!(payloads.contains(&[0xde, 0xad, 0xbe, 0xef].as_slice()));
        assert!(payloads.contains(&[0u8; 4].as_slice()));
        for event in net.relay_events() {
            assert_eq!(event.outcome, RoundOutcome::Decoded);
        }

        // Every participant observed the same results.
        for client in &net.clients {
            assert_eq!(net.events(client.id()), net.relay_events());
        }
        for trustee in &net.trustees {
            assert_eq!(net.events(trustee.id()), net.relay_events());
        }
        Ok(())
    }

    /// Scenario: ten rounds of three clients and two trustees; afterwards
    /// every participant holds the identical history scalar.
    #[test]
    fn histories_agree_after_ten_rounds() -> Result<()> {
        let mut rng = StdRng::from_seed([7u8; 32]);
        let mut net = TestNet::<crate::ec25519::EC25519>::new(&mut rng, 3, 2, 16)?;
        for (i, client) in net.clients.iter_mut().enumerate() {
            // Nonzero marker payloads, distinguishable from silent slots.
            client.queue_payload(vec![i as u8 + 1; 16])?;
        }

        net.run_until(&mut rng, |net| net.all_observed(10))?;

        let histories = net.all_history_bytes();
        assert!(histories.windows(2).all(|pair| pair[0] == pair[1]));

        // Rounds decoded throughout, and each client's queued payload
        // surfaced exactly once.
        for (i, _) in net.clients.iter().enumerate() {
            let count = net
                .relay_events()
                .iter()
                .filter(|event| event.payload == vec![i as u8 + 1; 16])
                .count();
            assert_eq!(count, 1);
        }
        Ok(())
    }

    /// Boundary: a single client (and a single trustee) still runs; the
    /// sole client owns every slot.
    #[test]
    fn single_client_session_runs() -> Result<()> {
        let mut rng = init_testing();
        let mut net = TestNet::<crate::ec25519::EC25519>::new(&mut rng, 1, 1, 8)?;
        net.clients[0].queue_payload(b"speaking".to_vec())?;

        net.run_until(&mut rng, |net| net.all_observed(2))?;
        assert_eq!(net.relay_events()[0].payload, b"speaking");
        assert_eq!(net.relay_events()[1].payload, vec![0u8; 8]);
        Ok(())
    }

    /// Boundary: zero-length payloads produce empty cells and the rounds
    /// still advance, history included.
    #[test]
    fn zero_payload_length_rounds_advance() -> Result<()> {
        let mut rng = init_testing();
        let mut net = TestNet::<crate::ec25519::EC25519>::new(&mut rng, 2, 1, 0)?;

        net.run_until(&mut rng, |net| net.all_observed(3))?;
        for event in net.relay_events() {
            assert_eq!(event.outcome, RoundOutcome::Decoded);
            assert!(event.payload.is_empty());
        }
        let histories = net.all_history_bytes();
        assert!(histories.windows(2).all(|pair| pair[0] == pair[1]));
        Ok(())
    }

    /// Scenario: a trustee submits a tampered shuffle proof; the relay
    /// rejects setup with the cryptographic-failure exit code.
    #[test]
    fn tampered_shuffle_proof_aborts_setup() {
        let mut rng = StdRng::from_seed([3u8; 32]);
        let mut net = TestNet::<crate::ec25519::EC25519>::new(&mut rng, 2, 1, 4).unwrap();
        net.mutator = Some(Box::new(|message: &Message| {
            let mut message = message.clone();
            if message.message_type() == MessageType::Shuffle(ShuffleMessageType::Reply) {
                let last = message.unverified_bytes.len() - 1;
                message.unverified_bytes[last] ^= 0x01;
            }
            Some(message)
        }));

        let error = net
            .run_until(&mut rng, |_| false)
            .expect_err("setup must abort");
        assert_eq!(error, InternalError::ShuffleProofInvalid);
        assert_eq!(error.exit_code(), 3);
    }

    /// Scenario: the relay flips a bit of the owner's wrapped payload; the
    /// round is disrupted, and the next round proceeds normally.
    #[test]
    fn tampered_cell_disrupts_one_round() -> Result<()> {
        let mut rng = StdRng::from_seed([5u8; 32]);
        let mut net = TestNet::<crate::ec25519::EC25519>::new(&mut rng, 2, 1, 4)?;
        net.mutator = Some(Box::new(|message: &Message| {
            let mut message = message.clone();
            if message.message_type() == MessageType::Round(RoundMessageType::ClientCell) {
                let frame = CellFrame::decode(&message.unverified_bytes).unwrap();
                if frame.round == 0 && message.from().index() == 0 {
                    let mut frame = frame;
                    frame.cell[0] ^= 0x01;
                    message.unverified_bytes = frame.encode();
                }
            }
            Some(message)
        }));

        net.run_until(&mut rng, |net| net.all_observed(2))?;
        assert_eq!(net.relay_events()[0].outcome, RoundOutcome::Disrupted);
        assert!(net.relay_events()[0].payload.is_empty());
        assert_eq!(net.relay_events()[1].outcome, RoundOutcome::Decoded);

        // The disrupted transcript still entered everyone's history chain.
        let histories = net.all_history_bytes();
        assert!(histories.windows(2).all(|pair| pair[0] == pair[1]));
        Ok(())
    }

    /// Scenario: a client announces protocol version 0; the relay closes
    /// the connection with the version-mismatch exit code.
    #[test]
    fn version_skew_closes_the_connection() {
        let mut rng = StdRng::from_seed([6u8; 32]);
        let mut net = TestNet::<crate::ec25519::EC25519>::new(&mut rng, 2, 1, 4).unwrap();
        net.mutator = Some(Box::new(|message: &Message| {
            let mut message = message.clone();
            if message.message_type() == MessageType::Setup(SetupMessageType::ClientHello) {
                let mut announcement =
                    KeyAnnouncement::decode(&message.unverified_bytes).unwrap();
                announcement.version = 0;
                message.unverified_bytes = announcement.encode();
            }
            Some(message)
        }));

        let error = net
            .run_until(&mut rng, |_| false)
            .expect_err("handshake must fail");
        assert_eq!(
            error,
            InternalError::VersionMismatch { theirs: 0, ours: 1 }
        );
        assert_eq!(error.exit_code(), 2);
    }

    /// Scenario: a client goes silent mid-round. The deadline declares the
    /// round lost, the history does not advance, and the next round (with
    /// the client back) completes.
    #[test]
    fn silent_client_loses_the_round_only() -> Result<()> {
        let mut rng = StdRng::from_seed([9u8; 32]);
        let mut net = TestNet::<crate::ec25519::EC25519>::new(&mut rng, 2, 1, 4)?;

        // Drop client 1's round-0 contribution on the floor.
        net.mutator = Some(Box::new(|message: &Message| {
            if message.message_type() == MessageType::Round(RoundMessageType::ClientCell)
                && message.from().index() == 1
            {
                let frame = CellFrame::decode(&message.unverified_bytes).unwrap();
                if frame.round == 0 {
                    return None;
                }
            }
            Some(message.clone())
        }));

        // Drain the network: round 0 stalls with one contribution missing.
        while net.step(&mut rng)? {}
        assert_eq!(net.relay.current_round(), Some(0));
        let history_before = net.relay.history_bytes();

        // The driver's deadline fires.
        let (output, messages) = net.relay.handle_deadline(0)?.into_parts();
        let result = output.expect("round must resolve as lost");
        assert_eq!(result.outcome, RoundOutcome::Lost);
        assert_eq!(net.relay.history_bytes(), history_before);
        for message in messages {
            net.deliver(message);
        }

        // Round 1 completes once everyone contributes again, and every
        // peer observes both the loss and the round-1 result.
        net.run_until(&mut rng, |net| {
            net.relay_events().len() == 1
                && net.clients.iter().all(|c| net.events(c.id()).len() >= 2)
                && net.trustees.iter().all(|t| net.events(t.id()).len() >= 2)
        })?;
        assert_eq!(net.relay_events()[0].round, 1);
        assert_eq!(net.relay_events()[0].outcome, RoundOutcome::Decoded);
        for client in &net.clients {
            assert_eq!(net.events(client.id())[0].outcome, RoundOutcome::Lost);
        }

        // Histories agree everywhere: the lost round updated nobody's.
        let histories = net.all_history_bytes();
        assert!(histories.windows(2).all(|pair| pair[0] == pair[1]));
        Ok(())
    }

    /// A disconnect before setup completes ends the session with the
    /// peer-disconnect exit code; after setup it does not.
    #[test]
    fn early_disconnect_is_fatal() -> Result<()> {
        let mut rng = init_testing();
        let mut net = TestNet::<crate::ec25519::EC25519>::new(&mut rng, 2, 1, 4)?;

        let error = net
            .relay
            .handle_disconnect(PeerId::new(Role::Client, 1))
            .expect_err("disconnect during setup is fatal");
        assert_eq!(error.exit_code(), 4);
        Ok(())
    }
}

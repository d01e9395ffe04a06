//! A complete local session over threads and channels.
//!
//! Each participant is a worker thread owning its state machine; bounded
//! mpsc channels stand in for the reliable ordered streams of a real
//! deployment. The relay thread doubles as the round driver: it waits on
//! its inbox with the per-round deadline and declares the round lost when
//! the timer fires first.
//!
//! This module is both a usable in-process deployment and the reference
//! for wiring the participants to real sockets: one reader task per peer
//! stream, one driver owning the relay state, message dispatch by
//! [`Message::to`].

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    client::{ClientInput, ClientParticipant},
    config::{Config, SuiteKind},
    ec25519::EC25519,
    errors::{CallerError, InternalError, Result},
    messages::{Message, ResultFrame},
    participant::{ProcessOutcome, ProtocolParticipant},
    protocol::{PeerId, Role, SessionConfig, SessionId},
    qr::{QR1024, QR2048, QR512},
    relay::RelayParticipant,
    suite::Suite,
    trustee::{TrusteeInput, TrusteeParticipant},
};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::HashMap,
    sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{error, info, warn};

/// Per-channel message bound. Generous enough that the star never fills a
/// queue in both directions at once.
const CHANNEL_BOUND: usize = 256;

/// Instructions to a client or trustee worker.
enum ToPeer {
    /// A protocol message from the relay.
    Protocol(Box<Message>),
    /// A payload to queue for this client's next owned slot.
    Payload(Vec<u8>),
    /// Unilateral shutdown.
    Shutdown,
}

/// Traffic arriving at the relay thread.
enum ToRelay {
    /// A protocol message from a peer.
    Protocol(Box<Message>),
    /// A peer's worker ended.
    Disconnected(PeerId),
    /// The session owner asked for shutdown.
    Shutdown,
}

/// A running local session.
pub struct LocalSession {
    results: Receiver<ResultFrame>,
    to_relay: SyncSender<ToRelay>,
    peer_senders: HashMap<PeerId, SyncSender<ToPeer>>,
    relay_handle: JoinHandle<Result<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl LocalSession {
    /// Spawn a session for a validated node [`Config`], dispatching on its
    /// configured suite.
    pub fn spawn_for(config: &Config) -> Result<Self> {
        config.validate()?;
        let session = config.session_config()?;
        match config.suite {
            SuiteKind::Qr512 => Self::spawn::<QR512>(session, config.round_deadline),
            SuiteKind::Qr1024 => Self::spawn::<QR1024>(session, config.round_deadline),
            SuiteKind::Qr2048 => Self::spawn::<QR2048>(session, config.round_deadline),
            SuiteKind::Ec25519 => Self::spawn::<EC25519>(session, config.round_deadline),
        }
    }

    /// Spawn a relay, `config.n_clients()` clients, and
    /// `config.n_trustees()` trustees as worker threads and run setup.
    ///
    /// Identities are generated fresh; deployments that persist identities
    /// run the participants against real sockets instead.
    pub fn spawn<S: Suite>(config: SessionConfig, round_deadline: Duration) -> Result<Self> {
        let mut boot_rng = StdRng::from_entropy();
        let session_id = SessionId::random(&mut boot_rng);

        let (to_relay, relay_inbox) = sync_channel::<ToRelay>(CHANNEL_BOUND);
        let (result_tx, results) = sync_channel::<ResultFrame>(CHANNEL_BOUND);

        let mut peer_senders = HashMap::new();
        let mut worker_handles = Vec::new();

        for id in config.client_ids() {
            let participant = ClientParticipant::<S>::new(
                session_id,
                id,
                config,
                ClientInput::generate(&mut boot_rng),
            )?;
            let (tx, rx) = sync_channel::<ToPeer>(CHANNEL_BOUND);
            peer_senders.insert(id, tx);
            let relay_tx = to_relay.clone();
            worker_handles.push(thread::spawn(move || {
                client_worker(participant, rx, relay_tx)
            }));
        }
        for id in config.trustee_ids() {
            let participant = TrusteeParticipant::<S>::new(
                session_id,
                id,
                config,
                TrusteeInput::generate(&mut boot_rng),
            )?;
            let (tx, rx) = sync_channel::<ToPeer>(CHANNEL_BOUND);
            peer_senders.insert(id, tx);
            let relay_tx = to_relay.clone();
            worker_handles.push(thread::spawn(move || {
                trustee_worker(participant, rx, relay_tx)
            }));
        }

        let relay = RelayParticipant::<S>::new(session_id, PeerId::relay(), config, ())?;
        let relay_peers = peer_senders.clone();
        let relay_handle = thread::spawn(move || {
            relay_driver(relay, relay_inbox, relay_peers, result_tx, round_deadline)
        });

        Ok(Self {
            results,
            to_relay,
            peer_senders,
            relay_handle,
            worker_handles,
        })
    }

    /// The stream of round results as the relay resolves them.
    pub fn results(&self) -> &Receiver<ResultFrame> {
        &self.results
    }

    /// Queue a payload for a client to broadcast in its next owned slot.
    pub fn queue_payload(&self, client_index: u32, payload: Vec<u8>) -> Result<()> {
        let sender = self
            .peer_senders
            .get(&PeerId::new(Role::Client, client_index))
            .ok_or(CallerError::BadInput)?;
        sender
            .send(ToPeer::Payload(payload))
            .map_err(|_| InternalError::PeerDisconnected(PeerId::new(Role::Client, client_index)))
    }

    /// Take a client down mid-session, as an operator would.
    pub fn disconnect_client(&self, client_index: u32) -> Result<()> {
        let id = PeerId::new(Role::Client, client_index);
        let sender = self.peer_senders.get(&id).ok_or(CallerError::BadInput)?;
        sender
            .send(ToPeer::Shutdown)
            .map_err(|_| InternalError::PeerDisconnected(id))
    }

    /// Stop every task and collect the relay's verdict on the session.
    pub fn shutdown(self) -> Result<()> {
        let _ = self.to_relay.send(ToRelay::Shutdown);
        for sender in self.peer_senders.values() {
            let _ = sender.send(ToPeer::Shutdown);
        }
        for handle in self.worker_handles {
            let _ = handle.join();
        }
        match self.relay_handle.join() {
            Ok(result) => result,
            Err(_) => Err(InternalError::InternalInvariantFailed),
        }
    }
}

/// Forward a participant's outgoing messages to the relay.
fn send_to_relay(messages: Vec<Message>, relay_tx: &SyncSender<ToRelay>) -> bool {
    for message in messages {
        if relay_tx.send(ToRelay::Protocol(Box::new(message))).is_err() {
            return false;
        }
    }
    true
}

fn client_worker<S: Suite>(
    mut participant: ClientParticipant<S>,
    inbox: Receiver<ToPeer>,
    relay_tx: SyncSender<ToRelay>,
) {
    let mut rng = StdRng::from_entropy();
    let id = participant.id();

    // Open the conversation with the relay.
    let kickoff = participant.initialize_message();
    match participant.process_message(&mut rng, &kickoff) {
        Ok(outcome) => {
            let (_, messages) = outcome.into_parts();
            if !send_to_relay(messages, &relay_tx) {
                return;
            }
        }
        Err(error) => {
            error!(%id, %error, "client failed to start");
            let _ = relay_tx.send(ToRelay::Disconnected(id));
            return;
        }
    }

    loop {
        match inbox.recv() {
            Ok(ToPeer::Protocol(message)) => {
                match participant.process_message(&mut rng, &message) {
                    Ok(outcome) => {
                        let (_, messages) = outcome.into_parts();
                        if !send_to_relay(messages, &relay_tx) {
                            break;
                        }
                    }
                    Err(error) => {
                        error!(%id, %error, "client failed; shutting down");
                        break;
                    }
                }
            }
            Ok(ToPeer::Payload(payload)) => {
                if let Err(error) = participant.queue_payload(payload) {
                    warn!(%id, %error, "rejected a queued payload");
                }
            }
            Ok(ToPeer::Shutdown) | Err(_) => break,
        }
    }
    let _ = relay_tx.send(ToRelay::Disconnected(id));
}

fn trustee_worker<S: Suite>(
    mut participant: TrusteeParticipant<S>,
    inbox: Receiver<ToPeer>,
    relay_tx: SyncSender<ToRelay>,
) {
    let mut rng = StdRng::from_entropy();
    let id = participant.id();

    // Open the conversation with the relay.
    let kickoff = participant.initialize_message();
    match participant.process_message(&mut rng, &kickoff) {
        Ok(outcome) => {
            let (_, messages) = outcome.into_parts();
            if !send_to_relay(messages, &relay_tx) {
                return;
            }
        }
        Err(error) => {
            error!(%id, %error, "trustee failed to start");
            let _ = relay_tx.send(ToRelay::Disconnected(id));
            return;
        }
    }

    loop {
        match inbox.recv() {
            Ok(ToPeer::Protocol(message)) => {
                match participant.process_message(&mut rng, &message) {
                    Ok(outcome) => {
                        let (_, messages) = outcome.into_parts();
                        if !send_to_relay(messages, &relay_tx) {
                            break;
                        }
                    }
                    Err(error) => {
                        error!(%id, %error, "trustee failed; shutting down");
                        break;
                    }
                }
            }
            Ok(ToPeer::Payload(_)) => {
                warn!(%id, "trustees take no payloads");
            }
            Ok(ToPeer::Shutdown) | Err(_) => break,
        }
    }
    let _ = relay_tx.send(ToRelay::Disconnected(id));
}

/// The relay task: processes inbound traffic and enforces the round
/// deadline.
fn relay_driver<S: Suite>(
    mut relay: RelayParticipant<S>,
    inbox: Receiver<ToRelay>,
    peers: HashMap<PeerId, SyncSender<ToPeer>>,
    results: SyncSender<ResultFrame>,
    round_deadline: Duration,
) -> Result<()> {
    let mut rng = StdRng::from_entropy();
    // Armed whenever a round is being collected.
    let mut deadline_at: Option<Instant> = None;
    let mut armed_round = relay.current_round();

    loop {
        let received = match deadline_at {
            Some(at) => match inbox.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(received) => Some(received),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            },
            None => match inbox.recv() {
                Ok(received) => Some(received),
                Err(_) => return Ok(()),
            },
        };

        let outcome = match received {
            None => {
                // Deadline fired: the round in flight is lost.
                let Some(round) = relay.current_round() else {
                    deadline_at = None;
                    continue;
                };
                relay.handle_deadline(round)?
            }
            Some(ToRelay::Protocol(message)) => match relay.process_message(&mut rng, &message) {
                Ok(outcome) => outcome,
                Err(error) => {
                    if relay.current_round().is_some() {
                        // Round errors are recovered at the round
                        // boundary: note the offender, let the deadline
                        // resolve the round.
                        warn!(%error, "discarded a bad round contribution");
                        continue;
                    }
                    error!(%error, exit_code = error.exit_code(), "setup failed");
                    return Err(error);
                }
            },
            Some(ToRelay::Disconnected(peer)) => {
                relay.handle_disconnect(peer)?;
                continue;
            }
            Some(ToRelay::Shutdown) => {
                info!("session shutdown requested");
                return Ok(());
            }
        };

        let (output, messages) = outcome.into_parts();
        for message in messages {
            if let Some(sender) = peers.get(&message.to()) {
                // A send to a departed worker is a disconnect the deadline
                // logic already accounts for.
                let _ = sender.send(ToPeer::Protocol(Box::new(message)));
            }
        }
        if let Some(result) = output {
            if results.send(result).is_err() {
                return Ok(());
            }
        }

        // Re-arm the timer whenever a new round starts collecting.
        let current = relay.current_round();
        if current != armed_round {
            armed_round = current;
            deadline_at = current.map(|_| Instant::now() + round_deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec25519::EC25519;
    use crate::messages::RoundOutcome;

    #[test]
    fn threaded_session_decodes_rounds() {
        let config = SessionConfig::new(2, 1, 4).unwrap();
        let session = LocalSession::spawn::<EC25519>(config, Duration::from_secs(1)).unwrap();

        session.queue_payload(0, vec![0xde, 0xad, 0xbe, 0xef]).unwrap();

        // The payload surfaces once client 0 owns a slot with the queued
        // bytes in place; every round in between decodes to zeros.
        let mut saw_payload = false;
        for _ in 0..20 {
            let result = session
                .results()
                .recv_timeout(Duration::from_secs(10))
                .expect("round result");
            assert_eq!(result.outcome, RoundOutcome::Decoded);
            if result.payload == vec![0xde, 0xad, 0xbe, 0xef] {
                saw_payload = true;
                break;
            }
            assert_eq!(result.payload, vec![0u8; 4]);
        }
        assert!(saw_payload);

        session.shutdown().unwrap();
    }

    #[test]
    fn departed_client_costs_rounds_not_the_session() {
        let config = SessionConfig::new(2, 1, 4).unwrap();
        let session = LocalSession::spawn::<EC25519>(config, Duration::from_millis(200)).unwrap();

        // Let at least one round decode with everyone present.
        let first = session
            .results()
            .recv_timeout(Duration::from_secs(10))
            .expect("first round");
        assert_eq!(first.outcome, RoundOutcome::Decoded);

        session.disconnect_client(1).unwrap();

        // With a required contribution missing, rounds now resolve as lost
        // within the deadline.
        let mut saw_lost = false;
        for _ in 0..10 {
            let result = session
                .results()
                .recv_timeout(Duration::from_secs(10))
                .expect("round result");
            if result.outcome == RoundOutcome::Lost {
                saw_lost = true;
                break;
            }
        }
        assert!(saw_lost);

        session.shutdown().unwrap();
    }
}

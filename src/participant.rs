//! The participant abstraction every role implements.
//!
//! A participant is a sans-io state machine: the caller owns the sockets
//! (or channels) and feeds every received [`Message`] into
//! [`process_message`][ProtocolParticipant::process_message], which returns
//! the messages to send onward and any output the protocol produced. The
//! per-peer streams are assumed reliable, ordered, and authenticated, so a
//! message arriving out of its sender's expected order is a protocol error
//! attributed to that sender rather than something to buffer.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::Result,
    messages::Message,
    protocol::{PeerId, SessionConfig, SessionId},
};
use rand::{CryptoRng, RngCore};

/// Coarse protocol phase of a participant.
///
/// The fine-grained per-role states (awaiting trustees, performing the
/// shuffle, ...) live inside each participant; this is the phase the
/// enclosing application branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Setup is in progress: keys, secrets, or the schedule are missing.
    AwaitingSetup,
    /// Setup is complete; the participant is processing rounds.
    Ready,
    /// The session ended and no further messages will be accepted.
    Terminated,
}

/// The result of processing one message.
#[derive(Debug)]
pub enum ProcessOutcome<O> {
    /// The message was absorbed; nothing to send and nothing to report.
    Incomplete,
    /// Messages to send to their recipients.
    Processed(Vec<Message>),
    /// The protocol produced an output, alongside messages to send.
    Output(O, Vec<Message>),
}

impl<O> ProcessOutcome<O> {
    /// Wrap a list of messages, collapsing the empty case.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        if messages.is_empty() {
            ProcessOutcome::Incomplete
        } else {
            ProcessOutcome::Processed(messages)
        }
    }

    /// Prepend additional messages to this outcome.
    pub fn with_messages(self, mut messages: Vec<Message>) -> Self {
        match self {
            ProcessOutcome::Incomplete => ProcessOutcome::from_messages(messages),
            ProcessOutcome::Processed(more) => {
                messages.extend(more);
                ProcessOutcome::Processed(messages)
            }
            ProcessOutcome::Output(output, more) => {
                messages.extend(more);
                ProcessOutcome::Output(output, messages)
            }
        }
    }

    /// Split into the optional output and the messages to send.
    pub fn into_parts(self) -> (Option<O>, Vec<Message>) {
        match self {
            ProcessOutcome::Incomplete => (None, Vec::new()),
            ProcessOutcome::Processed(messages) => (None, messages),
            ProcessOutcome::Output(output, messages) => (Some(output), messages),
        }
    }
}

/// A state machine playing one role of the session.
pub trait ProtocolParticipant: Sized {
    /// Role-specific construction input (long-term keys and the like).
    type Input;

    /// What the participant reports as the session progresses.
    type Output;

    /// Construct a participant for one session.
    fn new(
        session_id: SessionId,
        id: PeerId,
        config: SessionConfig,
        input: Self::Input,
    ) -> Result<Self>;

    /// This participant's identity.
    fn id(&self) -> PeerId;

    /// The session this participant belongs to.
    fn session_id(&self) -> SessionId;

    /// The session parameters.
    fn config(&self) -> &SessionConfig;

    /// The coarse protocol phase.
    fn status(&self) -> Status;

    /// Process one received message.
    ///
    /// Returns the messages to send onward and any protocol output. An
    /// `Err` during setup is fatal to the session; an `Err` during a round
    /// is recovered at the round boundary by the relay's round driver.
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>>;
}

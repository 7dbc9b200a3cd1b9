//! Single-slot rendezvous between the producer and observing test routines.
//!
//! A waiter registers with `acquire` and is handed the value of the next `release`. Each
//! release reaches at most one waiter, oldest first. A release with nobody waiting is
//! dropped, so a waiter never observes a phase that completed before it started waiting.

use crate::Error;
use crate::engine_api::{ExecutePayloadStatus, ForkchoiceState, ForkchoiceUpdatedStatus};
use crate::peer::PeerId;
use alloy_primitives::{Address, B256};
use parking_lot::Mutex;
use std::collections::VecDeque;
use strum::{AsRefStr, Display, EnumIter, IntoStaticStr};
use tokio::sync::oneshot;

/// The three points of a production round at which every peer has been sent a new
/// fork choice state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, AsRefStr, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Head,
    Safe,
    Finalized,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerOutcome {
    Forkchoice(ForkchoiceUpdatedStatus),
    Payload(ExecutePayloadStatus),
    /// The call failed or timed out.
    Failed(String),
}

impl PeerOutcome {
    /// True for `SUCCESS` fork choice updates and `VALID` payloads.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PeerOutcome::Forkchoice(ForkchoiceUpdatedStatus::Success)
                | PeerOutcome::Payload(ExecutePayloadStatus::Valid)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerResponse {
    pub peer: PeerId,
    pub client: String,
    pub outcome: PeerOutcome,
}

/// What a test routine sees when a phase completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub block_number: u64,
    pub block_hash: B256,
    pub forkchoice_state: ForkchoiceState,
    pub prev_randao: B256,
    pub fee_recipient: Address,
    /// `engine_executePayloadV1` results for this block, one per peer reached.
    pub payload_responses: Vec<PeerResponse>,
    /// `engine_forkchoiceUpdatedV1` results of this phase's broadcast.
    pub responses: Vec<PeerResponse>,
}

impl PhaseSnapshot {
    /// Responses from both broadcasts that were not a success status.
    pub fn disagreements(&self) -> impl Iterator<Item = &PeerResponse> {
        self.payload_responses
            .iter()
            .chain(self.responses.iter())
            .filter(|response| !response.outcome.is_success())
    }
}

struct SignalState<T> {
    waiters: VecDeque<oneshot::Sender<T>>,
    closed: bool,
}

pub struct PhaseSignal<T> {
    state: Mutex<SignalState<T>>,
}

impl<T> Default for PhaseSignal<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SignalState {
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }
}

impl<T> PhaseSignal<T> {
    /// Waits for the next `release`.
    ///
    /// Returns `Error::ProducerStopped` if the signal is closed before or while waiting.
    pub async fn acquire(&self) -> Result<T, Error> {
        let receiver = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::ProducerStopped);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        receiver.await.map_err(|_| Error::ProducerStopped)
    }

    /// Hands `value` to the oldest live waiter. Returns `false` if there was none.
    pub fn release(&self, value: T) -> bool {
        let mut state = self.state.lock();
        let mut value = value;
        while let Some(waiter) = state.waiters.pop_front() {
            // A waiter whose future was dropped gives the value back.
            match waiter.send(value) {
                Ok(()) => return true,
                Err(returned) => value = returned,
            }
        }
        false
    }

    /// Fails all current and future waiters.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn waiter_count(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }
}

/// One signal per phase.
#[derive(Default)]
pub struct PhaseSignals {
    head: PhaseSignal<PhaseSnapshot>,
    safe: PhaseSignal<PhaseSnapshot>,
    finalized: PhaseSignal<PhaseSnapshot>,
}

impl PhaseSignals {
    pub fn get(&self, phase: Phase) -> &PhaseSignal<PhaseSnapshot> {
        match phase {
            Phase::Head => &self.head,
            Phase::Safe => &self.safe,
            Phase::Finalized => &self.finalized,
        }
    }

    pub fn close_all(&self) {
        self.head.close();
        self.safe.close();
        self.finalized.close();
    }
}

//! The block production loop that runs once the terminal block is known.
//!
//! Each round asks one peer to build a block, sends the block to every peer and then
//! moves the fork choice head, safe and finalized references to it in three separate
//! broadcasts. Test routines observe the end of each broadcast through `PhaseSignals`.

use crate::Error;
use crate::engine_api::http::ENGINE_FORKCHOICE_UPDATED_V1;
use crate::engine_api::{
    BlockQuery, ExecutionBlockHeader, ExecutionPayload, ForkchoiceState, ForkchoiceUpdatedStatus,
    PayloadAttributes,
};
use crate::mock_consensus::Shared;
use crate::peer::Peer;
use crate::phase_signal::{PeerOutcome, PeerResponse, Phase, PhaseSnapshot};
use crate::registry::PeerRegistry;
use alloy_primitives::{Address, B256};
use futures::future::join_all;
use logging::TimeLatch;
use rand::RngCore;
use rand::rngs::StdRng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Pause between attempts to find a builder whose head matches ours.
pub const BUILDER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A request to use `fee_recipient` for the next block. Answered with that block's number.
pub struct FeeRecipientRequest {
    pub fee_recipient: Address,
    pub reply: oneshot::Sender<u64>,
}

pub struct BlockProducer {
    shared: Arc<Shared>,
    rng: StdRng,
    fee_requests: mpsc::Receiver<FeeRecipientRequest>,
    pending_fee_request: Option<FeeRecipientRequest>,
    forkchoice_state: ForkchoiceState,
    last_timestamp: u64,
    stale_head_latch: TimeLatch,
    cancel: CancellationToken,
}

impl BlockProducer {
    pub fn new(
        shared: Arc<Shared>,
        rng: StdRng,
        fee_requests: mpsc::Receiver<FeeRecipientRequest>,
        terminal_block: ExecutionBlockHeader,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            rng,
            fee_requests,
            pending_fee_request: None,
            forkchoice_state: ForkchoiceState::all(terminal_block.block_hash),
            last_timestamp: terminal_block.timestamp,
            stale_head_latch: TimeLatch::default(),
            cancel,
        }
    }

    pub fn forkchoice_state(&self) -> ForkchoiceState {
        self.forkchoice_state
    }

    /// Points every peer's head, safe and finalized references at the terminal block.
    pub async fn broadcast_initial_forkchoice(&self) -> Result<Vec<PeerResponse>, Error> {
        let peers = self.shared.registry.snapshot();
        if peers.is_empty() {
            return Err(Error::NoPeers);
        }

        let responses = self.broadcast_forkchoice(&peers).await;
        info!(
            terminal_block_hash = %self.forkchoice_state.head_block_hash,
            peers = responses.len(),
            "Sent initial forkchoice state"
        );
        Ok(responses)
    }

    /// Produces a block every `block_production_interval` until cancelled.
    ///
    /// Only errors that leave nothing to produce with end the loop. Anything else skips
    /// the round and the next one is attempted on schedule.
    pub async fn run(mut self) -> Result<(), Error> {
        let interval = self.shared.config.block_production_interval;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }

            let deadline = Instant::now() + interval;
            match self.produce_block(deadline).await {
                Ok(Some(block_number)) => {
                    trace!(block_number, "Production round complete");
                }
                Ok(None) => {}
                Err(e) if e.halts_production() => {
                    error!(error = ?e, "Block production halted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = ?e, "Block production round failed");
                }
            }
        }

        debug!("Block producer stopped");
        Ok(())
    }

    /// Runs one production round. Returns `None` if no builder was ready before `deadline`.
    pub async fn produce_block(&mut self, deadline: Instant) -> Result<Option<u64>, Error> {
        let peers = self.shared.registry.snapshot();
        if peers.is_empty() {
            return Err(Error::NoPeers);
        }

        let Some(builder) = self.select_builder(deadline).await? else {
            return Ok(None);
        };

        let prev_randao = self.random_b256();
        let timestamp = self.last_timestamp + self.shared.config.timestamp_increment();
        let fee_recipient = self
            .next_fee_request()
            .map_or(Address::ZERO, |request| request.fee_recipient);

        let attributes = PayloadAttributes {
            timestamp,
            prev_randao,
            suggested_fee_recipient: fee_recipient,
        };

        let response = builder
            .forkchoice_updated(self.forkchoice_state, Some(attributes))
            .await?;
        if response.status != ForkchoiceUpdatedStatus::Success {
            return Err(Error::UnexpectedStatus {
                peer: builder.client_name().to_string(),
                method: ENGINE_FORKCHOICE_UPDATED_V1,
                status: response.status.as_str().to_string(),
            });
        }
        let payload_id = response.payload_id.ok_or_else(|| Error::PayloadIdUnavailable {
            peer: builder.client_name().to_string(),
        })?;
        let payload = builder.get_payload(payload_id).await?;

        debug!(
            builder = %builder.client_name(),
            block_number = payload.block_number,
            block_hash = %payload.block_hash,
            "Received payload"
        );

        let payload_responses = self.broadcast_payload(&peers, &payload).await;

        let block_hash = payload.block_hash;
        let round = Round {
            payload: &payload,
            prev_randao,
            fee_recipient,
            payload_responses: &payload_responses,
        };

        self.forkchoice_state.head_block_hash = block_hash;
        self.complete_phase(Phase::Head, &peers, &round).await;

        self.forkchoice_state.safe_block_hash = block_hash;
        self.complete_phase(Phase::Safe, &peers, &round).await;

        // Recorded before the final release so that a woken waiter sees the whole round.
        let block_number = payload.block_number;
        self.shared
            .prev_randao_history
            .insert(block_number, prev_randao)?;
        if self.shared.first_pos_block_number.set(block_number).is_ok() {
            info!(block_number, "Produced first post-transition block");
        }
        self.last_timestamp = payload.timestamp;

        self.forkchoice_state.finalized_block_hash = block_hash;
        self.complete_phase(Phase::Finalized, &peers, &round).await;

        if let Some(request) = self.pending_fee_request.take() {
            // The reserver may have given up waiting.
            let _ = request.reply.send(block_number);
        }

        info!(
            block_number,
            %block_hash,
            %fee_recipient,
            peers = peers.len(),
            "Produced block"
        );

        Ok(Some(block_number))
    }

    /// Picks a random healthy peer whose head matches the current fork choice head.
    ///
    /// Candidates that have not caught up are retried until `deadline`.
    async fn select_builder(&mut self, deadline: Instant) -> Result<Option<Arc<Peer>>, Error> {
        loop {
            if self.shared.registry.is_empty() {
                return Err(Error::NoPeers);
            }
            let peer = self
                .shared
                .registry
                .random_healthy(&mut self.rng)
                .ok_or(Error::NoHealthyPeers)?;

            match peer.header(BlockQuery::Latest).await {
                Ok(Some(head)) if head.block_hash == self.forkchoice_state.head_block_hash => {
                    return Ok(Some(peer));
                }
                Ok(head) => {
                    debug!(
                        peer = %peer.client_name(),
                        expected = %self.forkchoice_state.head_block_hash,
                        found = ?head.map(|header| header.block_hash),
                        "Builder candidate is not on our head"
                    );
                }
                // Already recorded against the peer, which is now excluded.
                Err(_) => {}
            }

            if Instant::now() + BUILDER_RETRY_DELAY >= deadline {
                if self.stale_head_latch.elapsed() {
                    warn!(
                        head = %self.forkchoice_state.head_block_hash,
                        "No peer is ready to build on the current head"
                    );
                }
                debug!("Skipping production round");
                return Ok(None);
            }
            sleep(BUILDER_RETRY_DELAY).await;
        }
    }

    /// The request to serve this round, if any.
    ///
    /// A request stays pending until a round completes, so a failed round hands it to the
    /// next one.
    fn next_fee_request(&mut self) -> Option<&FeeRecipientRequest> {
        if self
            .pending_fee_request
            .as_ref()
            .is_some_and(|request| request.reply.is_closed())
        {
            self.pending_fee_request = None;
        }

        while self.pending_fee_request.is_none() {
            match self.fee_requests.try_recv() {
                Ok(request) if request.reply.is_closed() => continue,
                Ok(request) => {
                    debug!(fee_recipient = %request.fee_recipient, "Applying fee recipient");
                    self.pending_fee_request = Some(request);
                }
                Err(_) => break,
            }
        }

        self.pending_fee_request.as_ref()
    }

    fn random_b256(&mut self) -> B256 {
        let mut bytes = [0u8; 32];
        self.rng.fill_bytes(&mut bytes);
        B256::from(bytes)
    }

    async fn broadcast_payload(
        &self,
        peers: &[Arc<Peer>],
        payload: &ExecutionPayload,
    ) -> Vec<PeerResponse> {
        fan_out(&self.shared.registry, peers, |peer| async move {
            match peer.execute_payload(payload).await {
                Ok(response) => {
                    if !PeerOutcome::Payload(response.status.clone()).is_success() {
                        warn!(
                            peer = %peer.client_name(),
                            test = %peer.test_name(),
                            block_hash = %payload.block_hash,
                            status = response.status.as_str(),
                            validation_error = ?response.validation_error,
                            "Peer did not accept payload"
                        );
                    }
                    PeerOutcome::Payload(response.status)
                }
                Err(e) => PeerOutcome::Failed(format!("{e:?}")),
            }
        })
        .await
    }

    async fn broadcast_forkchoice(&self, peers: &[Arc<Peer>]) -> Vec<PeerResponse> {
        let forkchoice_state = self.forkchoice_state;
        fan_out(&self.shared.registry, peers, |peer| async move {
            match peer.forkchoice_updated(forkchoice_state, None).await {
                Ok(response) => {
                    if response.status != ForkchoiceUpdatedStatus::Success {
                        warn!(
                            peer = %peer.client_name(),
                            test = %peer.test_name(),
                            head = %forkchoice_state.head_block_hash,
                            status = response.status.as_str(),
                            "Peer did not apply forkchoice update"
                        );
                    }
                    PeerOutcome::Forkchoice(response.status)
                }
                Err(e) => PeerOutcome::Failed(format!("{e:?}")),
            }
        })
        .await
    }

    async fn complete_phase(&self, phase: Phase, peers: &[Arc<Peer>], round: &Round<'_>) {
        let responses = self.broadcast_forkchoice(peers).await;

        let snapshot = PhaseSnapshot {
            phase,
            block_number: round.payload.block_number,
            block_hash: round.payload.block_hash,
            forkchoice_state: self.forkchoice_state,
            prev_randao: round.prev_randao,
            fee_recipient: round.fee_recipient,
            payload_responses: round.payload_responses.to_vec(),
            responses,
        };

        if !self.shared.signals.get(phase).release(snapshot) {
            trace!(%phase, block_number = round.payload.block_number, "No waiter for phase");
        }
    }
}

/// The parts of a round shared by its three phases.
struct Round<'a> {
    payload: &'a ExecutionPayload,
    prev_randao: B256,
    fee_recipient: Address,
    payload_responses: &'a [PeerResponse],
}

/// Calls every peer of `peers` concurrently.
///
/// Peers no longer in `registry` are skipped, and the results of peers removed while their
/// call was in flight are discarded.
async fn fan_out<'a, F, Fut>(
    registry: &PeerRegistry,
    peers: &'a [Arc<Peer>],
    call: F,
) -> Vec<PeerResponse>
where
    F: Fn(&'a Peer) -> Fut,
    Fut: Future<Output = PeerOutcome>,
{
    let call = &call;
    let calls = peers.iter().map(|peer| async move {
        if !registry.contains(peer.id()) {
            return None;
        }
        let outcome = call(peer.as_ref()).await;
        registry.contains(peer.id()).then(|| PeerResponse {
            peer: peer.id(),
            client: peer.client_name().to_string(),
            outcome,
        })
    });

    join_all(calls).await.into_iter().flatten().collect()
}

use crate::Error;
use crate::config::Config;
use crate::engine_api::ExecutionBlockHeader;
use crate::peer::{Peer, PeerId};
use crate::phase_signal::{Phase, PhaseSignals, PhaseSnapshot};
use crate::prev_randao_history::PrevRandaoHistory;
use crate::producer::{BlockProducer, FeeRecipientRequest};
use crate::registry::PeerRegistry;
use crate::transition::{MinedBlock, TransitionDetector, TransitionStatus};
use alloy_primitives::{Address, B256};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the mined block event channel. Events beyond it are of no use anyway, the
/// next poll reads the whole chain.
const MINED_BLOCK_CHANNEL_CAPACITY: usize = 16;

/// State shared between the handle and the driver task.
///
/// The producer's fork choice state is not in here: it lives in the driver task and is
/// only published through the phase signals.
pub(crate) struct Shared {
    pub config: Config,
    pub registry: PeerRegistry,
    pub signals: PhaseSignals,
    pub prev_randao_history: PrevRandaoHistory,
    pub terminal_block: watch::Sender<Option<ExecutionBlockHeader>>,
    pub first_pos_block_number: OnceLock<u64>,
    /// Cancelled once the driver has exited, or on `stop` if it never started.
    pub driver_exited: CancellationToken,
}

impl Shared {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: PeerRegistry::default(),
            signals: PhaseSignals::default(),
            prev_randao_history: PrevRandaoHistory::default(),
            terminal_block: watch::Sender::new(None),
            first_pos_block_number: OnceLock::new(),
            driver_exited: CancellationToken::new(),
        }
    }
}

/// Everything the driver task takes ownership of when started.
struct Startup {
    rng: StdRng,
    fee_requests: mpsc::Receiver<FeeRecipientRequest>,
    mined_blocks: mpsc::Receiver<MinedBlock>,
}

/// A stand-in consensus client that drives a set of execution clients through the
/// transition and then produces a block every `block_production_interval`.
///
/// Create one per test suite, register peers as their clients come up, `start` it and
/// `shutdown` it once the suite is done.
pub struct MockConsensus {
    shared: Arc<Shared>,
    fee_requests: mpsc::Sender<FeeRecipientRequest>,
    mined_blocks: mpsc::Sender<MinedBlock>,
    startup: Mutex<Option<Startup>>,
    driver: Mutex<Option<JoinHandle<Result<(), Error>>>>,
    cancel: CancellationToken,
}

impl MockConsensus {
    /// Seeds the generator from `config.seed`, or from the OS if unset.
    pub fn new(config: Config) -> Result<Self, Error> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::with_rng(config, rng)
    }

    pub fn with_rng(config: Config, rng: StdRng) -> Result<Self, Error> {
        config.validate()?;

        let (fee_requests, fee_receiver) = mpsc::channel(1);
        let (mined_blocks, mined_receiver) = mpsc::channel(MINED_BLOCK_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared::new(config)),
            fee_requests,
            mined_blocks,
            startup: Mutex::new(Some(Startup {
                rng,
                fee_requests: fee_receiver,
                mined_blocks: mined_receiver,
            })),
            driver: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Spawns the driver on the current tokio runtime.
    pub fn start(&self) -> Result<(), Error> {
        let startup = self.startup.lock().take().ok_or(Error::AlreadyStarted)?;

        let handle = tokio::spawn(drive(self.shared.clone(), startup, self.cancel.clone()));
        *self.driver.lock() = Some(handle);

        info!(
            terminal_total_difficulty = %self.shared.config.terminal_total_difficulty,
            "Mock consensus started"
        );
        Ok(())
    }

    /// Asks the driver to stop at the next round boundary. In-flight calls are not
    /// interrupted. All phase waiters and pending fee recipient reservations fail with
    /// `Error::ProducerStopped` once it has stopped.
    pub fn stop(&self) {
        self.cancel.cancel();

        // Never started: nothing else will ever release the waiters.
        if self.startup.lock().take().is_some() {
            self.shared.signals.close_all();
            self.shared.driver_exited.cancel();
        }
    }

    /// Stops the driver and waits for it to exit, returning the error that halted it, if
    /// any.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.stop();

        let Some(handle) = self.driver.lock().take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = ?e, "Mock consensus driver panicked");
                Err(Error::ProducerStopped)
            }
        }
    }

    pub fn add_peer(&self, peer: Arc<Peer>) -> bool {
        let added = self.shared.registry.add(peer.clone());
        if added {
            info!(
                peer = %peer.client_name(),
                test = %peer.test_name(),
                id = %peer.id(),
                "Added peer"
            );
        }
        added
    }

    /// Safe while a round is in flight: the peer receives no further calls and any result
    /// still in flight is discarded.
    pub fn remove_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        let removed = self.shared.registry.remove(id);
        if let Some(peer) = &removed {
            info!(peer = %peer.client_name(), id = %id, "Removed peer");
        }
        removed
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.shared.registry.snapshot()
    }

    pub fn is_transition_reached(&self) -> bool {
        self.shared.terminal_block.borrow().is_some()
    }

    /// The block at which the chain crossed the terminal total difficulty.
    pub fn terminal_block(&self) -> Option<ExecutionBlockHeader> {
        *self.shared.terminal_block.borrow()
    }

    pub fn first_pos_block_number(&self) -> Option<u64> {
        self.shared.first_pos_block_number.get().copied()
    }

    /// True if `block_number` was produced through the Engine API.
    pub fn is_block_pos(&self, block_number: u64) -> bool {
        self.first_pos_block_number()
            .is_some_and(|first| block_number >= first)
    }

    /// Fails with `Error::ProducerStopped` as soon as the driver exits without having
    /// found the terminal block.
    pub async fn wait_for_transition(
        &self,
        timeout: Duration,
    ) -> Result<ExecutionBlockHeader, Error> {
        let mut receiver = self.shared.terminal_block.subscribe();
        let driver_exited = &self.shared.driver_exited;
        let terminal_block = async {
            tokio::select! {
                biased;
                terminal_block = receiver.wait_for(Option::is_some) => {
                    terminal_block.ok().and_then(|terminal_block| *terminal_block)
                }
                _ = driver_exited.cancelled() => None,
            }
        };

        tokio::time::timeout(timeout, terminal_block)
            .await
            .map_err(|_| Error::TransitionTimeout(timeout))?
            .ok_or(Error::ProducerStopped)
    }

    pub async fn await_phase(&self, phase: Phase) -> Result<PhaseSnapshot, Error> {
        self.shared.signals.get(phase).acquire().await
    }

    /// Waits until the next block's head has been sent to every peer.
    pub async fn await_head_phase(&self) -> Result<PhaseSnapshot, Error> {
        self.await_phase(Phase::Head).await
    }

    pub async fn await_safe_phase(&self) -> Result<PhaseSnapshot, Error> {
        self.await_phase(Phase::Safe).await
    }

    pub async fn await_final_phase(&self) -> Result<PhaseSnapshot, Error> {
        self.await_phase(Phase::Finalized).await
    }

    /// Waits for `count` more blocks to be finalized.
    pub async fn produce_blocks(&self, count: usize) -> Result<Vec<PhaseSnapshot>, Error> {
        let mut snapshots = Vec::with_capacity(count);
        for _ in 0..count {
            snapshots.push(self.await_final_phase().await?);
        }
        Ok(snapshots)
    }

    /// Makes `fee_recipient` the suggested fee recipient of the next block whose round has
    /// not started yet, and waits until that block has been finalized.
    ///
    /// Returns the number of that block. Only one reservation is queued at a time; further
    /// callers wait for the slot.
    pub async fn reserve_next_fee_recipient(&self, fee_recipient: Address) -> Result<u64, Error> {
        let (reply, receiver) = oneshot::channel();
        self.fee_requests
            .send(FeeRecipientRequest {
                fee_recipient,
                reply,
            })
            .await
            .map_err(|_| Error::ProducerStopped)?;

        receiver.await.map_err(|_| Error::ProducerStopped)
    }

    pub fn prev_randao_at(&self, block_number: u64) -> Option<B256> {
        self.shared.prev_randao_history.get(block_number)
    }

    pub fn prev_randao_history(&self) -> &PrevRandaoHistory {
        &self.shared.prev_randao_history
    }

    /// Lets a miner announce new blocks so the transition is noticed without waiting for
    /// the next poll.
    pub fn mined_block_sender(&self) -> mpsc::Sender<MinedBlock> {
        self.mined_blocks.clone()
    }
}

impl Drop for MockConsensus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    shared: Arc<Shared>,
    startup: Startup,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let result = run_to_completion(&shared, startup, &cancel).await;

    shared.signals.close_all();
    shared.driver_exited.cancel();
    match &result {
        Ok(()) => info!("Mock consensus stopped"),
        Err(e) => error!(error = ?e, "Mock consensus halted"),
    }
    result
}

async fn run_to_completion(
    shared: &Arc<Shared>,
    startup: Startup,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let Startup {
        mut rng,
        fee_requests,
        mut mined_blocks,
    } = startup;

    let Some(terminal_block) =
        wait_for_terminal_block(shared, &mut rng, &mut mined_blocks, cancel).await?
    else {
        return Ok(());
    };
    drop(mined_blocks);

    let producer = BlockProducer::new(
        shared.clone(),
        rng,
        fee_requests,
        terminal_block,
        cancel.clone(),
    );
    producer.broadcast_initial_forkchoice().await?;
    producer.run().await
}

/// Polls a random healthy peer every `transition_check_interval` until the terminal block
/// is found. Returns `None` if cancelled first.
async fn wait_for_terminal_block(
    shared: &Shared,
    rng: &mut StdRng,
    mined_blocks: &mut mpsc::Receiver<MinedBlock>,
    cancel: &CancellationToken,
) -> Result<Option<ExecutionBlockHeader>, Error> {
    let ttd = shared.config.terminal_total_difficulty;
    let mut detector = TransitionDetector::new(ttd);

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        match shared.registry.random_healthy(rng) {
            Some(peer) => match detector.poll(&peer).await {
                Ok(TransitionStatus::Reached(terminal_block)) => {
                    info!(
                        peer = %peer.client_name(),
                        block_number = terminal_block.block_number,
                        block_hash = %terminal_block.block_hash,
                        cumulative_difficulty = %detector.cumulative_difficulty(),
                        "Terminal total difficulty reached"
                    );
                    shared.terminal_block.send_replace(Some(terminal_block));
                    return Ok(Some(terminal_block));
                }
                Ok(TransitionStatus::BelowThreshold {
                    cumulative_difficulty,
                    checked_height,
                }) => {
                    debug!(
                        peer = %peer.client_name(),
                        %cumulative_difficulty,
                        checked_height,
                        "Terminal total difficulty not reached"
                    );
                }
                Err(e @ Error::TransitionAlreadyReached) => return Err(e),
                Err(e) => {
                    warn!(peer = %peer.client_name(), error = ?e, "Transition check failed");
                }
            },
            None => debug!("No healthy peers to check for the transition"),
        }

        let next_check = sleep(shared.config.transition_check_interval);
        tokio::pin!(next_check);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut next_check => break,
                Some(event) = mined_blocks.recv() => {
                    if event.total_difficulty >= ttd {
                        debug!(
                            block_number = event.number,
                            total_difficulty = %event.total_difficulty,
                            "Mined block reached terminal total difficulty"
                        );
                        break;
                    }
                }
            }
        }
    }
}

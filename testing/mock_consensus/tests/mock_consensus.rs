use alloy_primitives::{Address, U256};
use mock_consensus::engine_api::ExecutionBlockHeader;
use mock_consensus::engine_api::http::{
    ENGINE_EXECUTE_PAYLOAD_V1, ENGINE_FORKCHOICE_UPDATED_V1, ETH_BLOCK_NUMBER,
};
use mock_consensus::test_utils::MockExecutionEngine;
use mock_consensus::verification::{verify_convergence, verify_fee_recipient, verify_prev_randao};
use mock_consensus::{
    Config, Error, ForkchoiceState, MinedBlock, MockConsensus, Peer, PeerOutcome, Phase,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};

const TERMINAL_TOTAL_DIFFICULTY: u64 = 100;
const BLOCK_DIFFICULTY: u64 = 20;
const TRANSITION_TIMEOUT: Duration = Duration::from_secs(30);

fn config() -> Config {
    Config {
        terminal_total_difficulty: U256::from(TERMINAL_TOTAL_DIFFICULTY),
        block_production_interval: Duration::from_secs(1),
        transition_check_interval: Duration::from_secs(1),
        rpc_timeout: Duration::from_secs(2),
        seed: Some(7),
    }
}

struct TestRig {
    consensus: MockConsensus,
    engines: Vec<Arc<MockExecutionEngine>>,
    peers: Vec<Arc<Peer>>,
}

impl TestRig {
    fn new(peer_count: usize, config: Config) -> Self {
        logging::create_test_tracing_subscriber();

        let consensus = MockConsensus::new(config).unwrap();
        let mut engines = vec![];
        let mut peers = vec![];
        for i in 0..peer_count {
            let engine = Arc::new(MockExecutionEngine::new(U256::ZERO));
            let peer = Arc::new(Peer::new(
                format!("engine_{i}"),
                "mock_consensus_tests",
                engine.clone(),
                consensus.config().rpc_timeout,
            ));
            assert!(consensus.add_peer(peer.clone()));
            engines.push(engine);
            peers.push(peer);
        }

        Self {
            consensus,
            engines,
            peers,
        }
    }

    /// Mines the same PoW block on every engine.
    fn mine(&self, difficulty: u64) -> ExecutionBlockHeader {
        let headers = self
            .engines
            .iter()
            .map(|engine| engine.mine_pow_block(U256::from(difficulty)).unwrap())
            .collect::<Vec<_>>();
        assert!(headers.windows(2).all(|pair| pair[0] == pair[1]));
        headers[0]
    }

    /// Mines enough blocks to cross the terminal total difficulty and waits for the
    /// transition. Returns the terminal block.
    async fn reach_transition(&self) -> ExecutionBlockHeader {
        let mut terminal = None;
        for _ in 0..TERMINAL_TOTAL_DIFFICULTY / BLOCK_DIFFICULTY {
            terminal = Some(self.mine(BLOCK_DIFFICULTY));
        }
        self.consensus.start().unwrap();

        let found = self
            .consensus
            .wait_for_transition(TRANSITION_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(Some(found), terminal);
        found
    }
}

#[tokio::test(start_paused = true)]
async fn produces_blocks_after_transition() {
    let rig = TestRig::new(2, config());
    assert!(!rig.consensus.is_transition_reached());

    let terminal = rig.reach_transition().await;
    assert_eq!(terminal.block_number, 5);
    assert!(rig.consensus.is_transition_reached());
    assert_eq!(rig.consensus.terminal_block(), Some(terminal));

    let snapshots = rig.consensus.produce_blocks(3).await.unwrap();
    let numbers = snapshots
        .iter()
        .map(|snapshot| snapshot.block_number)
        .collect::<Vec<_>>();
    assert_eq!(numbers, vec![6, 7, 8]);

    assert_eq!(rig.consensus.first_pos_block_number(), Some(6));
    assert!(!rig.consensus.is_block_pos(5));
    assert!(rig.consensus.is_block_pos(6));
    assert!(rig.consensus.is_block_pos(8));

    let mut seen = HashSet::new();
    for snapshot in &snapshots {
        assert_eq!(snapshot.phase, Phase::Finalized);
        assert_eq!(
            snapshot.forkchoice_state,
            ForkchoiceState::all(snapshot.block_hash)
        );
        assert_eq!(snapshot.disagreements().count(), 0);
        assert_eq!(
            rig.consensus.prev_randao_at(snapshot.block_number),
            Some(snapshot.prev_randao)
        );
        assert!(seen.insert(snapshot.prev_randao));

        for peer in &rig.peers {
            verify_prev_randao(
                peer,
                snapshot.block_number,
                rig.consensus.prev_randao_history(),
            )
            .await
            .unwrap();
        }
    }

    let last = snapshots.last().unwrap();
    verify_convergence(&rig.peers, last.forkchoice_state)
        .await
        .unwrap();

    rig.consensus.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn first_round_starts_within_one_interval_of_transition() {
    let config = config();
    let rig = TestRig::new(2, config.clone());
    rig.reach_transition().await;
    let transition_seen = Instant::now();

    let head = rig.consensus.await_head_phase().await.unwrap();
    assert_eq!(head.block_number, 6);
    assert!(transition_seen.elapsed() <= config.block_production_interval);
}

#[tokio::test(start_paused = true)]
async fn timestamps_advance_by_block_interval() {
    let rig = TestRig::new(1, config());
    let terminal = rig.reach_transition().await;

    let snapshots = rig.consensus.produce_blocks(2).await.unwrap();
    let first = rig.engines[0]
        .block_by_hash(snapshots[0].block_hash)
        .unwrap()
        .header();
    let second = rig.engines[0]
        .block_by_hash(snapshots[1].block_hash)
        .unwrap()
        .header();

    assert_eq!(first.timestamp, terminal.timestamp + 1);
    assert_eq!(second.timestamp, first.timestamp + 1);
    assert_eq!(first.parent_hash, terminal.block_hash);
    assert_eq!(second.parent_hash, first.block_hash);
}

#[tokio::test(start_paused = true)]
async fn mined_block_event_triggers_immediate_check() {
    let rig = TestRig::new(
        1,
        Config {
            transition_check_interval: Duration::from_secs(3600),
            ..config()
        },
    );
    rig.consensus.start().unwrap();

    // Let the first poll see a chain below the threshold.
    while rig.engines[0].call_count(ETH_BLOCK_NUMBER) == 0 {
        sleep(Duration::from_millis(1)).await;
    }
    assert!(!rig.consensus.is_transition_reached());

    let mut terminal = None;
    for _ in 0..5 {
        terminal = Some(rig.mine(BLOCK_DIFFICULTY));
    }
    let terminal = terminal.unwrap();
    rig.consensus
        .mined_block_sender()
        .send(MinedBlock {
            number: terminal.block_number,
            total_difficulty: terminal.total_difficulty.unwrap(),
        })
        .await
        .unwrap();

    let found = rig
        .consensus
        .wait_for_transition(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(found, terminal);
}

#[tokio::test(start_paused = true)]
async fn wait_for_transition_times_out() {
    let rig = TestRig::new(1, config());
    rig.mine(BLOCK_DIFFICULTY);
    rig.consensus.start().unwrap();

    assert!(matches!(
        rig.consensus
            .wait_for_transition(Duration::from_secs(5))
            .await,
        Err(Error::TransitionTimeout(_))
    ));
    assert!(rig.consensus.terminal_block().is_none());
    assert_eq!(rig.consensus.first_pos_block_number(), None);
}

#[tokio::test(start_paused = true)]
async fn wait_for_transition_fails_fast_when_stopped() {
    let rig = TestRig::new(1, config());
    rig.mine(BLOCK_DIFFICULTY);
    rig.consensus.start().unwrap();
    let started = Instant::now();

    let (result, ()) = tokio::join!(
        rig.consensus.wait_for_transition(Duration::from_secs(600)),
        async {
            sleep(Duration::from_secs(2)).await;
            rig.consensus.stop();
        }
    );

    assert!(matches!(result, Err(Error::ProducerStopped)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn wait_for_transition_fails_fast_when_never_started() {
    let rig = TestRig::new(1, config());
    rig.consensus.stop();

    let started = Instant::now();
    assert!(matches!(
        rig.consensus
            .wait_for_transition(Duration::from_secs(600))
            .await,
        Err(Error::ProducerStopped)
    ));
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_is_recorded_before_final_phase_completes() {
    let rig = TestRig::new(
        2,
        Config {
            block_production_interval: Duration::from_millis(20),
            transition_check_interval: Duration::from_millis(10),
            ..config()
        },
    );
    for _ in 0..TERMINAL_TOTAL_DIFFICULTY / BLOCK_DIFFICULTY {
        rig.mine(BLOCK_DIFFICULTY);
    }
    rig.consensus.start().unwrap();
    rig.consensus
        .wait_for_transition(Duration::from_secs(5))
        .await
        .unwrap();

    let consensus = Arc::new(rig.consensus);
    let waiter = tokio::spawn({
        let consensus = consensus.clone();
        async move {
            for _ in 0..20 {
                let snapshot = consensus.await_final_phase().await.unwrap();
                assert_eq!(
                    consensus.prev_randao_at(snapshot.block_number),
                    Some(snapshot.prev_randao)
                );
                assert!(consensus.is_block_pos(snapshot.block_number));
            }
        }
    });

    for _ in 0..20 {
        let snapshot = consensus.await_final_phase().await.unwrap();
        assert_eq!(
            consensus.prev_randao_at(snapshot.block_number),
            Some(snapshot.prev_randao)
        );
        assert!(consensus.is_block_pos(snapshot.block_number));
        assert_eq!(consensus.first_pos_block_number(), Some(6));
    }
    waiter.await.unwrap();

    consensus.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn head_phase_completes_before_final_phase() {
    let rig = TestRig::new(2, config());
    for engine in &rig.engines {
        engine.set_latency(Duration::from_millis(10));
    }
    let terminal = rig.reach_transition().await;

    let consensus = Arc::new(rig.consensus);
    let waiter = |phase: Phase| {
        let consensus = consensus.clone();
        tokio::spawn(async move {
            let snapshot = consensus.await_phase(phase).await.unwrap();
            (snapshot, Instant::now())
        })
    };
    let head = waiter(Phase::Head);
    let safe = waiter(Phase::Safe);
    let finalized = waiter(Phase::Finalized);

    let (head, head_at) = head.await.unwrap();
    let (safe, safe_at) = safe.await.unwrap();
    let (finalized, finalized_at) = finalized.await.unwrap();

    assert_eq!(head.block_number, finalized.block_number);
    assert_eq!(safe.block_number, finalized.block_number);
    assert!(head_at < safe_at);
    assert!(safe_at < finalized_at);

    assert_eq!(
        head.forkchoice_state,
        ForkchoiceState {
            head_block_hash: head.block_hash,
            safe_block_hash: terminal.block_hash,
            finalized_block_hash: terminal.block_hash,
        }
    );
    assert_eq!(
        safe.forkchoice_state,
        ForkchoiceState {
            head_block_hash: safe.block_hash,
            safe_block_hash: safe.block_hash,
            finalized_block_hash: terminal.block_hash,
        }
    );
    assert_eq!(
        finalized.forkchoice_state,
        ForkchoiceState::all(finalized.block_hash)
    );
}

#[tokio::test(start_paused = true)]
async fn fee_recipient_applies_to_the_next_round() {
    let rig = TestRig::new(2, config());
    for engine in &rig.engines {
        engine.set_latency(Duration::from_millis(10));
    }
    rig.reach_transition().await;

    let consensus = Arc::new(rig.consensus);
    let fee_recipient = Address::repeat_byte(0xaa);

    // Reserve while block 7 is still being broadcast.
    let executing = loop {
        let snapshot = consensus.await_head_phase().await.unwrap();
        if snapshot.block_number == 7 {
            break snapshot;
        }
    };
    let reservation = tokio::spawn({
        let consensus = consensus.clone();
        async move { consensus.reserve_next_fee_recipient(fee_recipient).await }
    });

    let reserved = reservation.await.unwrap().unwrap();
    assert_eq!(reserved, 8);
    assert_eq!(executing.fee_recipient, Address::ZERO);

    let after = consensus.produce_blocks(1).await.unwrap();
    assert_eq!(after[0].block_number, 9);
    assert_eq!(after[0].fee_recipient, Address::ZERO);

    for peer in &rig.peers {
        verify_fee_recipient(peer, 7, Address::ZERO).await.unwrap();
        verify_fee_recipient(peer, 8, fee_recipient).await.unwrap();
        verify_fee_recipient(peer, 9, Address::ZERO).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn peer_removed_mid_broadcast_is_left_out() {
    let rig = TestRig::new(2, config());
    rig.reach_transition().await;
    rig.engines[1].set_latency(Duration::from_millis(500));

    let consensus = Arc::new(rig.consensus);
    let head = tokio::spawn({
        let consensus = consensus.clone();
        async move { consensus.await_head_phase().await }
    });
    let finalized = tokio::spawn({
        let consensus = consensus.clone();
        async move { consensus.await_final_phase().await }
    });

    // Remove the slow peer while its payload execution is in flight.
    while rig.engines[1].call_count(ENGINE_EXECUTE_PAYLOAD_V1) == 0 {
        sleep(Duration::from_millis(1)).await;
    }
    let forkchoice_calls = rig.engines[1].call_count(ENGINE_FORKCHOICE_UPDATED_V1);
    let removed = consensus.remove_peer(rig.peers[1].id()).unwrap();
    assert_eq!(removed.id(), rig.peers[1].id());
    // Its in-flight execution now fails, which must not count against it.
    rig.engines[1].set_offline(true);

    let head = head.await.unwrap().unwrap();
    let finalized = finalized.await.unwrap().unwrap();
    assert_eq!(head.block_number, finalized.block_number);

    for snapshot in [&head, &finalized] {
        assert_eq!(snapshot.payload_responses.len(), 1);
        assert_eq!(snapshot.payload_responses[0].peer, rig.peers[0].id());
        assert_eq!(snapshot.responses.len(), 1);
        assert_eq!(snapshot.responses[0].peer, rig.peers[0].id());
        assert_eq!(snapshot.disagreements().count(), 0);
    }

    assert!(rig.peers[1].is_retired());
    assert!(rig.peers[1].faults().is_empty());
    assert!(!rig.peers[1].is_degraded());
    assert_eq!(
        rig.engines[1].call_count(ENGINE_FORKCHOICE_UPDATED_V1),
        forkchoice_calls
    );
    verify_convergence(&rig.peers[..1], finalized.forkchoice_state)
        .await
        .unwrap();
    assert_ne!(
        rig.engines[1].forkchoice_state().head_block_hash,
        finalized.block_hash
    );
}

#[tokio::test(start_paused = true)]
async fn offline_peer_is_degraded_and_reported() {
    let rig = TestRig::new(2, config());
    rig.reach_transition().await;
    rig.engines[1].set_offline(true);

    let snapshots = rig.consensus.produce_blocks(2).await.unwrap();

    assert!(rig.peers[1].is_degraded());
    assert!(!rig.peers[0].is_degraded());
    for snapshot in &snapshots {
        let failed = snapshot
            .responses
            .iter()
            .find(|response| response.peer == rig.peers[1].id())
            .unwrap();
        assert!(matches!(failed.outcome, PeerOutcome::Failed(_)));
        assert_eq!(failed.client, "engine_1");
        assert_eq!(snapshot.disagreements().count(), 2);
    }
    verify_convergence(&rig.peers[..1], snapshots[1].forkchoice_state)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn no_peers_halts_production() {
    let rig = TestRig::new(1, config());
    rig.reach_transition().await;
    rig.consensus.remove_peer(rig.peers[0].id()).unwrap();

    assert!(matches!(
        rig.consensus.await_head_phase().await,
        Err(Error::ProducerStopped)
    ));
    assert!(matches!(rig.consensus.shutdown().await, Err(Error::NoPeers)));
}

#[tokio::test(start_paused = true)]
async fn stop_releases_waiters() {
    let rig = TestRig::new(1, config());
    rig.reach_transition().await;

    let consensus = Arc::new(rig.consensus);
    let waiter = tokio::spawn({
        let consensus = consensus.clone();
        async move { consensus.await_final_phase().await }
    });
    tokio::task::yield_now().await;

    consensus.shutdown().await.unwrap();

    assert!(matches!(waiter.await.unwrap(), Err(Error::ProducerStopped)));
    assert!(matches!(
        consensus.reserve_next_fee_recipient(Address::repeat_byte(1)).await,
        Err(Error::ProducerStopped)
    ));
    assert!(matches!(
        consensus.produce_blocks(1).await,
        Err(Error::ProducerStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_before_start_releases_waiters() {
    let rig = TestRig::new(1, config());
    let consensus = Arc::new(rig.consensus);

    let waiter = tokio::spawn({
        let consensus = consensus.clone();
        async move { consensus.await_head_phase().await }
    });
    let reservation = tokio::spawn({
        let consensus = consensus.clone();
        async move {
            consensus
                .reserve_next_fee_recipient(Address::repeat_byte(2))
                .await
        }
    });
    tokio::task::yield_now().await;

    consensus.stop();

    assert!(matches!(waiter.await.unwrap(), Err(Error::ProducerStopped)));
    assert!(matches!(reservation.await.unwrap(), Err(Error::ProducerStopped)));
    assert!(matches!(consensus.start(), Err(Error::AlreadyStarted)));
}

#[tokio::test(start_paused = true)]
async fn start_twice_is_rejected() {
    let rig = TestRig::new(1, config());
    rig.consensus.start().unwrap();

    assert!(matches!(rig.consensus.start(), Err(Error::AlreadyStarted)));
    rig.consensus.shutdown().await.unwrap();
}

#[test]
fn invalid_config_is_rejected() {
    let config = Config {
        transition_check_interval: Duration::ZERO,
        ..config()
    };
    assert!(matches!(MockConsensus::new(config), Err(Error::InvalidConfig(_))));
}

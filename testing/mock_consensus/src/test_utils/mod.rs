//! Provides an in-memory execution client for testing the consensus driver without
//! running real clients.

use crate::engine_api::http::{
    ENGINE_EXECUTE_PAYLOAD_V1, ENGINE_FORKCHOICE_UPDATED_V1, ENGINE_GET_PAYLOAD_V1,
    ETH_BLOCK_NUMBER, ETH_GET_BALANCE, ETH_GET_BLOCK_BY_HASH, ETH_GET_BLOCK_BY_NUMBER,
    ETH_GET_STORAGE_AT, ETH_GET_TRANSACTION_COUNT,
};
use crate::engine_api::{
    BlockQuery, EngineApi, Error, ExecutePayloadResponse, ExecutePayloadStatus,
    ExecutionBlockHeader, ExecutionPayload, ForkchoiceState, ForkchoiceUpdatedResponse,
    ForkchoiceUpdatedStatus, PayloadAttributes, PayloadId,
};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use execution_block_generator::{
    Block, ExecutionBlockGenerator, payload_block_hash, pow_block_hash,
};

mod execution_block_generator;

/// An `EngineApi` backed by an `ExecutionBlockGenerator`, with knobs to make it misbehave.
pub struct MockExecutionEngine {
    generator: Mutex<ExecutionBlockGenerator>,
    offline: AtomicBool,
    latency: Mutex<Duration>,
    forkchoice_status_override: Mutex<Option<ForkchoiceUpdatedStatus>>,
    payload_status_override: Mutex<Option<ExecutePayloadStatus>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MockExecutionEngine {
    pub fn new(genesis_difficulty: U256) -> Self {
        Self {
            generator: Mutex::new(ExecutionBlockGenerator::new(genesis_difficulty)),
            offline: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            forkchoice_status_override: Mutex::new(None),
            payload_status_override: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn mine_pow_block(&self, difficulty: U256) -> Result<ExecutionBlockHeader, String> {
        self.generator.lock().insert_pow_block(difficulty)
    }

    /// Makes every call fail as if the client could not be reached.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delays every call by `latency` before it is handled.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Answers fork choice updates with `status` without applying them.
    pub fn set_forkchoice_status_override(&self, status: Option<ForkchoiceUpdatedStatus>) {
        *self.forkchoice_status_override.lock() = status;
    }

    /// Answers payload executions with `status` without importing the payload.
    pub fn set_payload_status_override(&self, status: Option<ExecutePayloadStatus>) {
        *self.payload_status_override.lock() = status;
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or_default()
    }

    pub fn forkchoice_state(&self) -> ForkchoiceState {
        self.generator.lock().forkchoice_state()
    }

    pub fn header(&self, query: BlockQuery) -> Option<ExecutionBlockHeader> {
        self.generator.lock().header(query)
    }

    pub fn block_by_hash(&self, block_hash: B256) -> Option<Block> {
        self.generator.lock().block_by_hash(block_hash).cloned()
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.generator.lock().set_balance(address, balance);
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.generator.lock().set_nonce(address, nonce);
    }

    pub fn set_storage(&self, address: Address, slot: B256, value: B256) {
        self.generator.lock().set_storage(address, slot, value);
    }

    /// Counts the call, applies the configured latency and fails if offline.
    async fn begin(&self, method: &'static str) -> Result<(), Error> {
        *self.calls.lock().entry(method).or_default() += 1;

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::EngineOffline(format!("{method} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineApi for MockExecutionEngine {
    async fn forkchoice_updated_v1(
        &self,
        forkchoice_state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> Result<ForkchoiceUpdatedResponse, Error> {
        self.begin(ENGINE_FORKCHOICE_UPDATED_V1).await?;

        if let Some(status) = self.forkchoice_status_override.lock().clone() {
            return Ok(ForkchoiceUpdatedResponse {
                status,
                payload_id: None,
            });
        }

        Ok(self
            .generator
            .lock()
            .forkchoice_updated(forkchoice_state, payload_attributes))
    }

    async fn get_payload_v1(&self, payload_id: PayloadId) -> Result<ExecutionPayload, Error> {
        self.begin(ENGINE_GET_PAYLOAD_V1).await?;

        self.generator
            .lock()
            .get_payload(&payload_id)
            .ok_or(Error::PayloadIdUnavailable)
    }

    async fn execute_payload_v1(
        &self,
        execution_payload: &ExecutionPayload,
    ) -> Result<ExecutePayloadResponse, Error> {
        self.begin(ENGINE_EXECUTE_PAYLOAD_V1).await?;

        if let Some(status) = self.payload_status_override.lock().clone() {
            return Ok(ExecutePayloadResponse {
                status,
                latest_valid_hash: None,
                validation_error: None,
            });
        }

        Ok(self
            .generator
            .lock()
            .execute_payload(execution_payload.clone()))
    }

    async fn block_number(&self) -> Result<u64, Error> {
        self.begin(ETH_BLOCK_NUMBER).await?;

        self.generator
            .lock()
            .head_block()
            .map(Block::block_number)
            .ok_or(Error::BlockNotFound(BlockQuery::Latest))
    }

    async fn get_header(&self, query: BlockQuery) -> Result<Option<ExecutionBlockHeader>, Error> {
        self.begin(ETH_GET_BLOCK_BY_NUMBER).await?;
        Ok(self.generator.lock().header(query))
    }

    async fn get_header_by_hash(
        &self,
        block_hash: B256,
    ) -> Result<Option<ExecutionBlockHeader>, Error> {
        self.begin(ETH_GET_BLOCK_BY_HASH).await?;
        Ok(self
            .generator
            .lock()
            .block_by_hash(block_hash)
            .map(Block::header))
    }

    async fn balance_at(&self, address: Address, _block: BlockQuery) -> Result<U256, Error> {
        self.begin(ETH_GET_BALANCE).await?;
        Ok(self.generator.lock().balance(address))
    }

    async fn nonce_at(&self, address: Address, _block: BlockQuery) -> Result<u64, Error> {
        self.begin(ETH_GET_TRANSACTION_COUNT).await?;
        Ok(self.generator.lock().nonce(address))
    }

    async fn storage_at(
        &self,
        address: Address,
        slot: B256,
        _block: BlockQuery,
    ) -> Result<B256, Error> {
        self.begin(ETH_GET_STORAGE_AT).await?;
        Ok(self.generator.lock().storage(address, slot))
    }
}

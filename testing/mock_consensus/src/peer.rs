//! A handle on one execution client under test.
//!
//! Every call runs under the configured per-call timeout. A failed call is recorded as a
//! `PeerFault` and logged against the client and test names; the peer is then considered
//! degraded and is no longer picked to build blocks or to poll for the transition.
//! Once removed from the registry a peer is retired and its failures are only logged at
//! debug level.

use crate::Error;
use crate::engine_api::http::{
    ENGINE_EXECUTE_PAYLOAD_V1, ENGINE_FORKCHOICE_UPDATED_V1, ENGINE_GET_PAYLOAD_V1,
    ETH_BLOCK_NUMBER, ETH_GET_BALANCE, ETH_GET_BLOCK_BY_HASH, ETH_GET_BLOCK_BY_NUMBER,
    ETH_GET_STORAGE_AT, ETH_GET_TRANSACTION_COUNT,
};
use crate::engine_api::{
    self, BlockQuery, EngineApi, ExecutePayloadResponse, ExecutionBlockHeader, ExecutionPayload,
    ForkchoiceState, ForkchoiceUpdatedResponse, HttpJsonRpc, PayloadAttributes, PayloadId,
};
use alloy_primitives::{Address, B256, U256};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A failed call, kept on the peer for later assertion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerFault {
    pub method: &'static str,
    pub error: String,
}

pub struct Peer {
    id: PeerId,
    client_name: String,
    test_name: String,
    engine: Arc<dyn EngineApi>,
    rpc_timeout: Duration,
    faults: Mutex<Vec<PeerFault>>,
    retired: AtomicBool,
}

impl Peer {
    pub fn new(
        client_name: impl Into<String>,
        test_name: impl Into<String>,
        engine: Arc<dyn EngineApi>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            id: PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)),
            client_name: client_name.into(),
            test_name: test_name.into(),
            engine,
            rpc_timeout,
            faults: Mutex::new(vec![]),
            retired: AtomicBool::new(false),
        }
    }

    /// Connects to a client's Engine API over HTTP.
    pub fn http(
        client_name: impl Into<String>,
        test_name: impl Into<String>,
        url: Url,
        rpc_timeout: Duration,
    ) -> Result<Self, Error> {
        let client_name = client_name.into();
        let engine = HttpJsonRpc::new(url).map_err(|error| Error::Engine {
            peer: client_name.clone(),
            method: "connect",
            error,
        })?;
        Ok(Self::new(client_name, test_name, Arc::new(engine), rpc_timeout))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn faults(&self) -> Vec<PeerFault> {
        self.faults.lock().clone()
    }

    pub fn is_degraded(&self) -> bool {
        !self.faults.lock().is_empty()
    }

    /// True once the peer has been removed from the registry.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Failures of calls still in flight after this are neither logged as errors nor
    /// recorded as faults.
    pub(crate) fn set_retired(&self, retired: bool) {
        self.retired.store(retired, Ordering::SeqCst);
    }

    async fn call<T, F>(&self, method: &'static str, request: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, engine_api::Error>>,
    {
        let error = match tokio::time::timeout(self.rpc_timeout, request).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(error)) => error,
            Err(_) => engine_api::Error::Timeout {
                method,
                timeout: self.rpc_timeout,
            },
        };

        if self.is_retired() {
            debug!(
                peer = %self.client_name,
                method,
                ?error,
                "Call to removed peer failed"
            );
        } else {
            error!(
                peer = %self.client_name,
                test = %self.test_name,
                method,
                ?error,
                "Execution client call failed"
            );
            self.faults.lock().push(PeerFault {
                method,
                error: format!("{error:?}"),
            });
        }

        Err(Error::Engine {
            peer: self.client_name.clone(),
            method,
            error,
        })
    }

    pub async fn forkchoice_updated(
        &self,
        forkchoice_state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> Result<ForkchoiceUpdatedResponse, Error> {
        debug!(
            peer = %self.client_name,
            head = %forkchoice_state.head_block_hash,
            with_attributes = payload_attributes.is_some(),
            "Sending forkchoice update"
        );
        self.call(
            ENGINE_FORKCHOICE_UPDATED_V1,
            self.engine.forkchoice_updated_v1(forkchoice_state, payload_attributes),
        )
        .await
    }

    pub async fn get_payload(&self, payload_id: PayloadId) -> Result<ExecutionPayload, Error> {
        self.call(
            ENGINE_GET_PAYLOAD_V1,
            self.engine.get_payload_v1(payload_id),
        )
        .await
    }

    pub async fn execute_payload(
        &self,
        execution_payload: &ExecutionPayload,
    ) -> Result<ExecutePayloadResponse, Error> {
        self.call(
            ENGINE_EXECUTE_PAYLOAD_V1,
            self.engine.execute_payload_v1(execution_payload),
        )
        .await
    }

    pub async fn block_number(&self) -> Result<u64, Error> {
        self.call(ETH_BLOCK_NUMBER, self.engine.block_number())
            .await
    }

    pub async fn header(&self, query: BlockQuery) -> Result<Option<ExecutionBlockHeader>, Error> {
        self.call(ETH_GET_BLOCK_BY_NUMBER, self.engine.get_header(query))
            .await
    }

    /// Like `header`, but a missing block is an error.
    pub async fn existing_header(&self, query: BlockQuery) -> Result<ExecutionBlockHeader, Error> {
        self.header(query).await?.ok_or_else(|| Error::BlockNotFound {
            peer: self.client_name.clone(),
            query,
        })
    }

    pub async fn header_by_number(
        &self,
        block_number: u64,
    ) -> Result<Option<ExecutionBlockHeader>, Error> {
        self.header(BlockQuery::Number(block_number)).await
    }

    pub async fn header_by_hash(
        &self,
        block_hash: B256,
    ) -> Result<Option<ExecutionBlockHeader>, Error> {
        self.call(
            ETH_GET_BLOCK_BY_HASH,
            self.engine.get_header_by_hash(block_hash),
        )
        .await
    }

    /// Total difficulty of the chain up to and including `block_hash`, as the peer reports it.
    pub async fn chain_weight_of(&self, block_hash: B256) -> Result<Option<U256>, Error> {
        Ok(self
            .header_by_hash(block_hash)
            .await?
            .and_then(|header| header.total_difficulty))
    }

    pub async fn balance_at(&self, address: Address, block: BlockQuery) -> Result<U256, Error> {
        self.call(ETH_GET_BALANCE, self.engine.balance_at(address, block))
            .await
    }

    pub async fn nonce_at(&self, address: Address, block: BlockQuery) -> Result<u64, Error> {
        self.call(
            ETH_GET_TRANSACTION_COUNT,
            self.engine.nonce_at(address, block),
        )
        .await
    }

    pub async fn storage_at(
        &self,
        address: Address,
        slot: B256,
        block: BlockQuery,
    ) -> Result<B256, Error> {
        self.call(
            ETH_GET_STORAGE_AT,
            self.engine.storage_at(address, slot, block),
        )
        .await
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("client_name", &self.client_name)
            .field("test_name", &self.test_name)
            .field("degraded", &self.is_degraded())
            .field("retired", &self.is_retired())
            .finish()
    }
}

//! Types and the `EngineApi` trait shared by the HTTP client and the in-memory engine.
//!
//! Field names, hash encodings and status literals follow the execution client's Engine API
//! verbatim. Statuses the harness does not know are preserved as `Other(String)` rather than
//! rejected, so a client under test can never be masked by our own parsing.

use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

pub mod http;
pub mod json_structures;

pub use http::HttpJsonRpc;

/// Opaque identifier returned by `engine_forkchoiceUpdatedV1`, echoed back verbatim.
pub type PayloadId = Bytes;

pub const FORKCHOICE_STATUS_SUCCESS: &str = "SUCCESS";
pub const FORKCHOICE_STATUS_SYNCING: &str = "SYNCING";

pub const PAYLOAD_STATUS_VALID: &str = "VALID";
pub const PAYLOAD_STATUS_INVALID: &str = "INVALID";
pub const PAYLOAD_STATUS_SYNCING: &str = "SYNCING";
pub const PAYLOAD_STATUS_ACCEPTED: &str = "ACCEPTED";
pub const PAYLOAD_STATUS_INVALID_BLOCK_HASH: &str = "INVALID_BLOCK_HASH";

#[derive(Debug)]
pub enum Error {
    HttpClient(reqwest::Error),
    Json(serde_json::Error),
    ServerMessage { code: i64, message: String },
    Timeout {
        method: &'static str,
        timeout: Duration,
    },
    BadResponse(String),
    BlockNotFound(BlockQuery),
    PayloadIdUnavailable,
    /// The engine could not be reached at all.
    EngineOffline(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::HttpClient(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

/// The `(head, safe, finalized)` triple sent with every fork choice update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ForkchoiceState {
    pub head_block_hash: B256,
    pub safe_block_hash: B256,
    pub finalized_block_hash: B256,
}

impl ForkchoiceState {
    /// A state where all three references point at `block_hash`.
    pub fn all(block_hash: B256) -> Self {
        Self {
            head_block_hash: block_hash,
            safe_block_hash: block_hash,
            finalized_block_hash: block_hash,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadAttributes {
    pub timestamp: u64,
    pub prev_randao: B256,
    pub suggested_fee_recipient: Address,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionPayload {
    pub parent_hash: B256,
    pub fee_recipient: Address,
    pub state_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bytes,
    pub prev_randao: B256,
    pub block_number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub base_fee_per_gas: U256,
    pub block_hash: B256,
    pub transactions: Vec<Bytes>,
}

/// The subset of an execution block header the harness reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionBlockHeader {
    pub block_hash: B256,
    pub parent_hash: B256,
    pub block_number: u64,
    pub timestamp: u64,
    pub difficulty: U256,
    pub total_difficulty: Option<U256>,
    pub mix_hash: B256,
    pub fee_recipient: Address,
}

/// Selects a block for `eth_getBlockByNumber` and state queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockQuery {
    Latest,
    Safe,
    Finalized,
    Number(u64),
}

impl Serialize for BlockQuery {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BlockQuery::Latest => serializer.serialize_str("latest"),
            BlockQuery::Safe => serializer.serialize_str("safe"),
            BlockQuery::Finalized => serializer.serialize_str("finalized"),
            BlockQuery::Number(number) => serializer.serialize_str(&format!("{number:#x}")),
        }
    }
}

impl fmt::Display for BlockQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockQuery::Latest => write!(f, "latest"),
            BlockQuery::Safe => write!(f, "safe"),
            BlockQuery::Finalized => write!(f, "finalized"),
            BlockQuery::Number(number) => write!(f, "{number}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForkchoiceUpdatedStatus {
    Success,
    Syncing,
    Other(String),
}

impl ForkchoiceUpdatedStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ForkchoiceUpdatedStatus::Success => FORKCHOICE_STATUS_SUCCESS,
            ForkchoiceUpdatedStatus::Syncing => FORKCHOICE_STATUS_SYNCING,
            ForkchoiceUpdatedStatus::Other(status) => status,
        }
    }
}

impl From<String> for ForkchoiceUpdatedStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            FORKCHOICE_STATUS_SUCCESS => ForkchoiceUpdatedStatus::Success,
            FORKCHOICE_STATUS_SYNCING => ForkchoiceUpdatedStatus::Syncing,
            _ => ForkchoiceUpdatedStatus::Other(status),
        }
    }
}

impl From<ForkchoiceUpdatedStatus> for String {
    fn from(status: ForkchoiceUpdatedStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutePayloadStatus {
    Valid,
    Invalid,
    Syncing,
    Accepted,
    InvalidBlockHash,
    Other(String),
}

impl ExecutePayloadStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ExecutePayloadStatus::Valid => PAYLOAD_STATUS_VALID,
            ExecutePayloadStatus::Invalid => PAYLOAD_STATUS_INVALID,
            ExecutePayloadStatus::Syncing => PAYLOAD_STATUS_SYNCING,
            ExecutePayloadStatus::Accepted => PAYLOAD_STATUS_ACCEPTED,
            ExecutePayloadStatus::InvalidBlockHash => PAYLOAD_STATUS_INVALID_BLOCK_HASH,
            ExecutePayloadStatus::Other(status) => status,
        }
    }
}

impl From<String> for ExecutePayloadStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            PAYLOAD_STATUS_VALID => ExecutePayloadStatus::Valid,
            PAYLOAD_STATUS_INVALID => ExecutePayloadStatus::Invalid,
            PAYLOAD_STATUS_SYNCING => ExecutePayloadStatus::Syncing,
            PAYLOAD_STATUS_ACCEPTED => ExecutePayloadStatus::Accepted,
            PAYLOAD_STATUS_INVALID_BLOCK_HASH => ExecutePayloadStatus::InvalidBlockHash,
            _ => ExecutePayloadStatus::Other(status),
        }
    }
}

impl From<ExecutePayloadStatus> for String {
    fn from(status: ExecutePayloadStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkchoiceUpdatedResponse {
    pub status: ForkchoiceUpdatedStatus,
    pub payload_id: Option<PayloadId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutePayloadResponse {
    pub status: ExecutePayloadStatus,
    pub latest_valid_hash: Option<B256>,
    pub validation_error: Option<String>,
}

/// The calls the harness issues against one execution client.
///
/// Implemented by `HttpJsonRpc` for real clients and by `MockExecutionEngine` in tests.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn forkchoice_updated_v1(
        &self,
        forkchoice_state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> Result<ForkchoiceUpdatedResponse, Error>;

    async fn get_payload_v1(&self, payload_id: PayloadId) -> Result<ExecutionPayload, Error>;

    async fn execute_payload_v1(
        &self,
        execution_payload: &ExecutionPayload,
    ) -> Result<ExecutePayloadResponse, Error>;

    async fn block_number(&self) -> Result<u64, Error>;

    async fn get_header(&self, query: BlockQuery) -> Result<Option<ExecutionBlockHeader>, Error>;

    async fn get_header_by_hash(
        &self,
        block_hash: B256,
    ) -> Result<Option<ExecutionBlockHeader>, Error>;

    async fn balance_at(&self, address: Address, block: BlockQuery) -> Result<U256, Error>;

    async fn nonce_at(&self, address: Address, block: BlockQuery) -> Result<u64, Error>;

    async fn storage_at(
        &self,
        address: Address,
        slot: B256,
        block: BlockQuery,
    ) -> Result<B256, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_query_serializes_as_tag_or_quantity() {
        assert_eq!(
            serde_json::to_value(BlockQuery::Latest).unwrap(),
            serde_json::json!("latest")
        );
        assert_eq!(
            serde_json::to_value(BlockQuery::Finalized).unwrap(),
            serde_json::json!("finalized")
        );
        assert_eq!(
            serde_json::to_value(BlockQuery::Number(0)).unwrap(),
            serde_json::json!("0x0")
        );
        assert_eq!(
            serde_json::to_value(BlockQuery::Number(255)).unwrap(),
            serde_json::json!("0xff")
        );
    }

    #[test]
    fn unknown_statuses_are_preserved() {
        let status = ExecutePayloadStatus::from("INVALID_TERMINAL_BLOCK".to_string());
        assert_eq!(
            status,
            ExecutePayloadStatus::Other("INVALID_TERMINAL_BLOCK".to_string())
        );
        assert_eq!(status.as_str(), "INVALID_TERMINAL_BLOCK");

        assert_eq!(
            ForkchoiceUpdatedStatus::from("SUCCESS".to_string()),
            ForkchoiceUpdatedStatus::Success
        );
        assert_eq!(String::from(ExecutePayloadStatus::Valid), "VALID");
    }
}

use super::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRequestBody<'a> {
    pub jsonrpc: &'a str,
    pub method: &'a str,
    pub params: serde_json::Value,
    pub id: serde_json::Value,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonResponseBody {
    pub jsonrpc: String,
    #[serde(default)]
    pub error: Option<JsonError>,
    #[serde(default)]
    pub result: serde_json::Value,
    pub id: serde_json::Value,
}

/// A bare hex quantity, as returned by `eth_blockNumber` and `eth_getTransactionCount`.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonQuantity(#[serde(with = "serde_utils::u64_hex_be")] pub u64);

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonForkchoiceStateV1 {
    pub head_block_hash: B256,
    pub safe_block_hash: B256,
    pub finalized_block_hash: B256,
}

impl From<ForkchoiceState> for JsonForkchoiceStateV1 {
    fn from(f: ForkchoiceState) -> Self {
        // Use this verbose deconstruction pattern to ensure no field is left unused.
        let ForkchoiceState {
            head_block_hash,
            safe_block_hash,
            finalized_block_hash,
        } = f;

        Self {
            head_block_hash,
            safe_block_hash,
            finalized_block_hash,
        }
    }
}

impl From<JsonForkchoiceStateV1> for ForkchoiceState {
    fn from(j: JsonForkchoiceStateV1) -> Self {
        let JsonForkchoiceStateV1 {
            head_block_hash,
            safe_block_hash,
            finalized_block_hash,
        } = j;

        Self {
            head_block_hash,
            safe_block_hash,
            finalized_block_hash,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonPayloadAttributesV1 {
    #[serde(with = "serde_utils::u64_hex_be")]
    pub timestamp: u64,
    pub random: B256,
    pub suggested_fee_recipient: Address,
}

impl From<PayloadAttributes> for JsonPayloadAttributesV1 {
    fn from(p: PayloadAttributes) -> Self {
        let PayloadAttributes {
            timestamp,
            prev_randao,
            suggested_fee_recipient,
        } = p;

        Self {
            timestamp,
            random: prev_randao,
            suggested_fee_recipient,
        }
    }
}

impl From<JsonPayloadAttributesV1> for PayloadAttributes {
    fn from(j: JsonPayloadAttributesV1) -> Self {
        let JsonPayloadAttributesV1 {
            timestamp,
            random,
            suggested_fee_recipient,
        } = j;

        Self {
            timestamp,
            prev_randao: random,
            suggested_fee_recipient,
        }
    }
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonExecutionPayloadV1 {
    pub parent_hash: B256,
    pub fee_recipient: Address,
    pub state_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bytes,
    pub random: B256,
    #[serde(with = "serde_utils::u64_hex_be")]
    pub block_number: u64,
    #[serde(with = "serde_utils::u64_hex_be")]
    pub gas_limit: u64,
    #[serde(with = "serde_utils::u64_hex_be")]
    pub gas_used: u64,
    #[serde(with = "serde_utils::u64_hex_be")]
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub base_fee_per_gas: U256,
    pub block_hash: B256,
    #[serde(default)]
    pub transactions: Vec<Bytes>,
}

impl From<ExecutionPayload> for JsonExecutionPayloadV1 {
    fn from(e: ExecutionPayload) -> Self {
        // Use this verbose deconstruction pattern to ensure no field is left unused.
        let ExecutionPayload {
            parent_hash,
            fee_recipient,
            state_root,
            receipts_root,
            logs_bloom,
            prev_randao,
            block_number,
            gas_limit,
            gas_used,
            timestamp,
            extra_data,
            base_fee_per_gas,
            block_hash,
            transactions,
        } = e;

        Self {
            parent_hash,
            fee_recipient,
            state_root,
            receipts_root,
            logs_bloom,
            random: prev_randao,
            block_number,
            gas_limit,
            gas_used,
            timestamp,
            extra_data,
            base_fee_per_gas,
            block_hash,
            transactions,
        }
    }
}

impl From<JsonExecutionPayloadV1> for ExecutionPayload {
    fn from(j: JsonExecutionPayloadV1) -> Self {
        // Use this verbose deconstruction pattern to ensure no field is left unused.
        let JsonExecutionPayloadV1 {
            parent_hash,
            fee_recipient,
            state_root,
            receipts_root,
            logs_bloom,
            random,
            block_number,
            gas_limit,
            gas_used,
            timestamp,
            extra_data,
            base_fee_per_gas,
            block_hash,
            transactions,
        } = j;

        Self {
            parent_hash,
            fee_recipient,
            state_root,
            receipts_root,
            logs_bloom,
            prev_randao: random,
            block_number,
            gas_limit,
            gas_used,
            timestamp,
            extra_data,
            base_fee_per_gas,
            block_hash,
            transactions,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonForkchoiceUpdatedV1Response {
    pub status: String,
    #[serde(default)]
    pub payload_id: Option<Bytes>,
}

impl From<JsonForkchoiceUpdatedV1Response> for ForkchoiceUpdatedResponse {
    fn from(j: JsonForkchoiceUpdatedV1Response) -> Self {
        let JsonForkchoiceUpdatedV1Response { status, payload_id } = j;

        Self {
            status: status.into(),
            payload_id,
        }
    }
}

impl From<ForkchoiceUpdatedResponse> for JsonForkchoiceUpdatedV1Response {
    fn from(r: ForkchoiceUpdatedResponse) -> Self {
        let ForkchoiceUpdatedResponse { status, payload_id } = r;

        Self {
            status: status.into(),
            payload_id,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonExecutePayloadV1Response {
    pub status: String,
    #[serde(default)]
    pub latest_valid_hash: Option<B256>,
    #[serde(default)]
    pub validation_error: Option<String>,
}

impl From<JsonExecutePayloadV1Response> for ExecutePayloadResponse {
    fn from(j: JsonExecutePayloadV1Response) -> Self {
        let JsonExecutePayloadV1Response {
            status,
            latest_valid_hash,
            validation_error,
        } = j;

        Self {
            status: status.into(),
            latest_valid_hash,
            validation_error,
        }
    }
}

impl From<ExecutePayloadResponse> for JsonExecutePayloadV1Response {
    fn from(r: ExecutePayloadResponse) -> Self {
        let ExecutePayloadResponse {
            status,
            latest_valid_hash,
            validation_error,
        } = r;

        Self {
            status: status.into(),
            latest_valid_hash,
            validation_error,
        }
    }
}

/// The header fields of an `eth_getBlockByNumber`/`eth_getBlockByHash` response.
///
/// Every other field of the block object is ignored.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonExecutionBlockHeader {
    #[serde(rename = "hash")]
    pub block_hash: B256,
    pub parent_hash: B256,
    #[serde(rename = "number", with = "serde_utils::u64_hex_be")]
    pub block_number: u64,
    #[serde(with = "serde_utils::u64_hex_be")]
    pub timestamp: u64,
    pub difficulty: U256,
    #[serde(default)]
    pub total_difficulty: Option<U256>,
    #[serde(default)]
    pub mix_hash: B256,
    #[serde(rename = "miner")]
    pub fee_recipient: Address,
}

impl From<JsonExecutionBlockHeader> for ExecutionBlockHeader {
    fn from(j: JsonExecutionBlockHeader) -> Self {
        let JsonExecutionBlockHeader {
            block_hash,
            parent_hash,
            block_number,
            timestamp,
            difficulty,
            total_difficulty,
            mix_hash,
            fee_recipient,
        } = j;

        Self {
            block_hash,
            parent_hash,
            block_number,
            timestamp,
            difficulty,
            total_difficulty,
            mix_hash,
            fee_recipient,
        }
    }
}

impl From<ExecutionBlockHeader> for JsonExecutionBlockHeader {
    fn from(h: ExecutionBlockHeader) -> Self {
        let ExecutionBlockHeader {
            block_hash,
            parent_hash,
            block_number,
            timestamp,
            difficulty,
            total_difficulty,
            mix_hash,
            fee_recipient,
        } = h;

        Self {
            block_hash,
            parent_hash,
            block_number,
            timestamp,
            difficulty,
            total_difficulty,
            mix_hash,
            fee_recipient,
        }
    }
}

//! Contains an implementation of `EngineApi` using the JSON-RPC API via HTTP.

use super::*;
use json_structures::*;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

const STATIC_ID: u32 = 1;
pub const JSONRPC_VERSION: &str = "2.0";

pub const ETH_BLOCK_NUMBER: &str = "eth_blockNumber";
pub const ETH_GET_BLOCK_BY_NUMBER: &str = "eth_getBlockByNumber";
pub const ETH_GET_BLOCK_BY_HASH: &str = "eth_getBlockByHash";
pub const ETH_GET_BALANCE: &str = "eth_getBalance";
pub const ETH_GET_TRANSACTION_COUNT: &str = "eth_getTransactionCount";
pub const ETH_GET_STORAGE_AT: &str = "eth_getStorageAt";

pub const ENGINE_FORKCHOICE_UPDATED_V1: &str = "engine_forkchoiceUpdatedV1";
pub const ENGINE_GET_PAYLOAD_V1: &str = "engine_getPayloadV1";
pub const ENGINE_EXECUTE_PAYLOAD_V1: &str = "engine_executePayloadV1";

/// Upper bound applied by reqwest itself. Callers normally impose a tighter one per call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Determines whether transaction bodies are included in `eth_getBlockBy*` responses.
const RETURN_FULL_TRANSACTION_OBJECTS: bool = false;

pub struct HttpJsonRpc {
    pub client: reqwest::Client,
    pub url: Url,
    request_timeout: Duration,
}

impl HttpJsonRpc {
    pub fn new(url: Url) -> Result<Self, Error> {
        Self::new_with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn new_with_timeout(url: Url, request_timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url,
            request_timeout,
        })
    }

    pub async fn rpc_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, Error> {
        let body = JsonRequestBody {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id: json!(STATIC_ID),
        };

        let body: JsonResponseBody = self
            .client
            .post(self.url.clone())
            .timeout(self.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match (body.result, body.error) {
            (result, None) => serde_json::from_value(result).map_err(Into::into),
            (_, Some(error)) => Err(Error::ServerMessage {
                code: error.code,
                message: error.message,
            }),
        }
    }
}

impl std::fmt::Display for HttpJsonRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[async_trait]
impl EngineApi for HttpJsonRpc {
    async fn forkchoice_updated_v1(
        &self,
        forkchoice_state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> Result<ForkchoiceUpdatedResponse, Error> {
        let params = json!([
            JsonForkchoiceStateV1::from(forkchoice_state),
            payload_attributes.map(JsonPayloadAttributesV1::from)
        ]);

        let response: JsonForkchoiceUpdatedV1Response = self
            .rpc_request(ENGINE_FORKCHOICE_UPDATED_V1, params)
            .await?;

        Ok(response.into())
    }

    async fn get_payload_v1(&self, payload_id: PayloadId) -> Result<ExecutionPayload, Error> {
        let params = json!([payload_id]);

        let response: JsonExecutionPayloadV1 =
            self.rpc_request(ENGINE_GET_PAYLOAD_V1, params).await?;

        Ok(response.into())
    }

    async fn execute_payload_v1(
        &self,
        execution_payload: &ExecutionPayload,
    ) -> Result<ExecutePayloadResponse, Error> {
        let params = json!([JsonExecutionPayloadV1::from(execution_payload.clone())]);

        let response: JsonExecutePayloadV1Response =
            self.rpc_request(ENGINE_EXECUTE_PAYLOAD_V1, params).await?;

        Ok(response.into())
    }

    async fn block_number(&self) -> Result<u64, Error> {
        let response: JsonQuantity = self.rpc_request(ETH_BLOCK_NUMBER, json!([])).await?;
        Ok(response.0)
    }

    async fn get_header(&self, query: BlockQuery) -> Result<Option<ExecutionBlockHeader>, Error> {
        let params = json!([query, RETURN_FULL_TRANSACTION_OBJECTS]);

        let response: Option<JsonExecutionBlockHeader> =
            self.rpc_request(ETH_GET_BLOCK_BY_NUMBER, params).await?;

        Ok(response.map(Into::into))
    }

    async fn get_header_by_hash(
        &self,
        block_hash: B256,
    ) -> Result<Option<ExecutionBlockHeader>, Error> {
        let params = json!([block_hash, RETURN_FULL_TRANSACTION_OBJECTS]);

        let response: Option<JsonExecutionBlockHeader> =
            self.rpc_request(ETH_GET_BLOCK_BY_HASH, params).await?;

        Ok(response.map(Into::into))
    }

    async fn balance_at(&self, address: Address, block: BlockQuery) -> Result<U256, Error> {
        self.rpc_request(ETH_GET_BALANCE, json!([address, block]))
            .await
    }

    async fn nonce_at(&self, address: Address, block: BlockQuery) -> Result<u64, Error> {
        let response: JsonQuantity = self
            .rpc_request(ETH_GET_TRANSACTION_COUNT, json!([address, block]))
            .await?;
        Ok(response.0)
    }

    async fn storage_at(
        &self,
        address: Address,
        slot: B256,
        block: BlockQuery,
    ) -> Result<B256, Error> {
        self.rpc_request(ETH_GET_STORAGE_AT, json!([address, slot, block]))
            .await
    }
}

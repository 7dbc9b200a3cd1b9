use crate::engine_api::{
    BlockQuery, ExecutePayloadResponse, ExecutePayloadStatus, ExecutionBlockHeader,
    ExecutionPayload, ForkchoiceState, ForkchoiceUpdatedResponse, ForkchoiceUpdatedStatus,
    PayloadAttributes, PayloadId,
};
use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use std::collections::HashMap;

const GAS_LIMIT: u64 = 30_000_000;
const GAS_USED: u64 = GAS_LIMIT - 1;
const LOGS_BLOOM_BYTES: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    PoW(ExecutionBlockHeader),
    PoS {
        header: ExecutionBlockHeader,
        payload: ExecutionPayload,
    },
}

impl Block {
    pub fn header(&self) -> ExecutionBlockHeader {
        match self {
            Block::PoW(header) => *header,
            Block::PoS { header, .. } => *header,
        }
    }

    pub fn block_hash(&self) -> B256 {
        self.header().block_hash
    }

    pub fn parent_hash(&self) -> B256 {
        self.header().parent_hash
    }

    pub fn block_number(&self) -> u64 {
        self.header().block_number
    }

    pub fn total_difficulty(&self) -> U256 {
        self.header().total_difficulty.unwrap_or_default()
    }

    pub fn is_pos(&self) -> bool {
        matches!(self, Block::PoS { .. })
    }
}

/// Hash of a PoW block made up from the fields that distinguish it.
pub fn pow_block_hash(
    parent_hash: B256,
    block_number: u64,
    difficulty: U256,
    timestamp: u64,
) -> B256 {
    let mut preimage = Vec::with_capacity(32 + 8 + 32 + 8);
    preimage.extend_from_slice(parent_hash.as_slice());
    preimage.extend_from_slice(&block_number.to_be_bytes());
    preimage.extend_from_slice(&difficulty.to_be_bytes::<32>());
    preimage.extend_from_slice(&timestamp.to_be_bytes());
    keccak256(preimage)
}

/// Hash of a built payload. Every field a test can influence is committed to.
pub fn payload_block_hash(payload: &ExecutionPayload) -> B256 {
    let mut preimage = Vec::new();
    preimage.extend_from_slice(payload.parent_hash.as_slice());
    preimage.extend_from_slice(payload.fee_recipient.as_slice());
    preimage.extend_from_slice(payload.prev_randao.as_slice());
    preimage.extend_from_slice(&payload.block_number.to_be_bytes());
    preimage.extend_from_slice(&payload.timestamp.to_be_bytes());
    preimage.extend_from_slice(&payload.extra_data);
    keccak256(preimage)
}

/// A zero hash leaves the reference unset.
fn non_zero(hash: B256) -> Option<B256> {
    (hash != B256::ZERO).then_some(hash)
}

fn payload_id_from_u64(n: u64) -> PayloadId {
    Bytes::from(n.to_be_bytes().to_vec())
}

/// An in-memory chain that follows the fork choice updates it is sent.
pub struct ExecutionBlockGenerator {
    blocks: HashMap<B256, Block>,
    /// Canonical block hashes, indexed by block number.
    canonical: Vec<B256>,
    safe_block_hash: Option<B256>,
    finalized_block_hash: Option<B256>,
    payload_ids: HashMap<PayloadId, ExecutionPayload>,
    next_payload_id: u64,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    storage: HashMap<(Address, B256), B256>,
}

impl ExecutionBlockGenerator {
    pub fn new(genesis_difficulty: U256) -> Self {
        let genesis = ExecutionBlockHeader {
            block_hash: pow_block_hash(B256::ZERO, 0, genesis_difficulty, 0),
            parent_hash: B256::ZERO,
            block_number: 0,
            timestamp: 0,
            difficulty: genesis_difficulty,
            total_difficulty: Some(genesis_difficulty),
            mix_hash: B256::ZERO,
            fee_recipient: Address::ZERO,
        };

        let mut blocks = HashMap::new();
        blocks.insert(genesis.block_hash, Block::PoW(genesis));

        Self {
            blocks,
            canonical: vec![genesis.block_hash],
            safe_block_hash: None,
            finalized_block_hash: None,
            payload_ids: HashMap::new(),
            next_payload_id: 0,
            balances: HashMap::new(),
            nonces: HashMap::new(),
            storage: HashMap::new(),
        }
    }

    pub fn head_block(&self) -> Option<&Block> {
        self.canonical.last().and_then(|hash| self.blocks.get(hash))
    }

    pub fn block_by_number(&self, number: u64) -> Option<&Block> {
        let index = usize::try_from(number).ok()?;
        self.canonical
            .get(index)
            .and_then(|hash| self.blocks.get(hash))
    }

    pub fn block_by_hash(&self, hash: B256) -> Option<&Block> {
        self.blocks.get(&hash)
    }

    pub fn header(&self, query: BlockQuery) -> Option<ExecutionBlockHeader> {
        let block = match query {
            BlockQuery::Latest => self.head_block(),
            BlockQuery::Safe => self.safe_block_hash.and_then(|h| self.blocks.get(&h)),
            BlockQuery::Finalized => self.finalized_block_hash.and_then(|h| self.blocks.get(&h)),
            BlockQuery::Number(number) => self.block_by_number(number),
        };
        block.map(Block::header)
    }

    /// The `(head, safe, finalized)` hashes this chain currently reports.
    pub fn forkchoice_state(&self) -> ForkchoiceState {
        ForkchoiceState {
            head_block_hash: self.head_block().map(Block::block_hash).unwrap_or_default(),
            safe_block_hash: self.safe_block_hash.unwrap_or_default(),
            finalized_block_hash: self.finalized_block_hash.unwrap_or_default(),
        }
    }

    /// Extends the canonical chain with a PoW block.
    pub fn insert_pow_block(&mut self, difficulty: U256) -> Result<ExecutionBlockHeader, String> {
        let parent = self
            .head_block()
            .cloned()
            .ok_or_else(|| "chain has no head".to_string())?;
        if parent.is_pos() {
            return Err("refusing to mine on top of a PoS block".to_string());
        }

        let parent = parent.header();
        let block_number = parent.block_number + 1;
        let timestamp = parent.timestamp + 1;
        let header = ExecutionBlockHeader {
            block_hash: pow_block_hash(parent.block_hash, block_number, difficulty, timestamp),
            parent_hash: parent.block_hash,
            block_number,
            timestamp,
            difficulty,
            total_difficulty: Some(
                parent
                    .total_difficulty
                    .unwrap_or_default()
                    .saturating_add(difficulty),
            ),
            mix_hash: B256::ZERO,
            fee_recipient: Address::ZERO,
        };

        self.blocks.insert(header.block_hash, Block::PoW(header));
        self.canonical.push(header.block_hash);

        Ok(header)
    }

    pub fn forkchoice_updated(
        &mut self,
        forkchoice_state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> ForkchoiceUpdatedResponse {
        let known = |hash: &B256| self.blocks.contains_key(hash);
        let unknown_head_block_hash = !known(&forkchoice_state.head_block_hash);
        let unknown_safe_block_hash = forkchoice_state.safe_block_hash != B256::ZERO
            && !known(&forkchoice_state.safe_block_hash);
        let unknown_finalized_block_hash = forkchoice_state.finalized_block_hash != B256::ZERO
            && !known(&forkchoice_state.finalized_block_hash);

        if unknown_head_block_hash || unknown_safe_block_hash || unknown_finalized_block_hash {
            return ForkchoiceUpdatedResponse {
                status: ForkchoiceUpdatedStatus::Syncing,
                payload_id: None,
            };
        }

        self.set_head(forkchoice_state.head_block_hash);
        self.safe_block_hash = non_zero(forkchoice_state.safe_block_hash);
        self.finalized_block_hash = non_zero(forkchoice_state.finalized_block_hash);

        let payload_id = payload_attributes.and_then(|attributes| {
            let parent = self.head_block()?.header();
            let mut payload = ExecutionPayload {
                parent_hash: parent.block_hash,
                fee_recipient: attributes.suggested_fee_recipient,
                state_root: B256::repeat_byte(43),
                receipts_root: B256::repeat_byte(42),
                logs_bloom: Bytes::from(vec![0; LOGS_BLOOM_BYTES]),
                prev_randao: attributes.prev_randao,
                block_number: parent.block_number + 1,
                gas_limit: GAS_LIMIT,
                gas_used: GAS_USED,
                timestamp: attributes.timestamp,
                extra_data: Bytes::from_static(b"block gen was here"),
                base_fee_per_gas: U256::from(1),
                block_hash: B256::ZERO,
                transactions: vec![],
            };
            payload.block_hash = payload_block_hash(&payload);

            let id = payload_id_from_u64(self.next_payload_id);
            self.next_payload_id += 1;
            self.payload_ids.insert(id.clone(), payload);
            Some(id)
        });

        ForkchoiceUpdatedResponse {
            status: ForkchoiceUpdatedStatus::Success,
            payload_id,
        }
    }

    pub fn get_payload(&self, id: &PayloadId) -> Option<ExecutionPayload> {
        self.payload_ids.get(id).cloned()
    }

    /// Imports `payload` without making it canonical.
    pub fn execute_payload(&mut self, payload: ExecutionPayload) -> ExecutePayloadResponse {
        let Some(parent) = self.blocks.get(&payload.parent_hash) else {
            return ExecutePayloadResponse {
                status: ExecutePayloadStatus::Syncing,
                latest_valid_hash: None,
                validation_error: None,
            };
        };
        let parent = parent.header();

        if payload.block_number != parent.block_number + 1 {
            return ExecutePayloadResponse {
                status: ExecutePayloadStatus::Invalid,
                latest_valid_hash: Some(parent.block_hash),
                validation_error: Some("invalid block number".to_string()),
            };
        }

        if payload.block_hash != payload_block_hash(&payload) {
            return ExecutePayloadResponse {
                status: ExecutePayloadStatus::InvalidBlockHash,
                latest_valid_hash: None,
                validation_error: Some("block hash mismatch".to_string()),
            };
        }

        let header = ExecutionBlockHeader {
            block_hash: payload.block_hash,
            parent_hash: payload.parent_hash,
            block_number: payload.block_number,
            timestamp: payload.timestamp,
            difficulty: U256::ZERO,
            total_difficulty: parent.total_difficulty,
            mix_hash: payload.prev_randao,
            fee_recipient: payload.fee_recipient,
        };
        let valid_hash = payload.block_hash;
        self.blocks
            .insert(valid_hash, Block::PoS { header, payload });

        ExecutePayloadResponse {
            status: ExecutePayloadStatus::Valid,
            latest_valid_hash: Some(valid_hash),
            validation_error: None,
        }
    }

    /// Rebuilds the canonical index by walking back from `head`.
    fn set_head(&mut self, head: B256) {
        let mut canonical = vec![];
        let mut next = Some(head);
        while let Some(block) = next.and_then(|hash| self.blocks.get(&hash)) {
            canonical.push(block.block_hash());
            next = (block.block_number() > 0).then(|| block.parent_hash());
        }
        canonical.reverse();
        self.canonical = canonical;
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.balances.get(&address).copied().unwrap_or_default()
    }

    pub fn set_balance(&mut self, address: Address, balance: U256) {
        self.balances.insert(address, balance);
    }

    pub fn nonce(&self, address: Address) -> u64 {
        self.nonces.get(&address).copied().unwrap_or_default()
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.nonces.insert(address, nonce);
    }

    pub fn storage(&self, address: Address, slot: B256) -> B256 {
        self.storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_storage(&mut self, address: Address, slot: B256, value: B256) {
        self.storage.insert((address, slot), value);
    }
}

//! Checks that a peer's chain reflects what the producer sent it.

use crate::Error;
use crate::engine_api::{BlockQuery, ExecutionBlockHeader, ForkchoiceState};
use crate::peer::Peer;
use crate::prev_randao_history::PrevRandaoHistory;
use alloy_primitives::{Address, U256};
use std::sync::Arc;

fn mismatch<T: std::fmt::Debug>(peer: &Peer, field: &'static str, expected: T, found: T) -> Error {
    Error::Mismatch {
        peer: peer.client_name().to_string(),
        field,
        expected: format!("{expected:?}"),
        found: format!("{found:?}"),
    }
}

/// Block `block_number` carries the recorded `prev_randao` as its mix hash and has zero
/// difficulty.
pub async fn verify_prev_randao(
    peer: &Peer,
    block_number: u64,
    history: &PrevRandaoHistory,
) -> Result<ExecutionBlockHeader, Error> {
    let expected = history.get(block_number).ok_or_else(|| Error::Mismatch {
        peer: peer.client_name().to_string(),
        field: "prevRandao",
        expected: format!("a recorded value for block {block_number}"),
        found: "nothing".to_string(),
    })?;

    let header = peer
        .existing_header(BlockQuery::Number(block_number))
        .await?;

    if header.mix_hash != expected {
        return Err(mismatch(peer, "mixHash", expected, header.mix_hash));
    }
    if header.difficulty != U256::ZERO {
        return Err(mismatch(peer, "difficulty", U256::ZERO, header.difficulty));
    }
    Ok(header)
}

pub async fn verify_fee_recipient(
    peer: &Peer,
    block_number: u64,
    expected: Address,
) -> Result<ExecutionBlockHeader, Error> {
    let header = peer
        .existing_header(BlockQuery::Number(block_number))
        .await?;

    if header.fee_recipient != expected {
        return Err(mismatch(peer, "miner", expected, header.fee_recipient));
    }
    Ok(header)
}

/// Every peer's `latest`, `safe` and `finalized` blocks are the ones in `forkchoice_state`.
pub async fn verify_convergence(
    peers: &[Arc<Peer>],
    forkchoice_state: ForkchoiceState,
) -> Result<(), Error> {
    let expectations = [
        (BlockQuery::Latest, "latest", forkchoice_state.head_block_hash),
        (BlockQuery::Safe, "safe", forkchoice_state.safe_block_hash),
        (
            BlockQuery::Finalized,
            "finalized",
            forkchoice_state.finalized_block_hash,
        ),
    ];

    for peer in peers {
        for (query, field, expected) in expectations {
            let found = peer.existing_header(query).await?.block_hash;
            if found != expected {
                return Err(mismatch(peer, field, expected, found));
            }
        }
    }
    Ok(())
}

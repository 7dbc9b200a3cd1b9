//! Detection of the terminal proof-of-work block.
//!
//! The detector walks a peer's canonical chain, summing block difficulties, until the sum
//! reaches the terminal total difficulty. Progress is kept between polls so each poll only
//! reads the blocks added since the previous one. If the previously checked block is no
//! longer canonical on the polled peer the walk restarts from genesis.

use crate::Error;
use crate::engine_api::{BlockQuery, ExecutionBlockHeader};
use crate::peer::Peer;
use alloy_primitives::U256;
use tracing::debug;

/// Announced by a miner whenever it seals a block, used to poll right away instead of
/// waiting for the next interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MinedBlock {
    pub number: u64,
    pub total_difficulty: U256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionStatus {
    BelowThreshold {
        cumulative_difficulty: U256,
        checked_height: Option<u64>,
    },
    /// The chain crossed the threshold at this block.
    Reached(ExecutionBlockHeader),
}

pub struct TransitionDetector {
    terminal_total_difficulty: U256,
    cumulative_difficulty: U256,
    last_checked: Option<ExecutionBlockHeader>,
    reached: bool,
}

impl TransitionDetector {
    pub fn new(terminal_total_difficulty: U256) -> Self {
        Self {
            terminal_total_difficulty,
            cumulative_difficulty: U256::ZERO,
            last_checked: None,
            reached: false,
        }
    }

    pub fn terminal_total_difficulty(&self) -> U256 {
        self.terminal_total_difficulty
    }

    pub fn cumulative_difficulty(&self) -> U256 {
        self.cumulative_difficulty
    }

    pub fn is_reached(&self) -> bool {
        self.reached
    }

    /// Reads the blocks `peer` has added since the last poll.
    ///
    /// Calling this again after it returned `Reached` is a bug in the caller and yields
    /// `Error::TransitionAlreadyReached`.
    pub async fn poll(&mut self, peer: &Peer) -> Result<TransitionStatus, Error> {
        if self.reached {
            return Err(Error::TransitionAlreadyReached);
        }

        if let Some(last) = self.last_checked {
            let canonical = peer.header_by_number(last.block_number).await?;
            if canonical.map(|header| header.block_hash) != Some(last.block_hash) {
                debug!(
                    peer = %peer.client_name(),
                    block_number = last.block_number,
                    "Last checked block is not canonical, restarting from genesis"
                );
                self.cumulative_difficulty = U256::ZERO;
                self.last_checked = None;
            }
        }

        let head = peer.block_number().await?;
        let mut next = self.last_checked.map_or(0, |last| last.block_number + 1);

        while next <= head {
            let header = peer.existing_header(BlockQuery::Number(next)).await?;

            self.cumulative_difficulty =
                self.cumulative_difficulty.saturating_add(header.difficulty);
            self.last_checked = Some(header);

            if self.cumulative_difficulty >= self.terminal_total_difficulty {
                self.reached = true;
                return Ok(TransitionStatus::Reached(header));
            }

            next += 1;
        }

        Ok(TransitionStatus::BelowThreshold {
            cumulative_difficulty: self.cumulative_difficulty,
            checked_height: self.last_checked.map(|header| header.block_number),
        })
    }
}

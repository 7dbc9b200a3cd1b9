//! A minimal consensus client for testing execution clients in isolation.
//!
//! `MockConsensus` watches the proof-of-work chain of its registered execution clients
//! until the terminal total difficulty is reached. It then builds a block through one
//! client every interval and drives every client through three fork choice updates per
//! block, moving head, safe and finalized in turn. Test routines block on the completion
//! of a specific phase, reserve the fee recipient of an upcoming block and look up the
//! `prev_randao` each block was built with.
//!
//! Clients are reached through the `EngineApi` trait, implemented over HTTP by
//! `engine_api::HttpJsonRpc` and in memory by `test_utils::MockExecutionEngine`.

pub mod config;
pub mod engine_api;
mod errors;
mod mock_consensus;
pub mod peer;
pub mod phase_signal;
pub mod prev_randao_history;
mod producer;
pub mod registry;
pub mod test_utils;
pub mod transition;
pub mod verification;

pub use config::Config;
pub use engine_api::{EngineApi, ForkchoiceState, HttpJsonRpc};
pub use errors::Error;
pub use mock_consensus::MockConsensus;
pub use peer::{Peer, PeerFault, PeerId};
pub use phase_signal::{PeerOutcome, PeerResponse, Phase, PhaseSnapshot};
pub use transition::MinedBlock;

use crate::engine_api;
use crate::engine_api::BlockQuery;
use std::time::Duration;

#[derive(Debug)]
pub enum Error {
    /// A call against a peer failed or timed out. The peer has been marked as faulty.
    Engine {
        peer: String,
        method: &'static str,
        error: engine_api::Error,
    },
    BlockNotFound {
        peer: String,
        query: BlockQuery,
    },
    /// The builder did not return a payload id alongside a successful fork choice update.
    PayloadIdUnavailable {
        peer: String,
    },
    /// A peer reported something other than the status the round depends on.
    UnexpectedStatus {
        peer: String,
        method: &'static str,
        status: String,
    },
    /// A broadcast was attempted while no peers were registered.
    NoPeers,
    /// Every registered peer has been marked as faulty.
    NoHealthyPeers,
    /// The transition detector was polled after it already reported the transition.
    TransitionAlreadyReached,
    TransitionTimeout(Duration),
    ProducerStopped,
    AlreadyStarted,
    InvalidConfig(String),
    DuplicatePrevRandao(u64),
    /// A peer's chain does not reflect what the producer sent it.
    Mismatch {
        peer: String,
        field: &'static str,
        expected: String,
        found: String,
    },
}

impl Error {
    /// Errors after which no further production round can succeed.
    pub fn halts_production(&self) -> bool {
        matches!(
            self,
            Error::NoPeers | Error::NoHealthyPeers | Error::DuplicatePrevRandao(_)
        )
    }
}

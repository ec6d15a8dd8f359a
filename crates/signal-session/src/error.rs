use signal_envelope::{DecodeError, SdpKind};
use thiserror::Error;

use crate::engine::EngineError;
use crate::session::NegotiationPhase;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("relay connection closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("an offer is already outstanding (phase {phase:?})")]
    Glare { phase: NegotiationPhase },
    #[error("cannot {operation} in phase {phase:?}")]
    InvalidTransition {
        operation: &'static str,
        phase: NegotiationPhase,
    },
    #[error("unexpected remote {kind} in phase {phase:?}")]
    UnexpectedDescription {
        kind: SdpKind,
        phase: NegotiationPhase,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("ICE connectivity failed")]
    IceFailed,
    #[error("session closed")]
    Closed,
}

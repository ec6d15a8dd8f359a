use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use signal_envelope::{IceCandidate, SdpKind, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

/// Which side of an exchange a locally created description is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpRole {
    Offer,
    Answer,
}

impl SdpRole {
    pub fn kind(self) -> SdpKind {
        match self {
            SdpRole::Offer => SdpKind::Offer,
            SdpRole::Answer => SdpKind::Answer,
        }
    }
}

impl fmt::Display for SdpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SdpRole::Offer => "offer",
            SdpRole::Answer => "answer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Closed => "closed",
        })
    }
}

/// Notifications raised by an engine on its own schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(IceConnectionState),
    DataMessage(String),
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("failed to create local {role}: {reason}")]
    Create { role: SdpRole, reason: String },
    #[error("local {kind} rejected: {reason}")]
    LocalDescription { kind: SdpKind, reason: String },
    #[error("remote {kind} rejected: {reason}")]
    RemoteDescription { kind: SdpKind, reason: String },
    #[error("remote candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel unavailable: {0}")]
    DataChannel(String),
}

/// Opaque peer-connection engine driven by a negotiation session.
///
/// Implementations report candidates, ICE state and inbound data messages
/// through the [`EngineEventSender`] they were built with.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_local_description(
        &self,
        role: SdpRole,
    ) -> Result<SessionDescription, EngineError>;

    /// Must receive the description just returned by
    /// [`create_local_description`](Self::create_local_description).
    async fn apply_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError>;

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError>;

    /// Equivalent candidates may be applied more than once.
    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;

    async fn send_data(&self, text: &str) -> Result<(), EngineError>;
}

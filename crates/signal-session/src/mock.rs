//! In-memory engine and sink for tests and local demos.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_envelope::{Envelope, IceCandidate, SdpKind, SessionDescription};
use tokio::sync::Notify;

use crate::engine::{
    EngineError, EngineEvent, EngineEventSender, IceConnectionState, PeerEngine, SdpRole,
};
use crate::error::TransportError;
use crate::transport::SignalSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Create(SdpRole),
    ApplyLocal(SdpKind),
    ApplyRemote(SdpKind),
    ApplyCandidate(IceCandidate),
    SendData(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Create,
    ApplyLocal,
    ApplyRemote,
    ApplyCandidate,
    SendData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveRemotePrAnswer,
}

/// Holds the next `create_local_description` call until released.
#[derive(Default)]
pub struct CreationGate {
    entered: Notify,
    release: Notify,
}

impl CreationGate {
    /// Resolves once the held call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

struct ScriptState {
    signaling: SignalingState,
    has_local: bool,
    has_remote: bool,
    negotiated: bool,
    version: u64,
    calls: Vec<EngineCall>,
    failures: HashSet<FailurePoint>,
    gathered: Vec<IceCandidate>,
    auto_connect: bool,
}

impl ScriptState {
    fn check(&self, point: FailurePoint) -> Result<(), String> {
        if self.failures.contains(&point) {
            Err(format!("injected {point:?} failure"))
        } else {
            Ok(())
        }
    }
}

/// Engine that follows the offer/answer signaling states without any media.
///
/// Applying a local description "gathers" the configured candidates; with
/// auto-connect enabled, completing an exchange reports ICE `connected`.
pub struct ScriptedEngine {
    label: String,
    events: EngineEventSender,
    state: Mutex<ScriptState>,
    gate: Mutex<Option<Arc<CreationGate>>>,
}

impl ScriptedEngine {
    pub fn new(label: impl Into<String>, events: EngineEventSender) -> Self {
        Self {
            label: label.into(),
            events,
            state: Mutex::new(ScriptState {
                signaling: SignalingState::Stable,
                has_local: false,
                has_remote: false,
                negotiated: false,
                version: 0,
                calls: Vec::new(),
                failures: HashSet::new(),
                gathered: Vec::new(),
                auto_connect: false,
            }),
            gate: Mutex::new(None),
        }
    }

    pub fn with_local_candidates(self, candidates: Vec<IceCandidate>) -> Self {
        self.state.lock().gathered = candidates;
        self
    }

    pub fn with_auto_connect(self) -> Self {
        self.state.lock().auto_connect = true;
        self
    }

    pub fn fail_at(&self, point: FailurePoint) {
        self.state.lock().failures.insert(point);
    }

    pub fn clear_failure(&self, point: FailurePoint) {
        self.state.lock().failures.remove(&point);
    }

    pub fn hold_creation(&self) -> Arc<CreationGate> {
        let gate = Arc::new(CreationGate::default());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::ApplyCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sent_data(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::SendData(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    /// Raises an event as if the engine produced it.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn announce_connected(&self) {
        self.emit(EngineEvent::ConnectionStateChanged(IceConnectionState::Checking));
        self.emit(EngineEvent::ConnectionStateChanged(IceConnectionState::Connected));
    }

    fn sdp(&self, role: SdpRole, version: u64) -> String {
        format!(
            "v=0\r\no=- 4611731400430051336 {version} IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\na=x-role:{role}\r\n",
            self.label
        )
    }
}

#[async_trait]
impl PeerEngine for ScriptedEngine {
    async fn create_local_description(
        &self,
        role: SdpRole,
    ) -> Result<SessionDescription, EngineError> {
        self.state.lock().calls.push(EngineCall::Create(role));

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let version = {
            let mut state = self.state.lock();
            state
                .check(FailurePoint::Create)
                .map_err(|reason| EngineError::Create { role, reason })?;
            match (role, state.signaling) {
                (SdpRole::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer)
                | (SdpRole::Answer, SignalingState::HaveRemoteOffer) => {}
                (_, current) => {
                    return Err(EngineError::Create {
                        role,
                        reason: format!("signaling state is {current:?}"),
                    })
                }
            }
            state.version += 1;
            state.version
        };
        Ok(SessionDescription::new(role.kind(), self.sdp(role, version)))
    }

    async fn apply_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let kind = description.kind;
        let (gathered, connect) = {
            let mut state = self.state.lock();
            state.calls.push(EngineCall::ApplyLocal(kind));
            state
                .check(FailurePoint::ApplyLocal)
                .map_err(|reason| EngineError::LocalDescription { kind, reason })?;
            let next = match (kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (SdpKind::ProvisionalAnswer, SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpKind::Rollback, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (_, current) => {
                    return Err(EngineError::LocalDescription {
                        kind,
                        reason: format!("signaling state is {current:?}"),
                    })
                }
            };
            state.signaling = next;
            if kind == SdpKind::Rollback {
                state.has_local = state.negotiated;
                (Vec::new(), false)
            } else {
                state.has_local = true;
                if kind == SdpKind::Answer {
                    state.negotiated = true;
                }
                (
                    state.gathered.clone(),
                    kind == SdpKind::Answer && state.auto_connect,
                )
            }
        };

        for candidate in gathered {
            self.emit(EngineEvent::LocalCandidate(candidate));
        }
        if connect {
            self.announce_connected();
        }
        Ok(())
    }

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let kind = description.kind;
        let connect = {
            let mut state = self.state.lock();
            state.calls.push(EngineCall::ApplyRemote(kind));
            state
                .check(FailurePoint::ApplyRemote)
                .map_err(|reason| EngineError::RemoteDescription { kind, reason })?;
            let next = match (kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (
                    SdpKind::Answer,
                    SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer,
                ) => SignalingState::Stable,
                (
                    SdpKind::ProvisionalAnswer,
                    SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer,
                ) => SignalingState::HaveRemotePrAnswer,
                (SdpKind::Rollback, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (_, current) => {
                    return Err(EngineError::RemoteDescription {
                        kind,
                        reason: format!("signaling state is {current:?}"),
                    })
                }
            };
            state.signaling = next;
            match kind {
                SdpKind::Rollback => state.has_remote = state.negotiated,
                SdpKind::Answer => {
                    state.has_remote = true;
                    state.negotiated = true;
                }
                _ => state.has_remote = true,
            }
            kind == SdpKind::Answer && state.auto_connect
        };

        if connect {
            self.announce_connected();
        }
        Ok(())
    }

    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::ApplyCandidate(candidate.clone()));
        state.check(FailurePoint::ApplyCandidate).map_err(EngineError::Candidate)?;
        if !state.has_local && !state.has_remote {
            return Err(EngineError::Candidate("no description has been set".into()));
        }
        Ok(())
    }

    async fn send_data(&self, text: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::SendData(text.to_string()));
        state.check(FailurePoint::SendData).map_err(EngineError::DataChannel)
    }
}

/// Sink that keeps every envelope a session transmits.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
    disconnected: Mutex<bool>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Returns and forgets everything sent so far.
    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Makes every later send fail as if the relay connection dropped.
    pub fn disconnect(&self) {
        *self.disconnected.lock() = true;
    }
}

impl SignalSink for RecordingSink {
    fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if *self.disconnected.lock() {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().push(envelope.clone());
        Ok(())
    }
}

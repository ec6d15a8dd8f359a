use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use signal_envelope::{
    decode_frame, Envelope, Frame, IceCandidate, RelayNotice, SdpKind, SessionDescription,
};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, IceConnectionState, PeerEngine, SdpRole};
use crate::error::NegotiationError;
use crate::transport::SignalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    /// No relay connection yet.
    Idle,
    /// Relay acknowledged the connection; nothing negotiated.
    SignalingConnected,
    OfferSent,
    OfferReceived,
    /// Local answer is being created.
    Answering,
    /// A provisional answer arrived for our offer; the final one is pending.
    AwaitingAnswer,
    Negotiated,
    MediaConnected,
    Failed,
    Closed,
}

impl NegotiationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationPhase::Failed | NegotiationPhase::Closed)
    }

    /// Phases with no offer outstanding in either direction.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            NegotiationPhase::SignalingConnected
                | NegotiationPhase::Negotiated
                | NegotiationPhase::MediaConnected
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Answer remote offers as soon as they are applied.
    pub auto_answer: bool,
}

/// Point-in-time view of a session, published on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: NegotiationPhase,
    pub has_local_description: bool,
    pub has_remote_description: bool,
    pub local_candidates: usize,
    pub remote_candidates: usize,
    pub pending_candidates: usize,
    pub ice_state: Option<IceConnectionState>,
    pub last_error: Option<String>,
    pub last_data_message: Option<String>,
}

struct SessionState {
    phase: NegotiationPhase,
    /// Where a rollback returns to.
    stable_phase: NegotiationPhase,
    local_description: bool,
    remote_description: bool,
    local_candidates: usize,
    remote_candidates: usize,
    pending_candidates: VecDeque<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
    ice_state: Option<IceConnectionState>,
    last_error: Option<String>,
    last_data_message: Option<String>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: NegotiationPhase::Idle,
            stable_phase: NegotiationPhase::SignalingConnected,
            local_description: false,
            remote_description: false,
            local_candidates: 0,
            remote_candidates: 0,
            pending_candidates: VecDeque::new(),
            seen_candidates: HashSet::new(),
            ice_state: None,
            last_error: None,
            last_data_message: None,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            has_local_description: self.local_description,
            has_remote_description: self.remote_description,
            local_candidates: self.local_candidates,
            remote_candidates: self.remote_candidates,
            pending_candidates: self.pending_candidates.len(),
            ice_state: self.ice_state,
            last_error: self.last_error.clone(),
            last_data_message: self.last_data_message.clone(),
        }
    }

    fn has_description(&self) -> bool {
        self.local_description || self.remote_description
    }

    fn ice_connected(&self) -> bool {
        self.ice_state.is_some_and(IceConnectionState::is_connected)
    }

    fn refuse(&self, operation: &'static str) -> NegotiationError {
        match self.phase {
            NegotiationPhase::Closed => NegotiationError::Closed,
            phase => NegotiationError::InvalidTransition { operation, phase },
        }
    }

    fn settle_negotiated(&mut self) {
        self.phase = if self.ice_connected() {
            NegotiationPhase::MediaConnected
        } else {
            NegotiationPhase::Negotiated
        };
        self.stable_phase = self.phase;
    }

    /// Returns to the last stable phase. Back at `SignalingConnected` the
    /// engine holds no description on either side.
    fn restore_stable(&mut self) {
        if self.stable_phase == NegotiationPhase::SignalingConnected {
            self.phase = NegotiationPhase::SignalingConnected;
            self.local_description = false;
            self.remote_description = false;
        } else {
            self.settle_negotiated();
        }
    }
}

enum CandidateIntake {
    Ignored(&'static str),
    Buffered,
    Ready,
}

/// Negotiation state for one client connected to the relay.
///
/// Every operation runs under a per-session execution lock, so caller
/// commands, relay traffic and engine events are applied one at a time in
/// arrival order. [`close`](Self::close) bypasses that lock; engine calls that
/// complete after a close are discarded.
pub struct NegotiationSession {
    engine: Arc<dyn PeerEngine>,
    sink: Arc<dyn SignalSink>,
    options: SessionOptions,
    exec: AsyncMutex<()>,
    state: Mutex<SessionState>,
    updates: watch::Sender<SessionSnapshot>,
}

impl NegotiationSession {
    pub fn new(
        engine: Arc<dyn PeerEngine>,
        sink: Arc<dyn SignalSink>,
        options: SessionOptions,
    ) -> Self {
        let state = SessionState::new();
        let (updates, _) = watch::channel(state.snapshot());
        Self {
            engine,
            sink,
            options,
            exec: AsyncMutex::new(()),
            state: Mutex::new(state),
            updates,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.state.lock().phase
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    /// Waits until the session reaches `target` or a terminal phase and
    /// returns the phase it stopped at.
    pub async fn wait_until(&self, target: NegotiationPhase) -> NegotiationPhase {
        let mut updates = self.subscribe();
        // The borrowed snapshot must be released before `updates` drops.
        let phase = match updates
            .wait_for(|snapshot| snapshot.phase == target || snapshot.phase.is_terminal())
            .await
        {
            Ok(snapshot) => snapshot.phase,
            Err(_) => self.phase(),
        };
        phase
    }

    pub async fn on_signaling_connected(&self) -> Result<(), NegotiationError> {
        let _exec = self.exec.lock().await;
        self.update(|state| match state.phase {
            NegotiationPhase::Idle => {
                state.phase = NegotiationPhase::SignalingConnected;
                state.stable_phase = NegotiationPhase::SignalingConnected;
                Ok(())
            }
            _ => Err(state.refuse("acknowledge the relay connection")),
        })?;
        info!("signaling connected");
        Ok(())
    }

    /// Creates, applies and transmits a local offer.
    pub async fn send_offer(&self) -> Result<(), NegotiationError> {
        let _exec = self.exec.lock().await;
        self.update(|state| match state.phase {
            phase if phase.is_stable() => {
                state.stable_phase = phase;
                Ok(())
            }
            phase @ (NegotiationPhase::OfferSent
            | NegotiationPhase::OfferReceived
            | NegotiationPhase::Answering
            | NegotiationPhase::AwaitingAnswer) => Err(NegotiationError::Glare { phase }),
            _ => Err(state.refuse("send an offer")),
        })?;

        let offer = self.create_local(SdpRole::Offer).await?;
        self.publish_local(offer, |state| state.phase = NegotiationPhase::OfferSent)?;
        info!("offer sent");
        self.drain_pending().await
    }

    /// Answers the remote offer currently applied.
    pub async fn send_answer(&self) -> Result<(), NegotiationError> {
        let _exec = self.exec.lock().await;
        self.answer_locked().await
    }

    /// Withdraws our outstanding offer. Nothing is sent to the remote side.
    ///
    /// Only an offer with no provisional answer applied can be rolled back.
    pub async fn rollback(&self) -> Result<(), NegotiationError> {
        let _exec = self.exec.lock().await;
        self.update(|state| match state.phase {
            NegotiationPhase::OfferSent => Ok(()),
            _ => Err(state.refuse("roll back")),
        })?;

        let applied = self
            .engine
            .apply_local_description(&SessionDescription::rollback())
            .await;
        self.resume("local rollback", |state| {
            applied.map(|()| state.restore_stable())
        })?
        .map_err(|err| self.fail(err.into()))?;
        info!(phase = ?self.phase(), "local offer rolled back");
        Ok(())
    }

    /// Handles one raw frame received from the relay.
    pub async fn handle_frame(&self, bytes: &[u8]) -> Result<(), NegotiationError> {
        match decode_frame(bytes) {
            Ok(Frame::Envelope(envelope)) => self.handle_envelope(envelope).await,
            Ok(Frame::Notice(RelayNotice::Connected { connection_id })) => {
                debug!(connection_id = %connection_id, "relay acknowledged connection");
                self.on_signaling_connected().await
            }
            Err(err) => {
                warn!(error = %err, len = bytes.len(), "dropping undecodable frame");
                Err(err.into())
            }
        }
    }

    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), NegotiationError> {
        let _exec = self.exec.lock().await;
        let phase = self.phase();
        if phase.is_terminal() {
            debug!(phase = ?phase, kind = envelope.kind(), "ignoring inbound envelope");
            return Ok(());
        }
        match envelope {
            Envelope::SessionDescription(description) => {
                self.accept_remote_description(description).await
            }
            Envelope::IceCandidate(candidate) => self.accept_remote_candidate(candidate).await,
        }
    }

    pub async fn handle_engine_event(&self, event: EngineEvent) -> Result<(), NegotiationError> {
        let _exec = self.exec.lock().await;
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                let sent = self.update(|state| {
                    if state.phase.is_terminal() {
                        return None;
                    }
                    state.local_candidates += 1;
                    Some(self.sink.send_envelope(&Envelope::from(candidate)))
                });
                match sent {
                    Some(Err(err)) => {
                        warn!(error = %err, "failed to send local candidate");
                        self.update(|state| state.last_error = Some(err.to_string()));
                        Err(err.into())
                    }
                    _ => Ok(()),
                }
            }
            EngineEvent::ConnectionStateChanged(ice_state) => {
                let ice_failed = self.update(|state| {
                    if state.phase.is_terminal() {
                        return false;
                    }
                    state.ice_state = Some(ice_state);
                    if ice_state.is_connected() {
                        if state.phase == NegotiationPhase::Negotiated {
                            state.phase = NegotiationPhase::MediaConnected;
                        }
                    } else if ice_state == IceConnectionState::Disconnected
                        && state.phase == NegotiationPhase::MediaConnected
                    {
                        state.phase = NegotiationPhase::Negotiated;
                    }
                    ice_state == IceConnectionState::Failed
                });
                info!(ice_state = %ice_state, phase = ?self.phase(), "ice connection state changed");
                if ice_failed {
                    return Err(self.fail(NegotiationError::IceFailed));
                }
                Ok(())
            }
            EngineEvent::DataMessage(text) => {
                self.update(|state| {
                    if !state.phase.is_terminal() {
                        state.last_data_message = Some(text);
                    }
                });
                Ok(())
            }
        }
    }

    /// Sends text over the engine's data channel once media is connected.
    pub async fn send_data_message(&self, text: &str) -> Result<(), NegotiationError> {
        let _exec = self.exec.lock().await;
        self.update(|state| match state.phase {
            NegotiationPhase::MediaConnected => Ok(()),
            _ => Err(state.refuse("send data")),
        })?;
        let sent = self.engine.send_data(text).await;
        self.resume("send data", |state| {
            if let Err(err) = &sent {
                warn!(error = %err, "data message not sent");
                state.last_error = Some(err.to_string());
            }
            sent
        })??;
        Ok(())
    }

    /// Forces the session into `Closed` without waiting for in-flight work.
    pub fn close(&self) {
        self.update(|state| {
            if state.phase == NegotiationPhase::Closed {
                return;
            }
            info!(phase = ?state.phase, "closing negotiation session");
            state.phase = NegotiationPhase::Closed;
            state.pending_candidates.clear();
        });
    }

    async fn answer_locked(&self) -> Result<(), NegotiationError> {
        self.update(|state| match state.phase {
            NegotiationPhase::OfferReceived => {
                state.phase = NegotiationPhase::Answering;
                Ok(())
            }
            _ => Err(state.refuse("send an answer")),
        })?;

        let answer = self.create_local(SdpRole::Answer).await?;
        self.publish_local(answer, SessionState::settle_negotiated)?;
        info!(phase = ?self.phase(), "answer sent");
        self.drain_pending().await
    }

    async fn accept_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let kind = description.kind;
        let intake = self.update(|state| match (kind, state.phase) {
            (_, NegotiationPhase::Closed) => Err(NegotiationError::Closed),
            (SdpKind::Offer, _)
            | (
                SdpKind::ProvisionalAnswer | SdpKind::Answer,
                NegotiationPhase::OfferSent | NegotiationPhase::AwaitingAnswer,
            )
            | (SdpKind::Rollback, NegotiationPhase::OfferReceived) => Ok(true),
            (SdpKind::Rollback, phase) => {
                debug!(phase = ?phase, "ignoring remote rollback with no remote offer pending");
                Ok(false)
            }
            (_, phase) => Err(NegotiationError::UnexpectedDescription { kind, phase }),
        });
        match intake {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(NegotiationError::Closed) => return Ok(()),
            Err(err) => return Err(self.fail(err)),
        }

        let applied = self.engine.apply_remote_description(&description).await;
        self.resume("apply remote description", |state| {
            applied.map(|()| match kind {
                SdpKind::Offer => {
                    if state.phase.is_stable() {
                        state.stable_phase = state.phase;
                    }
                    state.phase = NegotiationPhase::OfferReceived;
                    state.remote_description = true;
                }
                SdpKind::ProvisionalAnswer => {
                    state.phase = NegotiationPhase::AwaitingAnswer;
                    state.remote_description = true;
                }
                SdpKind::Answer => {
                    state.remote_description = true;
                    state.settle_negotiated();
                }
                SdpKind::Rollback => state.restore_stable(),
            })
        })?
        .map_err(|err| self.fail(err.into()))?;
        info!(kind = %kind, phase = ?self.phase(), "applied remote description");

        self.drain_pending().await?;
        if kind == SdpKind::Offer && self.options.auto_answer {
            self.answer_locked().await?;
        }
        Ok(())
    }

    async fn accept_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let intake = self.update(|state| {
            if state.phase.is_terminal() {
                return CandidateIntake::Ignored("session is finished");
            }
            if !state.seen_candidates.insert(candidate.clone()) {
                return CandidateIntake::Ignored("duplicate remote candidate");
            }
            state.pending_candidates.push_back(candidate.clone());
            if state.has_description() {
                CandidateIntake::Ready
            } else {
                CandidateIntake::Buffered
            }
        });
        match intake {
            CandidateIntake::Ignored(reason) => {
                debug!(
                    mline_index = candidate.sdp_mline_index,
                    reason, "ignoring remote candidate"
                );
                Ok(())
            }
            CandidateIntake::Buffered => {
                debug!(
                    mline_index = candidate.sdp_mline_index,
                    "buffering remote candidate until a description is set"
                );
                Ok(())
            }
            CandidateIntake::Ready => self.drain_pending().await,
        }
    }

    /// Applies buffered remote candidates in receipt order. Rejections are
    /// recorded but never fail the session.
    async fn drain_pending(&self) -> Result<(), NegotiationError> {
        loop {
            let next = self.update(|state| {
                if state.phase.is_terminal() || !state.has_description() {
                    None
                } else {
                    state.pending_candidates.pop_front()
                }
            });
            let Some(candidate) = next else {
                return Ok(());
            };

            let applied = self.engine.apply_remote_candidate(&candidate).await;
            self.resume("apply remote candidate", |state| match applied {
                Ok(()) => state.remote_candidates += 1,
                Err(err) => {
                    warn!(
                        error = %err,
                        mline_index = candidate.sdp_mline_index,
                        "remote candidate rejected"
                    );
                    state.last_error = Some(err.to_string());
                }
            })?;
        }
    }

    async fn create_local(&self, role: SdpRole) -> Result<SessionDescription, NegotiationError> {
        let created = self.engine.create_local_description(role).await;
        let description = self
            .resume("create local description", |_| created)?
            .map_err(|err| self.fail(err.into()))?;

        let applied = self.engine.apply_local_description(&description).await;
        self.resume("apply local description", |_| applied)?
            .map_err(|err| self.fail(err.into()))?;
        Ok(description)
    }

    /// Transmits an applied local description and moves to the next phase.
    fn publish_local(
        &self,
        description: SessionDescription,
        next: impl FnOnce(&mut SessionState),
    ) -> Result<(), NegotiationError> {
        self.resume("send local description", |state| {
            state.local_description = true;
            let sent = self.sink.send_envelope(&Envelope::from(description));
            if sent.is_ok() {
                next(state);
            }
            sent
        })?
        .map_err(|err| self.fail(err.into()))
    }

    /// Re-enters the state after an engine await. A session closed meanwhile
    /// discards the completion.
    fn resume<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut SessionState) -> R,
    ) -> Result<R, NegotiationError> {
        self.update(|state| {
            if state.phase == NegotiationPhase::Closed {
                debug!(operation, "discarding completion for closed session");
                return Err(NegotiationError::Closed);
            }
            Ok(f(state))
        })
    }

    fn fail(&self, error: NegotiationError) -> NegotiationError {
        self.update(|state| {
            if state.phase == NegotiationPhase::Closed {
                return NegotiationError::Closed;
            }
            warn!(phase = ?state.phase, error = %error, "negotiation failed");
            state.phase = NegotiationPhase::Failed;
            state.last_error = Some(error.to_string());
            state.pending_candidates.clear();
            error
        })
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        let snapshot = state.snapshot();
        self.updates.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::error::TransportError;
    use crate::mock::{EngineCall, FailurePoint, RecordingSink, ScriptedEngine};
    use tokio::sync::mpsc;

    struct Harness {
        session: Arc<NegotiationSession>,
        engine: Arc<ScriptedEngine>,
        sink: Arc<RecordingSink>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    fn harness(label: &str, options: SessionOptions) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let engine = Arc::new(ScriptedEngine::new(label, events_tx));
        let sink = Arc::new(RecordingSink::new());
        let session = Arc::new(NegotiationSession::new(
            engine.clone(),
            sink.clone(),
            options,
        ));
        Harness {
            session,
            engine,
            sink,
            events,
        }
    }

    async fn connected(label: &str) -> Harness {
        let h = harness(label, SessionOptions::default());
        h.session.on_signaling_connected().await.unwrap();
        h
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(
            format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            0,
            Some("0".into()),
        )
    }

    fn description_kinds(envelopes: &[Envelope]) -> Vec<SdpKind> {
        envelopes
            .iter()
            .filter_map(|envelope| match envelope {
                Envelope::SessionDescription(description) => Some(description.kind),
                Envelope::IceCandidate(_) => None,
            })
            .collect()
    }

    async fn deliver_all(from: &Harness, to: &Harness) {
        for envelope in from.sink.take() {
            to.session.handle_envelope(envelope).await.unwrap();
        }
    }

    #[tokio::test]
    async fn offer_before_connection_is_rejected() {
        let h = harness("a", SessionOptions::default());
        let err = h.session.send_offer().await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::InvalidTransition {
                phase: NegotiationPhase::Idle,
                ..
            }
        ));
        assert_eq!(h.session.phase(), NegotiationPhase::Idle);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn second_offer_is_glare_and_keeps_phase() {
        let h = connected("a").await;
        h.session.send_offer().await.unwrap();
        assert_eq!(h.session.phase(), NegotiationPhase::OfferSent);

        let err = h.session.send_offer().await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Glare {
                phase: NegotiationPhase::OfferSent
            }
        ));
        assert_eq!(h.session.phase(), NegotiationPhase::OfferSent);
        assert_eq!(h.sink.sent().len(), 1);
        assert_eq!(
            h.engine
                .calls()
                .iter()
                .filter(|call| matches!(call, EngineCall::Create(SdpRole::Offer)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn offer_is_applied_before_it_is_sent() {
        let h = connected("a").await;
        h.session.send_offer().await.unwrap();
        assert_eq!(
            h.engine.calls(),
            vec![
                EngineCall::Create(SdpRole::Offer),
                EngineCall::ApplyLocal(SdpKind::Offer)
            ]
        );
        assert_eq!(description_kinds(&h.sink.sent()), vec![SdpKind::Offer]);
        assert!(h.session.snapshot().has_local_description);
    }

    #[tokio::test]
    async fn offer_answer_exchange_negotiates_both_sides() {
        let a = connected("a").await;
        let b = connected("b").await;

        a.session.send_offer().await.unwrap();
        deliver_all(&a, &b).await;
        assert_eq!(b.session.phase(), NegotiationPhase::OfferReceived);

        b.session.send_answer().await.unwrap();
        assert_eq!(b.session.phase(), NegotiationPhase::Negotiated);
        deliver_all(&b, &a).await;
        assert_eq!(a.session.phase(), NegotiationPhase::Negotiated);

        let snapshot = a.session.snapshot();
        assert!(snapshot.has_local_description && snapshot.has_remote_description);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn auto_answer_replies_to_remote_offer() {
        let a = connected("a").await;
        let b = harness(
            "b",
            SessionOptions {
                auto_answer: true,
            },
        );
        b.session.on_signaling_connected().await.unwrap();

        a.session.send_offer().await.unwrap();
        deliver_all(&a, &b).await;
        assert_eq!(b.session.phase(), NegotiationPhase::Negotiated);
        assert_eq!(description_kinds(&b.sink.sent()), vec![SdpKind::Answer]);
    }

    #[tokio::test]
    async fn answer_requires_a_remote_offer() {
        let h = connected("a").await;
        let err = h.session.send_answer().await.unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidTransition { .. }));
        assert_eq!(h.session.phase(), NegotiationPhase::SignalingConnected);
    }

    #[tokio::test]
    async fn early_candidates_wait_for_a_description() {
        let b = connected("b").await;
        b.session
            .handle_envelope(candidate(1).into())
            .await
            .unwrap();
        b.session
            .handle_envelope(candidate(2).into())
            .await
            .unwrap();
        assert_eq!(b.session.snapshot().pending_candidates, 2);
        assert!(b.engine.applied_candidates().is_empty());

        b.session
            .handle_envelope(SessionDescription::offer("v=0").into())
            .await
            .unwrap();
        assert_eq!(b.engine.applied_candidates(), vec![candidate(1), candidate(2)]);
        let calls = b.engine.calls();
        assert_eq!(calls[0], EngineCall::ApplyRemote(SdpKind::Offer));

        let snapshot = b.session.snapshot();
        assert_eq!(snapshot.pending_candidates, 0);
        assert_eq!(snapshot.remote_candidates, 2);
    }

    #[tokio::test]
    async fn duplicate_candidate_is_applied_once() {
        let b = connected("b").await;
        b.session
            .handle_envelope(SessionDescription::offer("v=0").into())
            .await
            .unwrap();
        b.session
            .handle_envelope(candidate(7).into())
            .await
            .unwrap();
        b.session
            .handle_envelope(candidate(7).into())
            .await
            .unwrap();

        assert_eq!(b.engine.applied_candidates(), vec![candidate(7)]);
        assert_ne!(b.session.phase(), NegotiationPhase::Failed);
        assert_eq!(b.session.snapshot().remote_candidates, 1);
    }

    #[tokio::test]
    async fn rejected_candidate_is_not_fatal() {
        let b = connected("b").await;
        b.session
            .handle_envelope(SessionDescription::offer("v=0").into())
            .await
            .unwrap();
        b.engine.fail_at(FailurePoint::ApplyCandidate);
        b.session
            .handle_envelope(candidate(3).into())
            .await
            .unwrap();

        let snapshot = b.session.snapshot();
        assert_eq!(snapshot.phase, NegotiationPhase::OfferReceived);
        assert_eq!(snapshot.remote_candidates, 0);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn engine_rejecting_remote_offer_fails_the_session() {
        let a = connected("a").await;
        a.session.send_offer().await.unwrap();

        // the scripted engine refuses a remote offer while its own is outstanding
        let err = a
            .session
            .handle_envelope(SessionDescription::offer("v=0").into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Engine(EngineError::RemoteDescription { .. })
        ));
        let snapshot = a.session.snapshot();
        assert_eq!(snapshot.phase, NegotiationPhase::Failed);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn unsolicited_answer_fails_without_touching_the_engine() {
        let h = connected("a").await;
        let err = h
            .session
            .handle_envelope(SessionDescription::answer("v=0").into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::UnexpectedDescription {
                kind: SdpKind::Answer,
                phase: NegotiationPhase::SignalingConnected
            }
        ));
        assert_eq!(h.session.phase(), NegotiationPhase::Failed);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn provisional_answer_passes_through_awaiting_answer() {
        let a = connected("a").await;
        a.session.send_offer().await.unwrap();

        a.session
            .handle_envelope(SessionDescription::new(SdpKind::ProvisionalAnswer, "v=0").into())
            .await
            .unwrap();
        assert_eq!(a.session.phase(), NegotiationPhase::AwaitingAnswer);

        a.session
            .handle_envelope(SessionDescription::answer("v=0").into())
            .await
            .unwrap();
        assert_eq!(a.session.phase(), NegotiationPhase::Negotiated);
    }

    #[tokio::test]
    async fn local_rollback_returns_to_stable_without_sending() {
        let a = connected("a").await;
        a.session.send_offer().await.unwrap();
        a.sink.take();

        a.session.rollback().await.unwrap();
        assert_eq!(a.session.phase(), NegotiationPhase::SignalingConnected);
        assert!(a.sink.sent().is_empty());
        assert_eq!(
            a.engine.calls().last(),
            Some(&EngineCall::ApplyLocal(SdpKind::Rollback))
        );
        assert!(!a.session.snapshot().has_local_description);

        a.session.send_offer().await.unwrap();
        assert_eq!(a.session.phase(), NegotiationPhase::OfferSent);
    }

    #[tokio::test]
    async fn rollback_is_refused_once_a_provisional_answer_is_applied() {
        let a = connected("a").await;
        a.session.send_offer().await.unwrap();
        a.session
            .handle_envelope(SessionDescription::new(SdpKind::ProvisionalAnswer, "v=0").into())
            .await
            .unwrap();

        let err = a.session.rollback().await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::InvalidTransition {
                phase: NegotiationPhase::AwaitingAnswer,
                ..
            }
        ));
        assert_eq!(a.session.phase(), NegotiationPhase::AwaitingAnswer);
        assert!(a.session.snapshot().last_error.is_none());
        assert!(!a
            .engine
            .calls()
            .contains(&EngineCall::ApplyLocal(SdpKind::Rollback)));
    }

    #[test]
    fn restoring_the_initial_stable_phase_forgets_both_descriptions() {
        let mut state = SessionState::new();
        state.phase = NegotiationPhase::AwaitingAnswer;
        state.local_description = true;
        state.remote_description = true;

        state.restore_stable();
        assert_eq!(state.phase, NegotiationPhase::SignalingConnected);
        assert!(!state.has_description());

        state.stable_phase = NegotiationPhase::Negotiated;
        state.local_description = true;
        state.remote_description = true;
        state.restore_stable();
        assert_eq!(state.phase, NegotiationPhase::Negotiated);
        assert!(state.has_description());
    }

    #[tokio::test]
    async fn candidates_after_a_rollback_are_buffered_again() {
        let a = connected("a").await;
        a.session.send_offer().await.unwrap();
        a.session.rollback().await.unwrap();

        a.session
            .handle_envelope(candidate(9).into())
            .await
            .unwrap();
        let snapshot = a.session.snapshot();
        assert!(!snapshot.has_local_description && !snapshot.has_remote_description);
        assert_eq!(snapshot.pending_candidates, 1);
        assert!(a.engine.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn remote_rollback_withdraws_the_pending_offer() {
        let b = connected("b").await;
        b.session
            .handle_envelope(SessionDescription::offer("v=0").into())
            .await
            .unwrap();
        b.session
            .handle_envelope(SessionDescription::rollback().into())
            .await
            .unwrap();
        assert_eq!(b.session.phase(), NegotiationPhase::SignalingConnected);
    }

    #[tokio::test]
    async fn late_creation_after_close_is_discarded() {
        let a = connected("a").await;
        let gate = a.engine.hold_creation();

        let session = a.session.clone();
        let offer = tokio::spawn(async move { session.send_offer().await });

        gate.entered().await;
        a.session.close();
        gate.release();

        let result = offer.await.unwrap();
        assert!(matches!(result, Err(NegotiationError::Closed)));
        assert_eq!(a.session.phase(), NegotiationPhase::Closed);
        assert!(a.sink.sent().is_empty());
        assert!(!a
            .engine
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::ApplyLocal(_))));
    }

    #[tokio::test]
    async fn candidates_never_reach_the_engine_once_closed() {
        let b = connected("b").await;
        b.session
            .handle_envelope(SessionDescription::offer("v=0").into())
            .await
            .unwrap();
        let before = b.engine.calls().len();

        // close() landing between the caller's phase check and the engine call
        b.session.update(|state| {
            state.pending_candidates.push_back(candidate(1));
            state.phase = NegotiationPhase::Closed;
        });
        b.session.drain_pending().await.unwrap();
        b.session
            .accept_remote_candidate(candidate(2))
            .await
            .unwrap();

        assert_eq!(b.engine.calls().len(), before);
        assert!(b.engine.applied_candidates().is_empty());
        assert_eq!(b.session.snapshot().remote_candidates, 0);
    }

    #[tokio::test]
    async fn late_remote_description_after_close_is_ignored() {
        let b = connected("b").await;
        b.session.close();
        b.session
            .accept_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert!(b.engine.calls().is_empty());
        assert_eq!(b.session.phase(), NegotiationPhase::Closed);
    }

    #[tokio::test]
    async fn offer_creation_failure_fails_the_session() {
        let a = connected("a").await;
        a.engine.fail_at(FailurePoint::Create);

        let err = a.session.send_offer().await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Engine(EngineError::Create {
                role: SdpRole::Offer,
                ..
            })
        ));
        let snapshot = a.session.snapshot();
        assert_eq!(snapshot.phase, NegotiationPhase::Failed);
        assert!(snapshot.last_error.is_some());
        assert!(a.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn answer_apply_failure_fails_the_session() {
        let b = connected("b").await;
        b.session
            .handle_envelope(SessionDescription::offer("v=0").into())
            .await
            .unwrap();
        b.engine.fail_at(FailurePoint::ApplyLocal);

        let err = b.session.send_answer().await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Engine(EngineError::LocalDescription {
                kind: SdpKind::Answer,
                ..
            })
        ));
        let snapshot = b.session.snapshot();
        assert_eq!(snapshot.phase, NegotiationPhase::Failed);
        assert!(snapshot.last_error.is_some());
        assert!(b.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn unsendable_offer_fails_the_session() {
        let a = connected("a").await;
        a.sink.disconnect();

        let err = a.session.send_offer().await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Transport(TransportError::ChannelClosed)
        ));
        let snapshot = a.session.snapshot();
        assert_eq!(snapshot.phase, NegotiationPhase::Failed);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn data_channel_failure_is_reported_but_not_fatal() {
        let a = connected("a").await;
        a.session.send_offer().await.unwrap();
        a.session
            .handle_envelope(SessionDescription::answer("v=0").into())
            .await
            .unwrap();
        a.session
            .handle_engine_event(EngineEvent::ConnectionStateChanged(
                IceConnectionState::Connected,
            ))
            .await
            .unwrap();
        a.engine.fail_at(FailurePoint::SendData);

        let err = a.session.send_data_message("hello").await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Engine(EngineError::DataChannel(_))
        ));
        let snapshot = a.session.snapshot();
        assert_eq!(snapshot.phase, NegotiationPhase::MediaConnected);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn closed_session_refuses_work_and_ignores_traffic() {
        let h = connected("a").await;
        h.session.close();

        assert!(matches!(
            h.session.send_offer().await,
            Err(NegotiationError::Closed)
        ));
        h.session
            .handle_envelope(SessionDescription::offer("v=0").into())
            .await
            .unwrap();
        assert!(h.engine.calls().is_empty());
        assert_eq!(h.session.phase(), NegotiationPhase::Closed);
    }

    #[tokio::test]
    async fn ice_state_moves_media_phase() {
        let a = connected("a").await;
        let b = connected("b").await;
        a.session.send_offer().await.unwrap();
        deliver_all(&a, &b).await;
        b.session.send_answer().await.unwrap();

        b.session
            .handle_engine_event(EngineEvent::ConnectionStateChanged(
                IceConnectionState::Checking,
            ))
            .await
            .unwrap();
        assert_eq!(b.session.phase(), NegotiationPhase::Negotiated);

        b.session
            .handle_engine_event(EngineEvent::ConnectionStateChanged(
                IceConnectionState::Connected,
            ))
            .await
            .unwrap();
        assert_eq!(b.session.phase(), NegotiationPhase::MediaConnected);

        b.session
            .handle_engine_event(EngineEvent::ConnectionStateChanged(
                IceConnectionState::Disconnected,
            ))
            .await
            .unwrap();
        assert_eq!(b.session.phase(), NegotiationPhase::Negotiated);

        let err = b
            .session
            .handle_engine_event(EngineEvent::ConnectionStateChanged(
                IceConnectionState::Failed,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::IceFailed));
        assert_eq!(b.session.phase(), NegotiationPhase::Failed);
        assert_eq!(
            b.session.snapshot().ice_state,
            Some(IceConnectionState::Failed)
        );
    }

    #[tokio::test]
    async fn local_candidates_are_counted_and_sent() {
        let mut a = connected("a").await;
        a.session.send_offer().await.unwrap();
        a.sink.take();

        a.engine
            .emit(EngineEvent::LocalCandidate(candidate(4)));
        let event = a.events.recv().await.unwrap();
        a.session.handle_engine_event(event).await.unwrap();

        assert_eq!(a.sink.sent(), vec![Envelope::from(candidate(4))]);
        assert_eq!(a.session.snapshot().local_candidates, 1);
    }

    #[tokio::test]
    async fn data_messages_need_media_and_are_recorded() {
        let a = connected("a").await;
        assert!(matches!(
            a.session.send_data_message("hello").await,
            Err(NegotiationError::InvalidTransition { .. })
        ));

        a.session.send_offer().await.unwrap();
        a.session
            .handle_envelope(SessionDescription::answer("v=0").into())
            .await
            .unwrap();
        a.session
            .handle_engine_event(EngineEvent::ConnectionStateChanged(
                IceConnectionState::Completed,
            ))
            .await
            .unwrap();
        a.session.send_data_message("hello").await.unwrap();
        assert_eq!(a.engine.sent_data(), vec!["hello".to_string()]);

        a.session
            .handle_engine_event(EngineEvent::DataMessage("hi back".into()))
            .await
            .unwrap();
        assert_eq!(
            a.session.snapshot().last_data_message.as_deref(),
            Some("hi back")
        );
    }

    #[tokio::test]
    async fn frames_are_decoded_before_dispatch() {
        let h = harness("a", SessionOptions::default());
        let notice = signal_envelope::encode_notice(&RelayNotice::Connected {
            connection_id: uuid::Uuid::new_v4(),
        });
        h.session.handle_frame(&notice).await.unwrap();
        assert_eq!(h.session.phase(), NegotiationPhase::SignalingConnected);

        let err = h.session.handle_frame(b"{not json").await.unwrap_err();
        assert!(matches!(err, NegotiationError::Decode(_)));
        assert_eq!(h.session.phase(), NegotiationPhase::SignalingConnected);
    }

    #[tokio::test]
    async fn subscribers_observe_phase_changes() {
        let h = harness("a", SessionOptions::default());
        let mut updates = h.session.subscribe();
        h.session.on_signaling_connected().await.unwrap();
        updates.changed().await.unwrap();
        assert_eq!(
            updates.borrow_and_update().phase,
            NegotiationPhase::SignalingConnected
        );
        assert_eq!(
            h.session.wait_until(NegotiationPhase::SignalingConnected).await,
            NegotiationPhase::SignalingConnected
        );
    }
}

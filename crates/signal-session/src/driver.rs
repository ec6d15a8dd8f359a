use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;
use crate::error::NegotiationError;
use crate::session::NegotiationSession;
use crate::transport::RelayEvent;

/// Feeds relay and engine events into one session until the relay goes away.
///
/// Relay events pass through a watcher task that closes the session the
/// moment the relay drops, even while the dispatch loop is blocked on an
/// engine call.
pub struct SessionDriver {
    watcher: JoinHandle<()>,
    handle: Option<JoinHandle<()>>,
}

impl SessionDriver {
    pub fn spawn(
        session: Arc<NegotiationSession>,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Self {
        let (forward_tx, mut forwarded) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(watch_relay(session.clone(), relay_events, forward_tx));

        let handle = tokio::spawn(async move {
            let mut engine_open = true;
            loop {
                tokio::select! {
                    event = forwarded.recv() => match event {
                        Some(RelayEvent::Connected { connection_id }) => {
                            info!(connection_id = %connection_id, "relay connection acknowledged");
                            report(session.on_signaling_connected().await);
                        }
                        Some(RelayEvent::Envelope(envelope)) => {
                            report(session.handle_envelope(envelope).await);
                        }
                        Some(RelayEvent::Closed) | None => {
                            session.close();
                            break;
                        }
                    },
                    event = engine_events.recv(), if engine_open => match event {
                        Some(event) => report(session.handle_engine_event(event).await),
                        None => {
                            debug!("engine event stream ended");
                            engine_open = false;
                        }
                    },
                }
            }
            debug!("session driver stopped");
        });
        Self {
            watcher,
            handle: Some(handle),
        }
    }

    /// Waits for the driver to stop, which happens once the relay closes.
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        self.watcher.abort();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn watch_relay(
    session: Arc<NegotiationSession>,
    mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    forward: mpsc::UnboundedSender<RelayEvent>,
) {
    loop {
        match relay_events.recv().await {
            Some(RelayEvent::Closed) | None => {
                session.close();
                let _ = forward.send(RelayEvent::Closed);
                return;
            }
            Some(event) => {
                if forward.send(event).is_err() {
                    return;
                }
            }
        }
    }
}

fn report(result: Result<(), NegotiationError>) {
    match result {
        Ok(()) => {}
        Err(NegotiationError::Closed) => debug!("event arrived after session closed"),
        Err(err) => warn!(error = %err, "session rejected event"),
    }
}

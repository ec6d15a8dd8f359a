use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use signal_envelope::{decode_frame, encode, Envelope, Frame, RelayNotice};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;
use uuid::Uuid;

use crate::error::TransportError;

/// Outbound half of a session's relay connection.
pub trait SignalSink: Send + Sync {
    fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// What the relay connection reports back to the session driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected { connection_id: Uuid },
    Envelope(Envelope),
    Closed,
}

/// WebSocket connection to a signal relay.
///
/// A writer task drains the outbound queue and a reader task turns inbound
/// frames into [`RelayEvent`]s. Both stop when the client is closed or dropped.
pub struct RelayClient {
    url: Url,
    send_tx: mpsc::UnboundedSender<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayClient {
    pub async fn connect(
        relay_url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), TransportError> {
        let url = relay_websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        tracing::debug!(url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<RelayEvent>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => classify(text.as_bytes()),
                    Ok(Message::Binary(data)) => classify(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => None,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!("relay websocket closed: {err}");
                            }
                            _ => tracing::warn!("relay websocket error: {err}"),
                        }
                        break;
                    }
                };
                if let Some(event) = event {
                    if events_tx.send(event).is_err() {
                        return;
                    }
                }
            }
            let _ = events_tx.send(RelayEvent::Closed);
        });

        let client = RelayClient {
            url,
            send_tx,
            tasks: Mutex::new(vec![writer, reader]),
        };
        Ok((client, events_rx))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Drops the connection. The event stream ends without a `Closed` event.
    pub fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl SignalSink for RelayClient {
    fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = String::from_utf8(encode(envelope)).map_err(|_| TransportError::ChannelClosed)?;
        tracing::trace!(kind = envelope.kind(), len = text.len(), "ws_out");
        self.send_tx
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify(bytes: &[u8]) -> Option<RelayEvent> {
    match decode_frame(bytes) {
        Ok(Frame::Envelope(envelope)) => Some(RelayEvent::Envelope(envelope)),
        Ok(Frame::Notice(RelayNotice::Connected { connection_id })) => {
            Some(RelayEvent::Connected { connection_id })
        }
        Err(err) => {
            tracing::warn!(error = %err, len = bytes.len(), "dropping undecodable relay frame");
            None
        }
    }
}

/// Normalises a relay address: `http(s)` becomes `ws(s)` and an empty path
/// becomes `/ws`.
pub fn relay_websocket_url(relay_url: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: relay_url.to_string(),
        reason,
    };
    let mut url = Url::parse(relay_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_become_websocket_urls() {
        assert_eq!(
            relay_websocket_url("http://127.0.0.1:8080").unwrap().as_str(),
            "ws://127.0.0.1:8080/ws"
        );
        assert_eq!(
            relay_websocket_url("https://relay.example.com/").unwrap().as_str(),
            "wss://relay.example.com/ws"
        );
    }

    #[test]
    fn explicit_paths_are_kept() {
        assert_eq!(
            relay_websocket_url("ws://localhost:9000/signal#frag")
                .unwrap()
                .as_str(),
            "ws://localhost:9000/signal"
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            relay_websocket_url("ftp://example.com"),
            Err(TransportError::InvalidUrl { .. })
        ));
        assert!(relay_websocket_url("not a url").is_err());
    }

    #[test]
    fn notices_and_envelopes_are_classified() {
        let connection_id = Uuid::new_v4();
        let notice = signal_envelope::encode_notice(&RelayNotice::Connected { connection_id });
        assert_eq!(classify(&notice), Some(RelayEvent::Connected { connection_id }));

        let offer = Envelope::from(signal_envelope::SessionDescription::offer("v=0"));
        assert_eq!(classify(&encode(&offer)), Some(RelayEvent::Envelope(offer)));
        assert_eq!(classify(b"{\"type\":\"chat\"}"), None);
    }
}

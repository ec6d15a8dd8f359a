#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use signal_envelope::{decode_frame, Frame, RelayNotice};
use signal_relay::config::RelayConfig;
use signal_relay::server::{self, RelayState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: Arc<RelayState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    pub async fn start(validate_envelopes: bool) -> Self {
        let config = RelayConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            validate_envelopes,
            ..RelayConfig::default()
        };
        let listener = TcpListener::bind(config.listen_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let state = Arc::new(RelayState::new(&config, handle));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server::serve(listener, state.clone(), async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Polls until the registry holds `expected` connections.
    pub async fn wait_for_connections(&self, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while self.state.registry().len().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry reaches expected size");
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
    }
}

/// Opens a websocket and consumes the relay's acknowledgement.
pub async fn connect(relay: &TestRelay) -> (Client, Uuid) {
    let (mut client, _) = tokio::time::timeout(WAIT, connect_async(relay.ws_url()))
        .await
        .expect("connect in time")
        .expect("websocket handshake");
    let ack = next_text(&mut client).await;
    match decode_frame(ack.as_bytes()).expect("ack decodes") {
        Frame::Notice(RelayNotice::Connected { connection_id }) => (client, connection_id),
        other => panic!("expected connected notice, got {other:?}"),
    }
}

pub async fn next_message(client: &mut Client) -> Message {
    tokio::time::timeout(WAIT, client.next())
        .await
        .expect("message in time")
        .expect("stream open")
        .expect("websocket frame")
}

pub async fn next_text(client: &mut Client) -> String {
    match next_message(client).await {
        Message::Text(text) => text.as_str().to_owned(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Asserts nothing arrives within a short window.
pub async fn assert_silent(client: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

mod support;

use futures_util::SinkExt;
use signal_envelope::{encode, Envelope, IceCandidate, SessionDescription};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

use support::{assert_silent, connect, next_message, next_text, TestRelay};

fn offer_text() -> String {
    String::from_utf8(encode(&Envelope::from(SessionDescription::offer(
        "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n",
    ))))
    .unwrap()
}

async fn http_get(relay: &TestRelay, path: &str) -> String {
    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn each_client_gets_its_own_ack() {
    let relay = TestRelay::start(true).await;
    let (mut a, a_id) = connect(&relay).await;
    let (mut b, b_id) = connect(&relay).await;
    assert_ne!(a_id, b_id);

    // b's ack went to b only
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn frames_reach_every_other_client_verbatim() {
    let relay = TestRelay::start(true).await;
    let (mut a, _) = connect(&relay).await;
    let (mut b, _) = connect(&relay).await;
    let (mut c, _) = connect(&relay).await;

    let frame = offer_text();
    a.send(Message::Text(frame.clone().into())).await.unwrap();

    assert_eq!(next_text(&mut b).await, frame);
    assert_eq!(next_text(&mut c).await, frame);
    assert_silent(&mut a).await;

    let candidate = encode(&Envelope::from(IceCandidate::new(
        "candidate:1 1 udp 1 10.0.0.1 9 typ host",
        0,
        None,
    )));
    c.send(Message::Binary(candidate.clone().into())).await.unwrap();
    match next_message(&mut a).await {
        Message::Binary(data) => assert_eq!(data.as_ref(), candidate.as_slice()),
        other => panic!("expected binary frame, got {other:?}"),
    }
    match next_message(&mut b).await {
        Message::Binary(data) => assert_eq!(data.as_ref(), candidate.as_slice()),
        other => panic!("expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_connection_stays_open() {
    let relay = TestRelay::start(true).await;
    let (mut a, _) = connect(&relay).await;
    let (mut b, _) = connect(&relay).await;

    a.send(Message::Text("{\"type\":\"chat\",\"payload\":{}}".into()))
        .await
        .unwrap();
    a.send(Message::Text("not json at all".into())).await.unwrap();
    assert_silent(&mut b).await;

    let frame = offer_text();
    a.send(Message::Text(frame.clone().into())).await.unwrap();
    assert_eq!(next_text(&mut b).await, frame);
    assert_eq!(relay.state.registry().len().await, 2);
}

#[tokio::test]
async fn opaque_mode_forwards_anything() {
    let relay = TestRelay::start(false).await;
    let (mut a, _) = connect(&relay).await;
    let (mut b, _) = connect(&relay).await;

    a.send(Message::Text("not json at all".into())).await.unwrap();
    assert_eq!(next_text(&mut b).await, "not json at all");
}

#[tokio::test]
async fn disconnected_client_stops_receiving() {
    let relay = TestRelay::start(true).await;
    let (mut a, _) = connect(&relay).await;
    let (mut b, b_id) = connect(&relay).await;
    let (mut c, _) = connect(&relay).await;
    relay.wait_for_connections(3).await;

    b.close(None).await.unwrap();
    relay.wait_for_connections(2).await;
    assert!(!relay.state.registry().contains(b_id).await);

    let frame = offer_text();
    a.send(Message::Text(frame.clone().into())).await.unwrap();
    assert_eq!(next_text(&mut c).await, frame);
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn health_and_stats_endpoints_respond() {
    let relay = TestRelay::start(true).await;
    let (_a, a_id) = connect(&relay).await;
    relay.wait_for_connections(1).await;

    let health = http_get(&relay, "/healthz").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");
    assert!(health.contains("\"status\":\"ok\""));

    let stats = http_get(&relay, "/debug/stats").await;
    assert!(stats.contains("\"active_connections\":1"), "{stats}");
    assert!(stats.contains(&a_id.to_string()));

    let metrics = http_get(&relay, "/metrics").await;
    assert!(metrics.starts_with("HTTP/1.1 200"), "{metrics}");
}

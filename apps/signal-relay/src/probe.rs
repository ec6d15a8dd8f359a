use anyhow::{anyhow, Context, Result};
use clap::Args;
use futures_util::{SinkExt, StreamExt};
use signal_envelope::{decode_frame, encode, Envelope, Frame, RelayNotice, SessionDescription};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Relay websocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    pub url: String,

    /// Send an offer with this SDP body once connected
    #[arg(long)]
    pub send_offer: Option<String>,

    /// Seconds to keep printing relayed frames before exiting
    #[arg(long, default_value_t = 5)]
    pub listen_secs: u64,
}

/// Connects to a relay, waits for its acknowledgement and prints every frame
/// forwarded from other clients until the listen window closes.
pub async fn run(args: ProbeArgs) -> Result<()> {
    info!(url = %args.url, "connecting to relay");

    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(args.url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            error!("failed to connect to {}: {}", args.url, err);
            return Err(anyhow!("connection failed: {err}"));
        }
        Err(_) => {
            error!("connection timeout after {}s", CONNECT_TIMEOUT.as_secs());
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let ack = timeout(CONNECT_TIMEOUT, async {
        while let Some(message) = read.next().await {
            if let Message::Text(text) = message? {
                if let Ok(Frame::Notice(RelayNotice::Connected { connection_id })) =
                    decode_frame(text.as_bytes())
                {
                    return Ok::<_, anyhow::Error>(connection_id);
                }
            }
        }
        Err(anyhow!("relay closed the connection before acknowledging it"))
    })
    .await;

    let connection_id = match ack {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("relay did not acknowledge the connection")),
    };
    println!("connected as {connection_id}");

    if let Some(sdp) = args.send_offer {
        let envelope = Envelope::from(SessionDescription::offer(sdp));
        let text = String::from_utf8(encode(&envelope)).context("envelope is not utf-8")?;
        write.send(Message::Text(text.into())).await?;
        println!("sent offer");
    }

    let deadline = Instant::now() + Duration::from_secs(args.listen_secs);
    loop {
        let message = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(message)) => message?,
            Ok(None) => {
                println!("relay closed the connection");
                return Ok(());
            }
            Err(_) => break,
        };
        match message {
            Message::Text(text) => print_frame(text.as_bytes()),
            Message::Binary(data) => print_frame(&data),
            Message::Close(_) => {
                println!("relay closed the connection");
                return Ok(());
            }
            _ => {}
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

fn print_frame(bytes: &[u8]) {
    match decode_frame(bytes) {
        Ok(Frame::Envelope(Envelope::SessionDescription(description))) => {
            println!("<- {} ({} bytes of sdp)", description.kind, description.sdp.len());
        }
        Ok(Frame::Envelope(Envelope::IceCandidate(candidate))) => {
            println!(
                "<- candidate mline={} mid={} {}",
                candidate.sdp_mline_index,
                candidate.sdp_mid.as_deref().unwrap_or("-"),
                candidate.sdp
            );
        }
        Ok(Frame::Notice(notice)) => println!("<- notice {notice:?}"),
        Err(err) => println!("<- undecodable frame ({err})"),
    }
}

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::probe::ProbeArgs;
use crate::registry::DEFAULT_CHANNEL_DEPTH;

#[derive(Debug, Parser)]
#[command(
    name = "signal-relay",
    author,
    version,
    about = "Relay that forwards peer negotiation messages between connected clients",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Server options (used when no subcommand is given)
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to a running relay and print what it sends
    Probe(ProbeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "SIGNAL_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Frames buffered per connection before new ones are dropped for it.
    #[arg(
        long,
        env = "SIGNAL_RELAY_CONNECTION_BUFFER",
        default_value_t = DEFAULT_CHANNEL_DEPTH
    )]
    pub per_connection_buffer: usize,

    /// Drop frames that are not well-formed envelopes instead of forwarding them.
    #[arg(
        long,
        env = "SIGNAL_RELAY_VALIDATE_ENVELOPES",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub validate_envelopes: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SIGNAL_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub per_connection_buffer: usize,
    pub validate_envelopes: bool,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
            validate_envelopes: true,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.per_connection_buffer == 0 {
            anyhow::bail!("per-connection buffer must hold at least one frame");
        }
        Ok(RelayConfig {
            listen_addr,
            per_connection_buffer: args.per_connection_buffer,
            validate_envelopes: args.validate_envelopes,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

use anyhow::Result;
use clap::Parser;
use signal_relay::config::{Cli, Command, RelayConfig};
use signal_relay::telemetry::{Profile, Telemetry};
use signal_relay::{probe, server};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Probe(args)) => {
            let _telemetry = Telemetry::init(Profile::Probe)?;
            probe::run(args).await
        }
        None => {
            let telemetry = Telemetry::init(Profile::Relay)?;
            let config = RelayConfig::try_from(cli.serve)?;
            server::run(config, telemetry.metrics_handle()).await
        }
    }
}

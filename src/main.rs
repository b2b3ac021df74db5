mod args;

use anyhow::Context;
use args::Cli;
use clap::Parser;
use tcpmux::config::FileConfig;
use tcpmux::MuxDaemon;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let config = FileConfig::resolve(cli.config.as_deref())?
        .into_daemon_config(cli.bind, cli.port)?;

    let daemon = MuxDaemon::bind(config)
        .await
        .context("tcpmuxd failed to start")?;
    daemon.run().await
}

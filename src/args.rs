use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tcpmuxd")]
#[command(version)]
#[command(about = "TCPMUX daemon: route connections on one port by service name", long_about = None)]
pub(crate) struct Cli {
    /// Public TCP port to listen on (default: 1, the TCPMUX port)
    pub port: Option<u16>,

    /// Address to bind the public port to. Can also be set via TCPMUX_BIND_ADDR.
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Path to a TOML config file. Can also be set via TCPMUX_CONFIG.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub mod clienv;
#[cfg(unix)]
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod error;

pub use error::{MuxError, Result};

#[cfg(unix)]
pub use daemon::{connect, tcpmuxd, DaemonConfig, Deadline, MuxDaemon, MuxListener};

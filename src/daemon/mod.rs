//! tcpmuxd - TCPMUX port multiplexing daemon
//!
//! Many local services share one public TCP port. A remote client names
//! the service it wants on the first line; the daemon looks the name up
//! and hands the accepted socket to the process that registered it.
//!
//! # Architecture
//!
//! ```text
//! remote ──TCP──► public listener ──lookup──► Registry
//!                        │                       ▲
//!                        │ rendezvous queue      │ insert / remove
//!                        ▼                       │
//!                 registrant task ◄──UDS── registration listener
//!                        │
//!                        └──sendmsg(0x55 + SCM_RIGHTS)──► service process
//! ```

pub mod client;
pub mod handoff;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{connect, Deadline, MuxListener};
pub use protocol::{Reply, ServiceName};
pub use registry::{Registration, Registry, ServiceHandle};
pub use server::{tcpmuxd, DaemonConfig, MuxDaemon};

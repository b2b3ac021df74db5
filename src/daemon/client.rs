//! Client side of both protocol roles.
//!
//! A service process calls [`MuxListener::register`] and then
//! [`MuxListener::accept`] in a loop; a remote peer calls [`connect`]. Both
//! return plain tokio `TcpStream`s positioned right after the TCPMUX
//! preamble.

use super::handoff;
use super::protocol::{self, Reply};
use crate::clienv;
use crate::error::{MuxError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Point in time after which a blocking call gives up. `None` never expires.
pub type Deadline = Option<Instant>;

async fn until<F, T>(deadline: Deadline, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| MuxError::Timeout)?,
        None => fut.await,
    }
}

/// A service registration with the local daemon.
#[derive(Debug)]
pub struct MuxListener {
    channel: Option<UnixStream>,
    service: String,
}

impl MuxListener {
    /// Register `service` with the daemon serving public `port`.
    ///
    /// The socket path comes from this process's own runtime directory
    /// (`$TCPMUX_RUNTIME_DIR`, `$XDG_RUNTIME_DIR` or the uid), so this only
    /// finds a daemon started by the same user in the same environment.
    /// Use [`MuxListener::register_at`] with the daemon's socket path
    /// otherwise.
    pub async fn register(port: u16, service: &str, deadline: Deadline) -> Result<Self> {
        Self::register_at(&clienv::socket_path(port), service, deadline).await
    }

    /// Register `service` with the daemon listening on `socket_path`.
    pub async fn register_at(socket_path: &Path, service: &str, deadline: Deadline) -> Result<Self> {
        let request = protocol::encode_request(service)?;
        let channel = until(deadline, register_handshake(socket_path, &request)).await?;

        debug!(service, "Registered with tcpmuxd");
        Ok(Self {
            channel: Some(channel),
            service: service.to_owned(),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Wait for the next connection routed to this service.
    ///
    /// A malformed handoff closes the registration; later calls fail with
    /// `ConnectionReset` straight away.
    pub async fn accept(&mut self, deadline: Deadline) -> Result<TcpStream> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| MuxError::reset("registration is closed"))?;

        let received = until(deadline, handoff::recv_fd(channel)).await;
        let fd = match received {
            Ok(fd) => fd,
            Err(MuxError::Timeout) => return Err(MuxError::Timeout),
            Err(e) => {
                self.channel = None;
                return Err(e);
            }
        };
        trace!(service = %self.service, "Received handed-off connection");
        attach(fd)
    }

    /// Release the registration. Dropping the listener does the same.
    pub fn close(mut self) {
        self.channel.take();
    }
}

fn attach(fd: OwnedFd) -> Result<TcpStream> {
    let stream = std::net::TcpStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(stream)?)
}

/// Connect to `service` through the daemon at `addr`. The returned stream
/// carries application data only.
pub async fn connect(addr: SocketAddr, service: &str, deadline: Deadline) -> Result<TcpStream> {
    let request = protocol::encode_request(service)?;
    until(deadline, connect_handshake(addr, &request)).await
}

async fn register_handshake(socket_path: &Path, request: &[u8]) -> Result<UnixStream> {
    let mut channel = UnixStream::connect(socket_path).await?;
    channel.write_all(request).await?;
    channel.flush().await?;
    let line = match protocol::read_line(&mut channel).await {
        Ok(line) => line,
        Err(MuxError::Io(e)) => return Err(MuxError::Io(e)),
        Err(e) => return Err(MuxError::reset(e.to_string())),
    };
    match Reply::parse(&line) {
        Some(Reply::Ok) => Ok(channel),
        Some(Reply::Err(reason)) => Err(MuxError::Rejected(reason)),
        None => Err(MuxError::reset("malformed registration reply")),
    }
}

async fn connect_handshake(addr: SocketAddr, request: &[u8]) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request).await?;
    stream.flush().await?;
    let line = match protocol::read_line(&mut stream).await {
        Ok(line) => line,
        Err(MuxError::LineTooLong) => return Err(MuxError::Refused("malformed reply".into())),
        Err(MuxError::Io(e)) => return Err(MuxError::Io(e)),
        Err(e) => return Err(MuxError::reset(e.to_string())),
    };
    match Reply::parse(&line) {
        Some(Reply::Ok) => Ok(stream),
        Some(Reply::Err(reason)) => Err(MuxError::Refused(reason)),
        None => Err(MuxError::Refused("malformed reply".into())),
    }
}

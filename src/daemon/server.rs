use super::handoff;
use super::protocol::{self, Reply, ServiceName};
use super::registry::Registry;
use crate::clienv;
use crate::error::MuxError;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tracing::{debug, error, info, trace, warn};

const DEFAULT_BACKLOG: u32 = 10;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub runtime_dir: PathBuf,
    pub backlog: u32,
    /// Bound on reading a request line and writing its reply.
    pub handshake_timeout: Duration,
    /// Bound on a single descriptor transfer to a registrant.
    pub handoff_timeout: Duration,
    /// Bound on how long a routed connection waits for its registrant.
    /// `None` waits as long as the registrant stays connected.
    pub dispatch_timeout: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: clienv::DEFAULT_PORT,
            runtime_dir: clienv::runtime_dir(),
            backlog: DEFAULT_BACKLOG,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            dispatch_timeout: None,
        }
    }
}

/// The multiplexing daemon: a public TCP listener routing connections by
/// service name, and a local registration socket handing them over.
pub struct MuxDaemon {
    config: DaemonConfig,
    registry: Registry,
    public: TcpListener,
    local: UnixListener,
    local_addr: SocketAddr,
    socket_path: PathBuf,
}

impl MuxDaemon {
    pub async fn bind(config: DaemonConfig) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, config.port);
        let public = listen_tcp(addr, config.backlog)
            .with_context(|| format!("Cannot bind to local network interface {addr}"))?;
        let local_addr = public.local_addr()?;

        // Derive the endpoint from the port actually bound so that port 0
        // still yields a reachable registration socket.
        let socket_path = clienv::socket_path_in(&config.runtime_dir, local_addr.port());
        let local = bind_registration_socket(&socket_path)
            .await
            .with_context(|| format!("Cannot bind to file {}", socket_path.display()))?;

        info!(
            public = %local_addr,
            socket = %socket_path.display(),
            "TCPMUX daemon listening"
        );

        Ok(Self {
            config,
            registry: Registry::new(),
            public,
            local,
            local_addr,
            socket_path,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serve until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        self.run_until(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then remove the registration socket.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let MuxDaemon {
            config,
            registry,
            public,
            local,
            socket_path,
            ..
        } = self;
        let config = Arc::new(config);

        tokio::pin!(shutdown);
        info!("TCPMUX daemon ready");

        loop {
            tokio::select! {
                conn = public.accept() => match conn {
                    Ok((stream, peer)) => {
                        trace!(%peer, "Remote connection accepted");
                        let registry = registry.clone();
                        let config = Arc::clone(&config);
                        tokio::spawn(async move {
                            handle_remote(stream, registry, config).await;
                        });
                    }
                    Err(e) => error!("Accept error on public port: {}", e),
                },
                conn = local.accept() => match conn {
                    Ok((stream, _)) => {
                        trace!("Registrant connection accepted");
                        let registry = registry.clone();
                        let config = Arc::clone(&config);
                        tokio::spawn(async move {
                            handle_registrant(stream, registry, config).await;
                        });
                    }
                    Err(e) => error!("Accept error on registration socket: {}", e),
                },
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        info!("TCPMUX daemon stopped");
        Ok(())
    }
}

/// Bind and serve with `config` until SIGINT or SIGTERM.
pub async fn tcpmuxd(config: DaemonConfig) -> Result<()> {
    MuxDaemon::bind(config).await?.run().await
}

fn listen_tcp(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn bind_registration_socket(path: &Path) -> std::io::Result<UnixListener> {
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        secure_runtime_dir(parent)?;
    }

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if !meta.file_type().is_socket() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "registration path exists and is not a socket",
            ));
        }
        // A daemon that crashed leaves its socket behind. Only a socket
        // that actively refuses connections is considered stale.
        match UnixStream::connect(path).await {
            Ok(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "another tcpmuxd is serving this port",
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                warn!(path = %path.display(), "Removing stale registration socket");
                std::fs::remove_file(path)?;
            }
            Err(e) => return Err(e),
        }
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Create `dir` with mode 0700, or check that an existing one is a real
/// directory owned by us. Group and world write bits are stripped.
fn secure_runtime_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};

    let meta = match std::fs::symlink_metadata(dir) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)?;
            std::fs::symlink_metadata(dir)?
        }
        Err(e) => return Err(e),
    };

    if !meta.file_type().is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("runtime path {} is not a directory", dir.display()),
        ));
    }
    if meta.uid() != clienv::current_uid() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("runtime directory {} is owned by another user", dir.display()),
        ));
    }

    let mode = meta.mode() & 0o7777;
    if mode & 0o022 != 0 {
        warn!(
            dir = %dir.display(),
            mode = %format!("{mode:o}"),
            "Tightening runtime directory permissions"
        );
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode & !0o022))?;
    }
    Ok(())
}

async fn send_reply<W>(stream: &mut W, reply: &Reply, limit: Duration) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = reply.encode();
    tokio::time::timeout(limit, write_flush(stream, &bytes))
        .await
        .map_err(|_| MuxError::Timeout)??;
    Ok(())
}

async fn write_flush<W>(stream: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn read_service_name<S>(stream: &mut S, limit: Duration) -> crate::Result<ServiceName>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let line = tokio::time::timeout(limit, protocol::read_line(stream))
        .await
        .map_err(|_| MuxError::Timeout)??;
    ServiceName::parse(&line)
}

/// Registration side: handshake, insert, then relay handoffs until the
/// registrant disconnects.
pub(crate) async fn handle_registrant(
    mut stream: UnixStream,
    registry: Registry,
    config: Arc<DaemonConfig>,
) {
    let registration = match read_service_name(&mut stream, config.handshake_timeout).await {
        Ok(name) => registry.insert(name.as_str().as_bytes()),
        Err(e) => Err(e),
    };

    let registration = match registration {
        Ok(registration) => registration,
        Err(e) => {
            debug!("Registration refused: {}", e);
            if let Some(reply) = Reply::for_registration_error(&e) {
                if let Err(e) = send_reply(&mut stream, &reply, config.handshake_timeout).await {
                    debug!("Failed to send registration error: {}", e);
                }
            }
            return;
        }
    };

    // Dropping `registration` on any early return removes the entry.
    if let Err(e) = send_reply(&mut stream, &Reply::Ok, config.handshake_timeout).await {
        debug!(service = %registration.name(), "Failed to confirm registration: {}", e);
        return;
    }

    let service = registration.name().clone();
    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            fd = registration.next_handoff() => {
                let Some(fd) = fd else { break };
                match relay(&stream, fd, config.handoff_timeout).await {
                    Ok(()) => trace!(%service, "Connection handed off"),
                    Err(e) if handoff::is_fatal(&e) => {
                        debug!(%service, "Registrant channel failed: {}", e);
                        break;
                    }
                    Err(e) => warn!(%service, "Dropped one handoff: {}", e),
                }
            }
            ready = stream.readable() => {
                if ready.is_err() {
                    break;
                }
                // Registrants have nothing to say after the handshake; EOF or
                // an error means they are gone, anything else is discarded.
                match stream.try_read(&mut scratch) {
                    Ok(0) => break,
                    Ok(n) => trace!(%service, bytes = n, "Discarding registrant data"),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => break,
                }
            }
        }
    }
    debug!(%service, "Registrant disconnected");
}

async fn relay(stream: &UnixStream, fd: OwnedFd, limit: Duration) -> crate::Result<()> {
    // On timeout the send future is dropped together with `fd`, closing it.
    tokio::time::timeout(limit, handoff::send_fd(stream, fd))
        .await
        .map_err(|_| MuxError::Timeout)?
}

/// Remote side: handshake, lookup, reply, then hand the connection to the
/// owning registrant.
pub(crate) async fn handle_remote(
    mut stream: TcpStream,
    registry: Registry,
    config: Arc<DaemonConfig>,
) {
    let name = match read_service_name(&mut stream, config.handshake_timeout).await {
        Ok(name) => name,
        Err(e) => {
            // Malformed requests are dropped without a reply.
            debug!("Dropping remote connection: {}", e);
            return;
        }
    };

    let service = match registry.lookup(name.as_str().as_bytes()) {
        Ok(service) => service,
        Err(e) => {
            debug!(service = %name, "Lookup failed: {}", e);
            let reply = Reply::err(protocol::REASON_NOT_FOUND);
            if let Err(e) = send_reply(&mut stream, &reply, config.handshake_timeout).await {
                debug!("Failed to send lookup error: {}", e);
            }
            return;
        }
    };

    if let Err(e) = send_reply(&mut stream, &Reply::Ok, config.handshake_timeout).await {
        debug!(service = %name, "Failed to confirm remote request: {}", e);
        return;
    }

    let fd = match stream.into_std() {
        Ok(std) => OwnedFd::from(std),
        Err(e) => {
            warn!(service = %name, "Cannot detach connection: {}", e);
            return;
        }
    };

    let dispatched = match config.dispatch_timeout {
        Some(limit) => tokio::time::timeout(limit, service.dispatch(fd))
            .await
            .unwrap_or(Err(MuxError::Timeout)),
        None => service.dispatch(fd).await,
    };
    match dispatched {
        Ok(()) => trace!(service = %name, "Connection queued for registrant"),
        Err(e) => warn!(service = %name, "Connection dropped before handoff: {}", e),
    }
}

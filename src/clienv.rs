use std::path::{Path, PathBuf};

const ENV_RUNTIME_DIR: &str = "TCPMUX_RUNTIME_DIR";
const ENV_BIND_ADDR: &str = "TCPMUX_BIND_ADDR";
const ENV_CONFIG: &str = "TCPMUX_CONFIG";

const RUNTIME_SUBDIR: &str = "tcpmux";

/// Traditional TCPMUX port.
pub const DEFAULT_PORT: u16 = 1;

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(unix)]
pub(crate) fn current_uid() -> u32 {
    // SAFETY: getuid has no failure mode.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
pub(crate) fn current_uid() -> u32 {
    0
}

/// Directory holding the registration sockets.
///
/// `$TCPMUX_RUNTIME_DIR`, else `$XDG_RUNTIME_DIR/tcpmux`, else
/// `/tmp/tcpmux-<uid>`. The per-user fallback keeps the endpoint out of
/// the world-writable `/tmp` namespace.
pub fn runtime_dir() -> PathBuf {
    let dir = runtime_dir_override()
        .or_else(|| dirs::runtime_dir().map(|d| d.join(RUNTIME_SUBDIR)))
        .unwrap_or_else(|| {
            std::env::temp_dir().join(format!("{}-{}", RUNTIME_SUBDIR, current_uid()))
        });
    tracing::trace!(dir = %dir.display(), "Resolved runtime directory");
    dir
}

/// Runtime directory override ($TCPMUX_RUNTIME_DIR)
pub fn runtime_dir_override() -> Option<PathBuf> {
    let val = env_opt(ENV_RUNTIME_DIR).map(PathBuf::from);
    tracing::trace!(value = ?val, "TCPMUX_RUNTIME_DIR env var");
    val
}

/// Registration socket for the daemon serving public `port`.
pub fn socket_path_in(dir: &Path, port: u16) -> PathBuf {
    dir.join(format!("tcpmuxd.{port}.sock"))
}

/// Registration socket for `port` as seen from this process's environment.
/// Another user or session may resolve a different directory.
pub fn socket_path(port: u16) -> PathBuf {
    socket_path_in(&runtime_dir(), port)
}

/// Bind address override ($TCPMUX_BIND_ADDR)
pub fn bind_addr() -> Option<String> {
    let val = env_opt(ENV_BIND_ADDR);
    tracing::trace!(value = ?val, "TCPMUX_BIND_ADDR env var");
    val
}

/// Config file override ($TCPMUX_CONFIG)
pub fn config_path() -> Option<PathBuf> {
    env_opt(ENV_CONFIG).map(PathBuf::from)
}

use crate::clienv;
use crate::daemon::server::DaemonConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Optional `tcpmuxd.toml` contents. Every field falls back to the
/// built-in default when absent.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Address the public listener binds to (e.g. "0.0.0.0", "::")
    pub bind: Option<IpAddr>,
    /// Public TCPMUX port
    pub port: Option<u16>,
    /// Directory for the registration socket
    pub runtime_dir: Option<PathBuf>,
    /// Listen backlog for the public port
    pub backlog: Option<u32>,
    /// Seconds allowed for reading a request line and writing the reply
    pub handshake_timeout_secs: Option<u64>,
    /// Seconds allowed for a single descriptor transfer to a registrant
    pub handoff_timeout_secs: Option<u64>,
    /// Seconds a routed connection may wait for its registrant (unset = forever)
    pub dispatch_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading daemon config");

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(?config, "Daemon config loaded");
        Ok(config)
    }

    /// Load `path` if given, else `$TCPMUX_CONFIG` if set, else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(clienv::config_path) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Layer this file over the defaults, then the environment and command
    /// line on top.
    pub fn into_daemon_config(
        self,
        bind_override: Option<IpAddr>,
        port_override: Option<u16>,
    ) -> Result<DaemonConfig> {
        let env = EnvOverrides::from_env()?;
        Ok(self.layer(env, bind_override, port_override))
    }

    fn layer(
        self,
        env: EnvOverrides,
        bind_override: Option<IpAddr>,
        port_override: Option<u16>,
    ) -> DaemonConfig {
        let mut config = DaemonConfig::default();

        if let Some(bind) = bind_override.or(env.bind).or(self.bind) {
            config.bind_addr = bind;
        }
        if let Some(port) = port_override.or(self.port) {
            config.port = port;
        }
        if let Some(dir) = env.runtime_dir.or(self.runtime_dir) {
            config.runtime_dir = dir;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(secs) = self.handshake_timeout_secs {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.handoff_timeout_secs {
            config.handoff_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.dispatch_timeout_secs {
            config.dispatch_timeout = Some(Duration::from_secs(secs));
        }
        config
    }
}

/// Settings taken from `TCPMUX_*` environment variables.
#[derive(Debug, Default)]
struct EnvOverrides {
    bind: Option<IpAddr>,
    runtime_dir: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Result<Self> {
        let bind = clienv::bind_addr()
            .map(|s| {
                s.parse::<IpAddr>()
                    .with_context(|| format!("Cannot resolve local network address '{s}'"))
            })
            .transpose()?;
        Ok(Self {
            bind,
            runtime_dir: clienv::runtime_dir_override(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let config: FileConfig = toml::from_str(
            r#"
            port = 5557
            bind = "127.0.0.1"
            dispatch_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.port, Some(5557));
        assert_eq!(config.bind, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(config.backlog, None);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<FileConfig>("prot = 1").is_err());
    }

    #[test]
    fn command_line_port_wins_over_file() {
        let file = FileConfig {
            port: Some(7000),
            backlog: Some(32),
            runtime_dir: Some(PathBuf::from("/tmp/mux-test")),
            ..Default::default()
        };
        let config = file.layer(
            EnvOverrides::default(),
            Some("127.0.0.1".parse().unwrap()),
            Some(7001),
        );
        assert_eq!(config.port, 7001);
        assert_eq!(config.backlog, 32);
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/mux-test"));
        assert_eq!(config.dispatch_timeout, None);
    }

    #[test]
    fn environment_wins_over_file() {
        let file = FileConfig {
            bind: Some("10.0.0.1".parse().unwrap()),
            runtime_dir: Some(PathBuf::from("/tmp/from-file")),
            ..Default::default()
        };
        let env = EnvOverrides {
            bind: Some("127.0.0.1".parse().unwrap()),
            runtime_dir: Some(PathBuf::from("/tmp/from-env")),
        };
        let config = file.layer(env, None, None);
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/from-env"));
        assert_eq!(config.bind_addr, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn command_line_bind_wins_over_environment() {
        let env = EnvOverrides {
            bind: Some("127.0.0.1".parse().unwrap()),
            runtime_dir: None,
        };
        let config = FileConfig::default().layer(env, Some("::1".parse().unwrap()), None);
        assert_eq!(config.bind_addr, "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn load_reads_toml_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tcpmuxd.toml");
        fs::write(&path, "port = 4000\nhandshake_timeout_secs = 3\n").unwrap();

        let config = FileConfig::load(&path)
            .unwrap()
            .layer(EnvOverrides::default(), None, None);
        assert_eq!(config.port, 4000);
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
    }
}

//! Typed configuration resolved from CLI flags and environment
//! variables into one `ServerConfig`, validated once at startup.

use clap::Parser;
use std::path::PathBuf;

use crate::wire::WireError;

#[derive(Debug, Parser, Clone)]
#[command(name = "simularium-server", about = "Real-time trajectory broadcasting server")]
pub struct ServerConfig {
    /// Disable the no-clients-for-30s automatic shutdown.
    #[arg(long, default_value_t = false)]
    pub no_timeout: bool,

    /// Rebuild a trajectory's cache even if one is already present.
    #[arg(long, default_value_t = false)]
    pub force_init: bool,

    /// Don't publish built caches back to the object store.
    #[arg(long, default_value_t = false)]
    pub no_upload: bool,

    /// TCP port to listen on.
    #[arg(long, default_value_t = crate::wire::DEFAULT_PORT)]
    pub port: u16,

    /// Object store bucket that raw inputs and caches live under.
    #[arg(long, env = "SIMULARIUM_BUCKET", default_value = "simularium-trajectories")]
    pub bucket: String,

    /// Local scratch directory for downloaded/built cache files.
    #[arg(long, env = "SIMULARIUM_CACHE_DIR", default_value = "./cache")]
    pub cache_dir: PathBuf,

    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,

    /// Honored for encrypted private keys where the PEM loader supports
    /// password-protected formats.
    #[arg(long, env = "TLS_PASSWORD")]
    pub tls_password: Option<String>,

    /// Used for cache-key prefixing (dev/staging/prod isolation within
    /// one bucket).
    #[arg(long, env = "APP_ENVIRONMENT", default_value = "development")]
    pub app_environment: String,
}

impl ServerConfig {
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// `None` when no TLS paths are configured — the server falls back
    /// to plain `ws://`, which is not in the original spec but keeps
    /// local dev and the test suite certificate-free.
    pub fn tls_acceptor(&self) -> Result<Option<tokio_rustls::TlsAcceptor>, WireError> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Ok(Some(crate::wire::load_tls_acceptor(cert, key)?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_tls_configured() {
        let config = ServerConfig::parse_from(["simularium-server"]);
        assert!(config.tls_acceptor().unwrap().is_none());
        assert_eq!(config.port, crate::wire::DEFAULT_PORT);
        assert!(!config.no_timeout);
    }

    #[test]
    fn flags_parse() {
        let config = ServerConfig::parse_from(["simularium-server", "--no-timeout", "--force-init", "--no-upload"]);
        assert!(config.no_timeout);
        assert!(config.force_init);
        assert!(config.no_upload);
    }
}

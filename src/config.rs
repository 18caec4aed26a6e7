use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

#[derive(Parser, Debug, Clone)]
#[command(name = "room_relay", about = "Real-time group chat presence and message relay")]
pub struct Args {
    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    #[arg(long, env = "RELAY_PORT", default_value_t = 2052)]
    pub port: u16,

    /// Shared secret used to sign and verify bearer tokens.
    #[arg(long, env = "RELAY_TOKEN_SECRET", default_value = "change-me")]
    pub token_secret: String,

    /// Lifetime of tokens minted with `--issue-token`.
    #[arg(long, env = "RELAY_TOKEN_TTL_HOURS", default_value_t = 168)]
    pub token_ttl_hours: u64,

    #[arg(long, env = "RELAY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "RELAY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, env = "RELAY_STORE_TIMEOUT_MS", default_value_t = 5000)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "RELAY_STORE_RETRIES", default_value_t = 3)]
    pub store_retries: u32,

    #[arg(long, env = "RELAY_STORE_BACKOFF_MS", default_value_t = 100)]
    pub store_backoff_ms: u64,

    #[arg(long, env = "RELAY_TYPING_TIMEOUT_MS", default_value_t = 3000)]
    pub typing_timeout_ms: u64,

    #[arg(long, env = "RELAY_MAX_MESSAGE_LEN", default_value_t = 1000)]
    pub max_message_len: usize,

    /// Seed a public room with id `lobby` and this name.
    #[arg(long, env = "RELAY_LOBBY")]
    pub lobby: Option<String>,

    /// Print a bearer token for `<user_id>:<username>` and exit.
    #[arg(long, value_name = "USER_ID:USERNAME")]
    pub issue_token: Option<String>,
}

impl Args {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_hours.saturating_mul(3600))
    }

    pub fn settings(&self) -> Settings {
        Settings {
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            store_attempts: self.store_retries.max(1),
            store_backoff: Duration::from_millis(self.store_backoff_ms),
            typing_timeout: Duration::from_millis(self.typing_timeout_ms),
            max_message_len: self.max_message_len,
        }
    }

    /// Both PEM files must be present and parse before TLS is enabled.
    pub fn tls_paths(&self) -> Option<Result<(&Path, &Path), ConfigError>> {
        let (cert, key) = (self.tls_cert.as_deref()?, self.tls_key.as_deref()?);
        Some(check_tls_material(cert, key).map(|()| (cert, key)))
    }
}

/// Runtime knobs shared by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store_timeout: Duration,
    pub store_attempts: u32,
    pub store_backoff: Duration,
    pub typing_timeout: Duration,
    pub max_message_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            store_timeout: Duration::from_secs(5),
            store_attempts: 3,
            store_backoff: Duration::from_millis(100),
            typing_timeout: Duration::from_secs(3),
            max_message_len: 1000,
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn check_tls_material(cert_path: &Path, key_path: &Path) -> Result<(), ConfigError> {
    let io_err = |path: &Path| {
        let path = path.display().to_string();
        move |source| ConfigError::Io { path, source }
    };

    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(cert_path))?;
    if certs.is_empty() {
        return Err(ConfigError::NoCertificate(cert_path.display().to_string()));
    }

    rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(io_err(key_path))?
        .ok_or_else(|| ConfigError::NoPrivateKey(key_path.display().to_string()))?;

    Ok(())
}

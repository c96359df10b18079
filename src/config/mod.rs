use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

use crate::distributor::DistributorSettings;
use crate::secret::Secret;

const DEFAULT_PORT: u16 = 4444;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 500;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;
const DEFAULT_SESSION_TTL_SECS: u64 = 300;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{config_dir}/gridd.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP port (default: 4444).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,gridd=trace" (default: "info").
    log: Option<String>,
    /// Public URL reported in status snapshots (default: http://localhost:{port}).
    public_url: Option<String>,
    /// New-session request timeout in seconds (default: 300).
    request_timeout: Option<u64>,
    /// Delay before a transiently failed placement is retried, in
    /// milliseconds (default: 500).
    retry_interval_ms: Option<u64>,
    /// Node health reconciliation interval in seconds (default: 30).
    health_check_interval: Option<u64>,
    /// How long sessions of an unregistered node linger before they are
    /// swept, in seconds; 0 disables the sweeper (default: 300).
    session_ttl: Option<u64>,
    /// Secret every registering node must present. Empty disables
    /// verification.
    registration_secret: Option<String>,
}

fn load_toml(config_dir: &Path) -> Option<TomlConfig> {
    let path = config_dir.join("gridd.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse gridd.toml — using defaults");
            None
        }
    }
}

// ─── GridConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GridConfig {
    pub port: u16,
    pub log: String,
    pub public_url: String,
    pub request_timeout: Duration,
    pub retry_interval: Duration,
    pub health_check_interval: Duration,
    pub session_ttl: Duration,
    pub registration_secret: Secret,
}

impl GridConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{config_dir}/gridd.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        config_dir: Option<PathBuf>,
        log: Option<String>,
        request_timeout_secs: Option<u64>,
        registration_secret: Option<String>,
    ) -> Self {
        let toml = config_dir
            .as_deref()
            .and_then(load_toml)
            .unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let public_url = std::env::var("GRIDD_PUBLIC_URL")
            .ok()
            .or(toml.public_url)
            .unwrap_or_else(|| format!("http://localhost:{port}"));

        let request_timeout = Duration::from_secs(
            request_timeout_secs
                .or(toml.request_timeout)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );
        let retry_interval = Duration::from_millis(
            toml.retry_interval_ms.unwrap_or(DEFAULT_RETRY_INTERVAL_MS),
        );
        let health_check_interval = Duration::from_secs(
            toml.health_check_interval
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
        );
        let session_ttl =
            Duration::from_secs(toml.session_ttl.unwrap_or(DEFAULT_SESSION_TTL_SECS));

        let registration_secret = std::env::var("GRIDD_REGISTRATION_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or(registration_secret)
            .or(toml.registration_secret)
            .map(Secret::new)
            .unwrap_or_else(Secret::none);

        Self {
            port,
            log,
            public_url,
            request_timeout,
            retry_interval,
            health_check_interval,
            session_ttl,
            registration_secret,
        }
    }

    pub fn distributor_settings(&self) -> DistributorSettings {
        DistributorSettings {
            uri: self.public_url.clone(),
            secret: self.registration_secret.clone(),
            request_timeout: self.request_timeout,
            health_check_interval: self.health_check_interval,
            session_ttl: self.session_ttl,
        }
    }
}

//! Configuration.
//!
//! Two layers live here:
//!
//! - [`RelayConfig`] — static process configuration for the relay server.
//!   Priority: CLI / env var > TOML > built-in default.
//! - [`ConfigRegistry`] — the sectioned runtime configuration replicated
//!   across mesh nodes. The replicator and auto-tuner mutate it at runtime
//!   through `(section, parameter)` keys.

pub mod registry;

pub use registry::{
    default_registry, init_default_registry, shutdown_default_registry, ConfigError,
    ConfigRegistry, ConfigTree, MeshSection, SyncSection, ToolGateSection, TunerSection,
};

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::path::Path;
use tracing::error;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_RELAY_HOST: &str = "relay.weft.dev";
const DEFAULT_JWT_SECRET: &str = "development_secret_please_change_in_production";
const DEFAULT_JWT_AUDIENCE: &str = "weft.dev";
const DEFAULT_JWT_ISSUER: &str = "cloud-relay";
const DEFAULT_ACCESS_EXPIRE_MINUTES: i64 = 60 * 24;
const DEFAULT_REFRESH_EXPIRE_MINUTES: i64 = 60 * 24 * 30;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// Optional TOML override file (`--config <path>`). All fields optional.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Bind address (default: 0.0.0.0).
    host: Option<String>,
    /// Listen port (default: 8000).
    port: Option<u16>,
    /// Public hostname advertised in `ws_url` responses.
    relay_host: Option<String>,
    /// Advertise wss:// instead of ws:// (default: true).
    use_https: Option<bool>,
    /// Log level filter string, e.g. "debug", "info,weft=trace".
    log: Option<String>,
    jwt_secret: Option<String>,
    jwt_algorithm: Option<String>,
    jwt_audience: Option<String>,
    jwt_issuer: Option<String>,
    access_token_expire_minutes: Option<i64>,
    refresh_token_expire_minutes: Option<i64>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

// ─── RelayConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address for the HTTP + WebSocket listener.
    pub host: String,
    pub port: u16,
    /// Public hostname used when building the `ws_url` handed to clients.
    pub relay_host: String,
    pub use_https: bool,
    pub log: String,
    pub jwt_secret: String,
    pub jwt_algorithm: Algorithm,
    pub jwt_audience: String,
    pub jwt_issuer: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_minutes: i64,
}

impl RelayConfig {
    /// Build config from CLI args + env vars + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI flag — passed as `Some(value)` from clap
    ///   2. Environment variable
    ///   3. TOML file
    ///   4. Built-in default
    pub fn load(
        host: Option<String>,
        port: Option<u16>,
        log: Option<String>,
        config_path: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let toml = config_path.and_then(load_toml).unwrap_or_default();

        let host = host
            .or_else(|| env_string("HOST"))
            .or(toml.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match port {
            Some(p) => p,
            None => match env_port()? {
                Some(p) => p,
                None => toml.port.unwrap_or(DEFAULT_PORT),
            },
        };
        let log = log
            .or_else(|| env_string("WEFT_LOG"))
            .or(toml.log)
            .unwrap_or_else(|| "info".to_string());

        let relay_host = env_string("RELAY_HOST")
            .or(toml.relay_host)
            .unwrap_or_else(|| DEFAULT_RELAY_HOST.to_string());
        let use_https = env_string("USE_HTTPS")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .or(toml.use_https)
            .unwrap_or(true);

        let jwt_secret = env_string("JWT_SECRET")
            .or(toml.jwt_secret)
            .unwrap_or_else(|| DEFAULT_JWT_SECRET.to_string());
        let jwt_algorithm = parse_algorithm(
            &env_string("JWT_ALGORITHM")
                .or(toml.jwt_algorithm)
                .unwrap_or_else(|| "HS256".to_string()),
        )?;
        let jwt_audience = env_string("JWT_AUDIENCE")
            .or(toml.jwt_audience)
            .unwrap_or_else(|| DEFAULT_JWT_AUDIENCE.to_string());
        let jwt_issuer = env_string("JWT_ISSUER")
            .or(toml.jwt_issuer)
            .unwrap_or_else(|| DEFAULT_JWT_ISSUER.to_string());

        let access_token_expire_minutes = env_i64("JWT_ACCESS_TOKEN_EXPIRE_MINUTES")
            .or(toml.access_token_expire_minutes)
            .unwrap_or(DEFAULT_ACCESS_EXPIRE_MINUTES);
        let refresh_token_expire_minutes = env_i64("JWT_REFRESH_TOKEN_EXPIRE_MINUTES")
            .or(toml.refresh_token_expire_minutes)
            .unwrap_or(DEFAULT_REFRESH_EXPIRE_MINUTES);

        Ok(Self {
            host,
            port,
            relay_host,
            use_https,
            log,
            jwt_secret,
            jwt_algorithm,
            jwt_audience,
            jwt_issuer,
            access_token_expire_minutes,
            refresh_token_expire_minutes,
        })
    }

    /// The public WebSocket URL for a freshly minted access token.
    pub fn ws_url(&self, access_token: &str) -> String {
        let scheme = if self.use_https { "wss" } else { "ws" };
        format!("{scheme}://{}/ws?token={access_token}", self.relay_host)
    }

    /// Fixed config for unit tests: ephemeral port, deterministic secret.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            relay_host: "localhost".to_string(),
            use_https: false,
            log: "error".to_string(),
            jwt_secret: "test-secret".to_string(),
            jwt_algorithm: Algorithm::HS256,
            jwt_audience: DEFAULT_JWT_AUDIENCE.to_string(),
            jwt_issuer: DEFAULT_JWT_ISSUER.to_string(),
            access_token_expire_minutes: DEFAULT_ACCESS_EXPIRE_MINUTES,
            refresh_token_expire_minutes: DEFAULT_REFRESH_EXPIRE_MINUTES,
        }
    }
}

fn parse_algorithm(name: &str) -> anyhow::Result<Algorithm> {
    match name {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => anyhow::bail!("unsupported JWT_ALGORITHM: {other}"),
    }
}

/// `PORT` from the environment. `Err` on an unparseable value so startup
/// fails loudly instead of silently binding a default.
fn env_port() -> anyhow::Result<Option<u16>> {
    match env_string("PORT") {
        Some(raw) => {
            let port: u16 = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid PORT value: {raw}"))?;
            Ok(Some(port))
        }
        None => Ok(None),
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_i64(key: &str) -> Option<i64> {
    env_string(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_respects_scheme_and_host() {
        let mut config = RelayConfig::for_tests();
        config.relay_host = "relay.example.com".into();
        config.use_https = true;
        assert_eq!(config.ws_url("tok"), "wss://relay.example.com/ws?token=tok");
        config.use_https = false;
        assert_eq!(config.ws_url("tok"), "ws://relay.example.com/ws?token=tok");
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(parse_algorithm("RS256").is_err());
        assert!(parse_algorithm("HS512").is_ok());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.toml");
        std::fs::write(
            &path,
            "port = 9001\nrelay_host = \"r.example\"\nuse_https = false\njwt_issuer = \"test-relay\"\n",
        )
        .unwrap();

        let config = RelayConfig::load(None, None, None, Some(&path)).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.relay_host, "r.example");
        assert!(!config.use_https);
        assert_eq!(config.jwt_issuer, "test-relay");
    }

    #[test]
    fn cli_flags_beat_the_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.toml");
        std::fs::write(&path, "port = 9001\nhost = \"10.0.0.1\"\n").unwrap();

        let config = RelayConfig::load(
            Some("127.0.0.1".into()),
            Some(4444),
            None,
            Some(&path),
        )
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4444);
    }
}

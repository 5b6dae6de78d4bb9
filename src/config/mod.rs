//! Client configuration: key material, signing scheme, network endpoints,
//! and the defaults handed to the rate limiter, WebSocket reconnect loop,
//! and REST transport.
//!
//! Loaded once at process startup from a TOML file and treated as
//! immutable thereafter. Secrets are masked behind a `SecretString` newtype
//! and can be supplied inline or via an environment variable override.

use crate::ratelimit::ClassLimit;
use crate::signer::{Signer, SignerError};
use crate::ws::ReconnectPolicy;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("key material for scheme {scheme:?} requires {field}")]
    MissingKeyField { scheme: SignatureScheme, field: &'static str },
    #[error("failed to read key file {path}: {source}")]
    KeyFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// A secret value that never renders in `Debug`/`Display` output.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***redacted***")
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    Hmac,
    Ed25519,
    Rsa,
}

/// Signature scheme plus whatever material it needs. HMAC reads `secret`
/// directly (optionally overridden by the environment variable named in
/// `secret_env`); ED25519 and RSA read a PEM file from `key_path`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyMaterial {
    pub scheme: SignatureScheme,
    pub api_key: String,
    #[serde(default)]
    pub secret: Option<SecretString>,
    #[serde(default)]
    pub secret_env: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<SecretString>,
}

impl KeyMaterial {
    fn resolved_secret(&self) -> Option<String> {
        if let Some(var) = &self.secret_env {
            if let Ok(value) = std::env::var(var) {
                return Some(value);
            }
        }
        self.secret.as_ref().map(|s| s.expose().to_string())
    }

    /// Builds the `Signer` this key material describes. Malformed or
    /// missing key material fails here, at construction, not on the first
    /// signed request.
    pub fn build_signer(&self) -> Result<Signer, ConfigError> {
        match self.scheme {
            SignatureScheme::Hmac => {
                let secret = self.resolved_secret().ok_or(ConfigError::MissingKeyField {
                    scheme: self.scheme,
                    field: "secret or secret_env",
                })?;
                Ok(Signer::hmac(secret)?)
            }
            SignatureScheme::Ed25519 => {
                let path = self.key_path.as_ref().ok_or(ConfigError::MissingKeyField {
                    scheme: self.scheme,
                    field: "key_path",
                })?;
                let pem = read_key_file(path)?;
                Ok(Signer::ed25519_from_pem(&pem)?)
            }
            SignatureScheme::Rsa => {
                let path = self.key_path.as_ref().ok_or(ConfigError::MissingKeyField {
                    scheme: self.scheme,
                    field: "key_path",
                })?;
                let pem = read_key_file(path)?;
                Ok(Signer::rsa_from_pem(&pem)?)
            }
        }
    }
}

fn read_key_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::KeyFileIo {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Live,
    Testnet,
}

impl Environment {
    pub fn rest_base_url(&self) -> &'static str {
        match self {
            Environment::Live => "https://api.binance.com",
            Environment::Testnet => "https://testnet.binance.vision",
        }
    }

    pub fn ws_base_url(&self) -> &'static str {
        match self {
            Environment::Live => "wss://ws-api.binance.com:443/ws-api/v3",
            Environment::Testnet => "wss://testnet.binance.vision/ws-api/v3",
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassLimitConfig {
    pub class: String,
    pub window_ms: u64,
    pub max: u32,
}

impl From<&ClassLimitConfig> for ClassLimit {
    fn from(c: &ClassLimitConfig) -> Self {
        ClassLimit {
            class: c.class.clone(),
            window: Duration::from_millis(c.window_ms),
            max: c.max,
        }
    }
}

fn default_rate_limits() -> Vec<ClassLimitConfig> {
    vec![
        ClassLimitConfig {
            class: "REQUEST_WEIGHT".to_string(),
            window_ms: 60_000,
            max: 1_200,
        },
        ClassLimitConfig {
            class: "ORDERS".to_string(),
            window_ms: 10_000,
            max: 100,
        },
        ClassLimitConfig {
            class: "CONNECTIONS".to_string(),
            window_ms: 300_000,
            max: 300,
        },
    ]
}

fn default_recv_window_ms() -> i64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    20_000
}

fn default_ws_reply_timeout_ms() -> u64 {
    10_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// The complete, immutable configuration record for one client. Created
/// once at process startup via [`ClientConfig::from_toml_str`] or
/// [`ClientConfig::from_file`].
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub key_material: KeyMaterial,
    pub environment: Environment,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: i64,
    #[serde(default = "default_rate_limits")]
    pub rate_limits: Vec<ClassLimitConfig>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_ws_reply_timeout_ms")]
    pub ws_reply_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// `ReconnectConfig` with every field defaulted, so a config file may omit
/// the `[reconnect]` table entirely.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(c: &ReconnectConfig) -> Self {
        ReconnectPolicy {
            max_attempts: c.max_attempts,
            initial_backoff: Duration::from_millis(c.initial_backoff_ms),
            max_backoff: Duration::from_millis(c.max_backoff_ms),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn rate_limits(&self) -> Vec<ClassLimit> {
        self.rate_limits.iter().map(ClassLimit::from).collect()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from(&self.reconnect)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn ws_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_reply_timeout_ms)
    }

    pub fn proxy(&self) -> Result<Option<reqwest::Proxy>, ConfigError> {
        match &self.proxy {
            Some(url) => Ok(Some(reqwest::Proxy::all(url).map_err(|e| ConfigError::Io {
                path: PathBuf::from(url),
                source: std::io::Error::other(e),
            })?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_config_parses_and_builds_signer() {
        let toml = r#"
            [key_material]
            scheme = "hmac"
            api_key = "abc123"
            secret = "shh"

            environment = "testnet"
        "#;
        let config = ClientConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.environment.rest_base_url(), "https://testnet.binance.vision");
        assert_eq!(config.recv_window_ms, 5_000);
        assert!(config.key_material.build_signer().is_ok());
    }

    #[test]
    fn secret_env_overrides_inline_secret() {
        let toml = r#"
            [key_material]
            scheme = "hmac"
            api_key = "abc123"
            secret = "inline"
            secret_env = "BINANCE_CORE_TEST_SECRET"

            environment = "live"
        "#;
        std::env::set_var("BINANCE_CORE_TEST_SECRET", "from-env");
        let config = ClientConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.key_material.resolved_secret().unwrap(), "from-env");
        std::env::remove_var("BINANCE_CORE_TEST_SECRET");
    }

    #[test]
    fn missing_key_path_for_ed25519_is_a_config_error() {
        let toml = r#"
            [key_material]
            scheme = "ed25519"
            api_key = "abc123"

            environment = "live"
        "#;
        let config = ClientConfig::from_toml_str(toml).unwrap();
        assert!(matches!(
            config.key_material.build_signer(),
            Err(ConfigError::MissingKeyField { .. })
        ));
    }

    #[test]
    fn secret_is_masked_in_debug_output() {
        let secret = SecretString("super-secret".to_string());
        assert_eq!(format!("{secret:?}"), "***redacted***");
    }

    #[test]
    fn rate_limits_default_when_omitted() {
        let toml = r#"
            [key_material]
            scheme = "hmac"
            api_key = "abc123"
            secret = "shh"

            environment = "live"
        "#;
        let config = ClientConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.rate_limits().len(), 3);
    }

    #[test]
    fn from_file_reads_a_toml_config_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [key_material]
            scheme = "hmac"
            api_key = "abc123"
            secret = "shh"

            environment = "testnet"
            recv_window_ms = 4000
            "#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.recv_window_ms, 4_000);
        assert!(matches!(config.environment, Environment::Testnet));
    }

    #[test]
    fn from_file_reports_io_error_for_missing_path() {
        let err = ClientConfig::from_file("/nonexistent/binance-core.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

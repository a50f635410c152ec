//! Crate configuration.
//!
//! A single explicit struct replaces chained setter calls: build it (or read
//! it from the environment) and validate it once, then hand it to
//! [`KeyStore::initialize`](crate::keys::KeyStore::initialize) and the other
//! component constructors.

use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Issuer written into locally signed tokens when none is configured.
pub const DEFAULT_ISSUER: &str = "admission-core";

/// Audience claim default, filled in when callers don't supply `aud`.
pub const DEFAULT_AUDIENCE: &str = "general";

/// Auth tokens default to five minutes.
pub const DEFAULT_AUTH_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// Refresh tokens default to thirty minutes.
pub const DEFAULT_REFRESH_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// How often the external provider JWKS is re-fetched by default.
pub const DEFAULT_JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default bound on the number of cached rate-limit buckets.
pub const DEFAULT_BUCKET_CACHE_CAPACITY: usize = 1024;

/// Buckets idle for longer than this are eligible for eviction.
pub const DEFAULT_BUCKET_IDLE_TTL: Duration = Duration::from_secs(10 * 60);

const DEFAULT_PUBLIC_KEY_FILE: &str = "publicKey.pem";
const DEFAULT_PRIVATE_KEY_FILE: &str = "privateKey.pem";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("issuer must not be empty")]
    EmptyIssuer,
    #[error("audience must not be empty")]
    EmptyAudience,
    #[error("symmetric key mode requires a non-empty secret")]
    EmptySecret,
    #[error("token TTLs must be greater than zero")]
    ZeroTtl,
    #[error("invalid value for {0}: {1}")]
    InvalidEnv(&'static str, String),
}

/// Which kind of key material signs tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// HS512 over a shared secret.
    Symmetric,
    /// RS256 over an RSA key pair loaded from (or generated into) PEM files.
    Asymmetric,
}

/// External identity provider whose public key is adopted for validation.
#[derive(Debug, Clone)]
pub struct ExternalProviderConfig {
    /// JWKS document URL.
    pub jwks_url: String,
    /// Issuer expected in tokens signed by the provider.
    pub issuer: String,
    /// Interval between background JWKS refreshes.
    pub refresh_interval: Duration,
}

#[derive(Clone)]
pub struct Config {
    pub issuer: String,
    pub audience: String,
    pub key_mode: KeyMode,
    pub secret: SecretString,
    pub public_key_file: PathBuf,
    pub private_key_file: PathBuf,
    pub auth_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub external_provider: Option<ExternalProviderConfig>,
    pub bucket_cache_capacity: usize,
    pub bucket_idle_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            key_mode: KeyMode::Symmetric,
            secret: SecretString::default(),
            public_key_file: PathBuf::from(DEFAULT_PUBLIC_KEY_FILE),
            private_key_file: PathBuf::from(DEFAULT_PRIVATE_KEY_FILE),
            auth_token_ttl: DEFAULT_AUTH_TOKEN_TTL,
            refresh_token_ttl: DEFAULT_REFRESH_TOKEN_TTL,
            external_provider: None,
            bucket_cache_capacity: DEFAULT_BUCKET_CACHE_CAPACITY,
            bucket_idle_ttl: DEFAULT_BUCKET_IDLE_TTL,
        }
    }
}

impl Config {
    /// Build a configuration from `ADMISSION_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unparseable value or the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        let key_mode = match env::var("ADMISSION_KEY_MODE").ok().as_deref() {
            Some("asymmetric") => KeyMode::Asymmetric,
            Some("symmetric") | None => KeyMode::Symmetric,
            Some(other) => {
                return Err(ConfigError::InvalidEnv(
                    "ADMISSION_KEY_MODE",
                    other.to_string(),
                ));
            }
        };

        let external_provider = env::var("ADMISSION_JWKS_URL").ok().map(|jwks_url| {
            let issuer =
                env::var("ADMISSION_EXTERNAL_ISSUER").unwrap_or_else(|_| jwks_url.clone());
            ExternalProviderConfig {
                jwks_url,
                issuer,
                refresh_interval: duration_from_env(
                    "ADMISSION_JWKS_REFRESH_SECONDS",
                    DEFAULT_JWKS_REFRESH_INTERVAL,
                ),
            }
        });

        let config = Self {
            issuer: env::var("ADMISSION_ISSUER").unwrap_or_else(|_| DEFAULT_ISSUER.to_string()),
            audience: env::var("ADMISSION_AUDIENCE")
                .unwrap_or_else(|_| DEFAULT_AUDIENCE.to_string()),
            key_mode,
            secret: SecretString::from(env::var("ADMISSION_SECRET").unwrap_or_default()),
            public_key_file: env::var("ADMISSION_PUBLIC_KEY_FILE")
                .map_or_else(|_| PathBuf::from(DEFAULT_PUBLIC_KEY_FILE), PathBuf::from),
            private_key_file: env::var("ADMISSION_PRIVATE_KEY_FILE")
                .map_or_else(|_| PathBuf::from(DEFAULT_PRIVATE_KEY_FILE), PathBuf::from),
            auth_token_ttl: duration_from_env("ADMISSION_AUTH_TTL_SECONDS", DEFAULT_AUTH_TOKEN_TTL),
            refresh_token_ttl: duration_from_env(
                "ADMISSION_REFRESH_TTL_SECONDS",
                DEFAULT_REFRESH_TOKEN_TTL,
            ),
            external_provider,
            bucket_cache_capacity: env::var("ADMISSION_BUCKET_CACHE_CAPACITY")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_BUCKET_CACHE_CAPACITY),
            bucket_idle_ttl: duration_from_env(
                "ADMISSION_BUCKET_IDLE_TTL_SECONDS",
                DEFAULT_BUCKET_IDLE_TTL,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every component relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant: empty issuer or audience, a zero
    /// TTL, or symmetric mode without a secret.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.is_empty() {
            return Err(ConfigError::EmptyIssuer);
        }
        if self.audience.is_empty() {
            return Err(ConfigError::EmptyAudience);
        }
        if self.auth_token_ttl.is_zero() || self.refresh_token_ttl.is_zero() {
            return Err(ConfigError::ZeroTtl);
        }
        if self.key_mode == KeyMode::Symmetric && self.secret.expose_secret().is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("key_mode", &self.key_mode)
            .field("secret", &"***")
            .field("public_key_file", &self.public_key_file)
            .field("private_key_file", &self.private_key_file)
            .field("auth_token_ttl", &self.auth_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("external_provider", &self.external_provider)
            .field("bucket_cache_capacity", &self.bucket_cache_capacity)
            .field("bucket_idle_ttl", &self.bucket_idle_ttl)
            .finish()
    }
}

fn duration_from_env(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .map_or(default, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symmetric_config() -> Config {
        Config {
            secret: SecretString::from("test-secret".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.issuer, DEFAULT_ISSUER);
        assert_eq!(config.audience, DEFAULT_AUDIENCE);
        assert_eq!(config.key_mode, KeyMode::Symmetric);
        assert_eq!(config.auth_token_ttl, Duration::from_secs(300));
        assert_eq!(config.refresh_token_ttl, Duration::from_secs(1800));
        assert!(config.external_provider.is_none());
    }

    #[test]
    fn validate_accepts_symmetric_with_secret() {
        assert!(symmetric_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_secret_in_symmetric_mode() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::EmptySecret)));
    }

    #[test]
    fn validate_allows_asymmetric_without_secret() {
        let config = Config {
            key_mode: KeyMode::Asymmetric,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_issuer() {
        let config = Config {
            issuer: String::new(),
            ..symmetric_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyIssuer)));
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let config = Config {
            auth_token_ttl: Duration::ZERO,
            ..symmetric_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTtl)));
    }

    #[test]
    fn from_env_reads_overrides() {
        temp_env::with_vars(
            [
                ("ADMISSION_ISSUER", Some("issuer.test")),
                ("ADMISSION_AUDIENCE", Some("aud.test")),
                ("ADMISSION_SECRET", Some("s3cret")),
                ("ADMISSION_AUTH_TTL_SECONDS", Some("120")),
                ("ADMISSION_REFRESH_TTL_SECONDS", Some("3600")),
            ],
            || {
                let config = Config::from_env().expect("config should build");
                assert_eq!(config.issuer, "issuer.test");
                assert_eq!(config.audience, "aud.test");
                assert_eq!(config.auth_token_ttl, Duration::from_secs(120));
                assert_eq!(config.refresh_token_ttl, Duration::from_secs(3600));
            },
        );
    }

    #[test]
    fn from_env_builds_external_provider_block() {
        temp_env::with_vars(
            [
                ("ADMISSION_SECRET", Some("s3cret")),
                ("ADMISSION_JWKS_URL", Some("https://idp.test/jwks")),
                ("ADMISSION_EXTERNAL_ISSUER", Some("https://idp.test")),
                ("ADMISSION_JWKS_REFRESH_SECONDS", Some("60")),
            ],
            || {
                let config = Config::from_env().expect("config should build");
                let external = config.external_provider.expect("external block expected");
                assert_eq!(external.jwks_url, "https://idp.test/jwks");
                assert_eq!(external.issuer, "https://idp.test");
                assert_eq!(external.refresh_interval, Duration::from_secs(60));
            },
        );
    }

    #[test]
    fn from_env_rejects_unknown_key_mode() {
        temp_env::with_vars(
            [
                ("ADMISSION_SECRET", Some("s3cret")),
                ("ADMISSION_KEY_MODE", Some("quantum")),
            ],
            || {
                assert!(matches!(
                    Config::from_env(),
                    Err(ConfigError::InvalidEnv("ADMISSION_KEY_MODE", _))
                ));
            },
        );
    }

    #[test]
    fn debug_masks_secret() {
        let rendered = format!("{:?}", symmetric_config());
        assert!(rendered.contains("***"));
        assert!(!rendered.contains("test-secret"));
    }
}

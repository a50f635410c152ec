//! Token issuance: access/refresh pairs and transaction tokens.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{Claims, DEFAULT_ROLE, TokenError, sign};
use crate::config::{Config, DEFAULT_AUTH_TOKEN_TTL};
use crate::keys::KeyStore;

/// Ceiling on auth-token TTLs; anything above falls back to the default.
pub const AUTH_TTL_CEILING: Duration = Duration::from_secs(30 * 60);

/// Floor on refresh-token TTLs; anything below is raised to it.
pub const REFRESH_TTL_FLOOR: Duration = Duration::from_secs(30 * 60);

/// Transaction tokens prove intent for a single sensitive operation and
/// outlive nothing: two minutes, well under the access-token default.
pub const TRANSACTION_TOKEN_TTL: Duration = Duration::from_secs(120);

/// Effective token lifetimes after policy clamping.
///
/// An out-of-policy auth TTL is silently substituted with the default
/// rather than rejected; callers relying on a longer session must go
/// through the refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    auth_ttl: Duration,
    refresh_ttl: Duration,
}

impl ExpiryPolicy {
    #[must_use]
    pub fn new(auth_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            auth_ttl: if auth_ttl > AUTH_TTL_CEILING {
                DEFAULT_AUTH_TOKEN_TTL
            } else {
                auth_ttl
            },
            refresh_ttl: refresh_ttl.max(REFRESH_TTL_FLOOR),
        }
    }

    #[must_use]
    pub const fn auth_ttl(&self) -> Duration {
        self.auth_ttl
    }

    #[must_use]
    pub const fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }
}

/// The issuance result handed back to the caller at login/refresh time.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token TTL in seconds.
    pub expires_in: u64,
    /// Refresh-token TTL in seconds.
    pub refresh_expires_in: u64,
    pub token_type: String,
    /// Fresh session identifier.
    pub session_state: String,
    pub scope: String,
}

/// Builds signed tokens with claims merged over defaults.
///
/// Stateless apart from reading the [`KeyStore`]; safe for unlimited
/// concurrent callers.
pub struct TokenIssuer {
    store: Arc<KeyStore>,
    policy: ExpiryPolicy,
    audience: String,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(store: Arc<KeyStore>, config: &Config) -> Self {
        Self {
            store,
            policy: ExpiryPolicy::new(config.auth_token_ttl, config.refresh_token_ttl),
            audience: config.audience.clone(),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    /// Issue an access/refresh token pair for `subject`.
    ///
    /// Caller extras may supply `aud`, `jti`, and `rol`; missing ones are
    /// defaulted (configured audience, fresh UUID, [`DEFAULT_ROLE`]).
    /// `sub`, `iss`, `iat`, and `exp` are always issuer-controlled.
    ///
    /// # Errors
    ///
    /// Returns an error if claim encoding or signing fails.
    pub fn issue_token_pair(
        &self,
        subject: &str,
        extra_claims: BTreeMap<String, Value>,
    ) -> Result<TokenPair, TokenError> {
        self.issue_pair_at(subject, extra_claims, Utc::now().timestamp_millis())
    }

    pub(crate) fn issue_pair_at(
        &self,
        subject: &str,
        extra_claims: BTreeMap<String, Value>,
        now_millis: i64,
    ) -> Result<TokenPair, TokenError> {
        let access_token =
            self.issue_at(subject, extra_claims.clone(), self.policy.auth_ttl, now_millis)?;
        let refresh_token =
            self.issue_at(subject, extra_claims, self.policy.refresh_ttl, now_millis)?;

        debug!(subject, "issued token pair");

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.policy.auth_ttl.as_secs(),
            refresh_expires_in: self.policy.refresh_ttl.as_secs(),
            token_type: "Bearer".to_string(),
            session_state: Uuid::new_v4().to_string(),
            scope: String::new(),
        })
    }

    /// Issue a short-lived transaction token carrying only `sub` plus
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if claim encoding or signing fails.
    pub fn issue_transaction_token(&self, subject: &str) -> Result<String, TokenError> {
        self.issue_transaction_token_at(subject, Utc::now().timestamp_millis())
    }

    pub(crate) fn issue_transaction_token_at(
        &self,
        subject: &str,
        now_millis: i64,
    ) -> Result<String, TokenError> {
        self.issue_at(subject, BTreeMap::new(), TRANSACTION_TOKEN_TTL, now_millis)
    }

    fn issue_at(
        &self,
        subject: &str,
        mut extra: BTreeMap<String, Value>,
        ttl: Duration,
        now_millis: i64,
    ) -> Result<String, TokenError> {
        let aud = take_string(&mut extra, "aud").unwrap_or_else(|| self.audience.clone());
        let jti = take_string(&mut extra, "jti").unwrap_or_else(|| Uuid::new_v4().to_string());
        let rol = take_string(&mut extra, "rol").unwrap_or_else(|| DEFAULT_ROLE.to_string());

        // Issuer-controlled members never come from caller extras.
        for reserved in ["sub", "iss", "iat", "exp"] {
            extra.remove(reserved);
        }

        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: subject.to_string(),
            iss: self.store.local_issuer(),
            aud,
            jti,
            rol: Some(rol),
            iat: now_millis,
            exp: now_millis.saturating_add(ttl_millis),
            extra,
        };

        sign(&claims, &self.store.signing_key())
    }
}

fn take_string(map: &mut BTreeMap<String, Value>, key: &str) -> Option<String> {
    let value = map.remove(key)?;
    value.as_str().map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_AUDIENCE;
    use crate::token::{KeySelector, TokenValidator};
    use anyhow::Result;
    use secrecy::SecretString;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn test_config() -> Config {
        Config {
            secret: SecretString::from("issuer-test-secret".to_string()),
            ..Config::default()
        }
    }

    fn test_parts(config: &Config) -> Result<(TokenIssuer, TokenValidator)> {
        let store = Arc::new(KeyStore::initialize(config)?);
        Ok((
            TokenIssuer::new(store.clone(), config),
            TokenValidator::new(store),
        ))
    }

    #[test]
    fn expiry_policy_clamps_auth_ttl_above_ceiling() {
        let policy = ExpiryPolicy::new(Duration::from_secs(2 * 60 * 60), REFRESH_TTL_FLOOR);
        assert_eq!(policy.auth_ttl(), DEFAULT_AUTH_TOKEN_TTL);
    }

    #[test]
    fn expiry_policy_keeps_auth_ttl_at_ceiling() {
        let policy = ExpiryPolicy::new(AUTH_TTL_CEILING, REFRESH_TTL_FLOOR);
        assert_eq!(policy.auth_ttl(), AUTH_TTL_CEILING);
    }

    #[test]
    fn expiry_policy_raises_refresh_ttl_to_floor() {
        let policy = ExpiryPolicy::new(DEFAULT_AUTH_TOKEN_TTL, Duration::from_secs(60));
        assert_eq!(policy.refresh_ttl(), REFRESH_TTL_FLOOR);
    }

    #[test]
    fn issued_pair_fills_default_claims() -> Result<()> {
        let config = test_config();
        let (issuer, validator) = test_parts(&config)?;

        let pair = issuer.issue_pair_at("jane.doe", BTreeMap::new(), NOW)?;
        let claims = validator.parse_at(&pair.access_token, KeySelector::Local, NOW)?;

        assert_eq!(claims.sub, "jane.doe");
        assert_eq!(claims.aud, DEFAULT_AUDIENCE);
        assert_eq!(claims.rol.as_deref(), Some(DEFAULT_ROLE));
        assert!(!claims.jti.is_empty());
        assert_eq!(claims.iat, NOW);
        Ok(())
    }

    #[test]
    fn caller_extras_take_precedence_over_defaults() -> Result<()> {
        let config = test_config();
        let (issuer, validator) = test_parts(&config)?;

        let mut extras = BTreeMap::new();
        extras.insert("aud".to_string(), json!("custom-audience"));
        extras.insert("rol".to_string(), json!("Admin"));
        extras.insert("tenant".to_string(), json!("acme"));

        let pair = issuer.issue_pair_at("jane.doe", extras, NOW)?;
        let claims = validator.parse_at(&pair.access_token, KeySelector::Local, NOW)?;

        assert_eq!(claims.aud, "custom-audience");
        assert_eq!(claims.rol.as_deref(), Some("Admin"));
        assert_eq!(claims.extra.get("tenant"), Some(&json!("acme")));
        Ok(())
    }

    #[test]
    fn reserved_extras_are_issuer_controlled() -> Result<()> {
        let config = test_config();
        let (issuer, validator) = test_parts(&config)?;

        let mut extras = BTreeMap::new();
        extras.insert("sub".to_string(), json!("mallory"));
        extras.insert("iss".to_string(), json!("evil-issuer"));
        extras.insert("exp".to_string(), json!(0));

        let pair = issuer.issue_pair_at("jane.doe", extras, NOW)?;
        let claims = validator.parse_at(&pair.access_token, KeySelector::Local, NOW)?;

        assert_eq!(claims.sub, "jane.doe");
        assert_eq!(claims.iss, config.issuer);
        assert_eq!(claims.exp, NOW + 300_000);
        assert!(claims.extra.is_empty());
        Ok(())
    }

    #[test]
    fn access_and_refresh_ttls_differ() -> Result<()> {
        let config = test_config();
        let (issuer, validator) = test_parts(&config)?;

        let pair = issuer.issue_pair_at("jane.doe", BTreeMap::new(), NOW)?;
        assert_eq!(pair.expires_in, 300);
        assert_eq!(pair.refresh_expires_in, 1800);
        assert_eq!(pair.token_type, "Bearer");
        assert!(!pair.session_state.is_empty());

        let access = validator.parse_at(&pair.access_token, KeySelector::Local, NOW)?;
        let refresh = validator.parse_at(&pair.refresh_token, KeySelector::Local, NOW)?;
        assert_eq!(access.exp, NOW + 300_000);
        assert_eq!(refresh.exp, NOW + 1_800_000);
        Ok(())
    }

    #[test]
    fn out_of_policy_ttl_expires_at_the_default_mark() -> Result<()> {
        // Two hours requested, thirty-minute ceiling: the token must expire
        // at the five-minute default, not two hours later.
        let config = Config {
            auth_token_ttl: Duration::from_secs(2 * 60 * 60),
            ..test_config()
        };
        let (issuer, validator) = test_parts(&config)?;

        let pair = issuer.issue_pair_at("jane.doe", BTreeMap::new(), NOW)?;
        let claims = validator.parse_at(&pair.access_token, KeySelector::Local, NOW)?;
        assert_eq!(claims.exp, NOW + 300_000);

        let after_default = validator.parse_at(
            &pair.access_token,
            KeySelector::Local,
            NOW + 300_000 + 1_000,
        );
        assert!(matches!(after_default, Err(TokenError::Expired)));
        Ok(())
    }

    #[test]
    fn transaction_token_is_short_lived() -> Result<()> {
        let config = test_config();
        let (issuer, validator) = test_parts(&config)?;

        let token = issuer.issue_transaction_token_at("jane.doe", NOW)?;
        let claims = validator.parse_at(&token, KeySelector::Local, NOW)?;
        assert_eq!(claims.sub, "jane.doe");
        assert_eq!(claims.exp, NOW + 120_000);
        assert!(claims.extra.is_empty());

        let expired = validator.parse_at(&token, KeySelector::Local, NOW + 121_000);
        assert!(matches!(expired, Err(TokenError::Expired)));
        Ok(())
    }

    #[test]
    fn fresh_jti_per_token() -> Result<()> {
        let config = test_config();
        let (issuer, validator) = test_parts(&config)?;

        let first = issuer.issue_pair_at("jane.doe", BTreeMap::new(), NOW)?;
        let second = issuer.issue_pair_at("jane.doe", BTreeMap::new(), NOW)?;
        let first_claims = validator.parse_at(&first.access_token, KeySelector::Local, NOW)?;
        let second_claims = validator.parse_at(&second.access_token, KeySelector::Local, NOW)?;
        assert_ne!(first_claims.jti, second_claims.jti);
        Ok(())
    }
}

//! Token lifecycle and admission control.
//!
//! Issuance, validation, and expiry of signed access/refresh/transaction
//! tokens, plus the per-subscription-key rate-limiting gate in front of
//! backend calls. The crate is a library: callers (HTTP layers, CLIs) map
//! its typed errors onto their own responses.
//!
//! ```no_run
//! use admission_core::{Config, KeySelector, KeyStore, RateLimiter, TokenIssuer, TokenValidator};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let store = Arc::new(KeyStore::initialize(&config)?);
//! let issuer = TokenIssuer::new(store.clone(), &config);
//! let validator = TokenValidator::new(store);
//! let limiter = RateLimiter::from_config(&config);
//!
//! if limiter.admit("STD3000-ABCDE") {
//!     let pair = issuer.issue_token_pair("jane.doe", BTreeMap::new())?;
//!     let claims = validator.parse(&pair.access_token, KeySelector::Local)?;
//!     assert_eq!(claims.sub, "jane.doe");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod keys;
pub mod ratelimit;
pub mod token;

pub use config::{Config, ConfigError, ExternalProviderConfig, KeyMode};
pub use keys::{Algorithm, Jwk, JwkSet, KeyInitError, KeyMaterial, KeyStore, ValidatorKey};
pub use ratelimit::{LimitExceededError, PlanLimit, RateLimiter, SubscriptionPlan};
pub use token::{
    Claims, ExpiryPolicy, KeySelector, TokenError, TokenIssuer, TokenPair, TokenValidator,
};

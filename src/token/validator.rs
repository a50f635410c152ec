//! Token verification and claim extraction.

use chrono::Utc;
use std::sync::Arc;

use super::{Claims, TokenError, verify};
use crate::keys::KeyStore;

/// Which validator key a parse runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySelector {
    /// The local key the process signs with. Tokens issued here before an
    /// external key adoption stay verifiable through this selector.
    Local,
    /// The externally adopted provider key, falling back to the local key
    /// when none has been adopted.
    External,
}

/// Verifies tokens against the [`KeyStore`] and extracts claims.
///
/// Stateless; safe for unlimited concurrent callers.
pub struct TokenValidator {
    store: Arc<KeyStore>,
}

impl TokenValidator {
    #[must_use]
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    /// Verify `token` and return its claims.
    ///
    /// # Errors
    ///
    /// - [`TokenError::TokenFormat`], [`TokenError::Base64`], or
    ///   [`TokenError::Json`] for structurally invalid input
    /// - [`TokenError::InvalidSignature`] when verification fails
    /// - [`TokenError::IssuerMismatch`] when `iss` isn't the expected issuer
    /// - [`TokenError::Expired`] when `exp` has passed
    pub fn parse(&self, token: &str, selector: KeySelector) -> Result<Claims, TokenError> {
        self.parse_at(token, selector, Utc::now().timestamp_millis())
    }

    pub(crate) fn parse_at(
        &self,
        token: &str,
        selector: KeySelector,
        now_millis: i64,
    ) -> Result<Claims, TokenError> {
        let (key, expected_issuer) = match selector {
            KeySelector::Local => (self.store.validator_key(false), self.store.local_issuer()),
            KeySelector::External => (self.store.validator_key(true), self.store.issuer()),
        };
        verify(token, &key, &expected_issuer, now_millis)
    }

    /// Whether `token` is live and belongs to `subject`.
    ///
    /// Any parse failure maps to `false`; callers needing the failure detail
    /// must use [`parse`](Self::parse).
    #[must_use]
    pub fn validate(&self, subject: &str, token: &str) -> bool {
        self.validate_at(subject, token, Utc::now().timestamp_millis())
    }

    pub(crate) fn validate_at(&self, subject: &str, token: &str, now_millis: i64) -> bool {
        self.parse_at(token, KeySelector::External, now_millis)
            .map(|claims| claims.sub == subject)
            .unwrap_or(false)
    }

    /// The role carried by `token`, [`PUBLIC_ROLE`](super::PUBLIC_ROLE)
    /// when unclaimed.
    ///
    /// # Errors
    ///
    /// Same failures as [`parse`](Self::parse); an unverifiable token has no
    /// role, not even `Public`.
    pub fn role_of(&self, token: &str) -> Result<String, TokenError> {
        self.role_of_at(token, Utc::now().timestamp_millis())
    }

    pub(crate) fn role_of_at(&self, token: &str, now_millis: i64) -> Result<String, TokenError> {
        let claims = self.parse_at(token, KeySelector::External, now_millis)?;
        Ok(claims.role().to_string())
    }
}

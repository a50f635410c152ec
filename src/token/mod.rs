//! Compact signed tokens: claims, wire codec, signing and verification.
//!
//! Tokens are `header.claims.signature` strings with base64url-unpadded JSON
//! segments, signed HS512 (symmetric mode) or RS256 (asymmetric mode).
//! Timestamps (`iat`/`exp`) are epoch milliseconds.

mod issuer;
mod validator;

pub use issuer::{
    AUTH_TTL_CEILING, ExpiryPolicy, REFRESH_TTL_FLOOR, TRANSACTION_TOKEN_TTL, TokenIssuer,
    TokenPair,
};
pub use validator::{KeySelector, TokenValidator};

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Sha256, Sha512};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::keys::{Algorithm, KeyMaterial, ValidatorKey};

/// Role written into tokens that don't ask for one.
pub const DEFAULT_ROLE: &str = "User";

/// Role reported for tokens that carry no `rol` claim at all: unclaimed
/// tokens are least-privileged.
pub const PUBLIC_ROLE: &str = "Public";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid issuer")]
    IssuerMismatch,
    #[error("token expired")]
    Expired,
    #[error("key material cannot sign")]
    NotASigningKey,
    #[error("failed to sign token")]
    Signing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
}

impl TokenHeader {
    #[must_use]
    pub fn for_algorithm(algorithm: Algorithm) -> Self {
        Self {
            alg: algorithm.as_str().to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Token payload. Reserved members are typed fields; anything else the
/// caller supplied rides along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Unique token id, fresh per token.
    pub jti: String,
    /// Role; absent on tokens from issuers that don't assign one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rol: Option<String>,
    /// Issued-at, epoch milliseconds.
    pub iat: i64,
    /// Expiry, epoch milliseconds.
    pub exp: i64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Claims {
    /// Whether the token is expired at `now_millis`.
    #[must_use]
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.exp <= now_millis
    }

    /// The role, defaulting to [`PUBLIC_ROLE`] when unclaimed.
    #[must_use]
    pub fn role(&self) -> &str {
        self.rol.as_deref().unwrap_or(PUBLIC_ROLE)
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: DeserializeOwned>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn split_token(token: &str) -> Result<(&str, &str, &str), TokenError> {
    let mut parts = token.split('.');
    let header = parts.next().ok_or(TokenError::TokenFormat)?;
    let claims = parts.next().ok_or(TokenError::TokenFormat)?;
    let signature = parts.next().ok_or(TokenError::TokenFormat)?;
    if parts.next().is_some() {
        return Err(TokenError::TokenFormat);
    }
    Ok((header, claims, signature))
}

/// Sign `claims` into a compact token with the given key material.
///
/// # Errors
///
/// Returns an error if encoding fails, the key material is validation-only,
/// or the signing operation itself fails.
pub(crate) fn sign(claims: &Claims, key: &KeyMaterial) -> Result<String, TokenError> {
    let header = match key {
        KeyMaterial::Symmetric { .. } => TokenHeader::for_algorithm(Algorithm::Hs512),
        KeyMaterial::AsymmetricPair { .. } => TokenHeader::for_algorithm(Algorithm::Rs256),
        KeyMaterial::ExternalPublicKey { .. } => return Err(TokenError::NotASigningKey),
    };

    let header_b64 = b64e_json(&header)?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signature_bytes = match key {
        KeyMaterial::Symmetric { secret } => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret)
                .map_err(|_| TokenError::Signing)?;
            mac.update(signing_input.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        KeyMaterial::AsymmetricPair { private_key, .. } => {
            let signing_key = SigningKey::<Sha256>::new((**private_key).clone());
            let signature: Signature = signing_key
                .try_sign(signing_input.as_bytes())
                .map_err(|_| TokenError::Signing)?;
            signature.to_vec()
        }
        KeyMaterial::ExternalPublicKey { .. } => return Err(TokenError::NotASigningKey),
    };

    let signature_b64 = Base64UrlUnpadded::encode_string(&signature_bytes);
    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify a compact token and return its decoded claims.
///
/// Checks run in order: structure, header, algorithm/key agreement,
/// signature, issuer, expiry — so a tampered token never reaches the claim
/// checks.
///
/// # Errors
///
/// Returns the typed failure for the first check that does not hold.
pub(crate) fn verify(
    token: &str,
    key: &ValidatorKey,
    expected_issuer: &str,
    now_millis: i64,
) -> Result<Claims, TokenError> {
    let (header_b64, claims_b64, signature_b64) = split_token(token)?;

    let header: TokenHeader = b64d_json(header_b64)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature_bytes =
        Base64UrlUnpadded::decode_vec(signature_b64).map_err(|_| TokenError::Base64)?;

    match (header.alg.as_str(), key) {
        ("HS512", ValidatorKey::Hmac(secret)) => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret)
                .map_err(|_| TokenError::InvalidSignature)?;
            mac.update(signing_input.as_bytes());
            mac.verify_slice(&signature_bytes)
                .map_err(|_| TokenError::InvalidSignature)?;
        }
        ("RS256", ValidatorKey::Rsa(public_key)) => {
            let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
            let signature = Signature::try_from(signature_bytes.as_slice())
                .map_err(|_| TokenError::InvalidSignature)?;
            verifying_key
                .verify(signing_input.as_bytes(), &signature)
                .map_err(|_| TokenError::InvalidSignature)?;
        }
        _ => return Err(TokenError::UnsupportedAlg(header.alg)),
    }

    let claims: Claims = b64d_json(claims_b64)?;
    if claims.iss != expected_issuer {
        return Err(TokenError::IssuerMismatch);
    }
    if claims.is_expired_at(now_millis) {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}

use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};

use super::KeyInitError;

/// A JSON Web Key Set as published by an identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Parse a JWKS document from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not valid JSON or doesn't match the
    /// expected JWKS shape.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// The first RSA key usable for signature verification.
    ///
    /// Keys that declare a `use` other than `sig` are skipped; keys without a
    /// `use` member are accepted.
    #[must_use]
    pub fn first_signature_key(&self) -> Option<&Jwk> {
        self.keys
            .iter()
            .filter(|key| key.kty == "RSA")
            .find(|key| key.key_use.as_deref().is_none_or(|key_use| key_use == "sig"))
    }

    /// Find a key by `kid` (Key ID).
    #[must_use]
    pub fn find_by_kid(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|key| key.kid.as_deref() == Some(kid))
    }
}

/// A single RSA key descriptor (`n`/`e` base64url-encoded).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub n: String,
    pub e: String,
}

impl Jwk {
    /// Describe an `RsaPublicKey` as an RS256 signature JWK.
    #[must_use]
    pub fn from_rsa_public_key(public_key: &RsaPublicKey, kid: impl Into<String>) -> Self {
        Self {
            kty: "RSA".to_string(),
            alg: Some("RS256".to_string()),
            key_use: Some("sig".to_string()),
            kid: Some(kid.into()),
            n: Base64UrlUnpadded::encode_string(&public_key.n().to_bytes_be()),
            e: Base64UrlUnpadded::encode_string(&public_key.e().to_bytes_be()),
        }
    }

    /// Reconstruct the RSA public key from the `n`/`e` members.
    ///
    /// # Errors
    ///
    /// Returns an error if the base64url values cannot be decoded or the
    /// resulting modulus/exponent don't form a valid RSA key.
    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey, KeyInitError> {
        if self.kty != "RSA" {
            return Err(KeyInitError::Jwk(format!(
                "unsupported key type: {}",
                self.kty
            )));
        }
        let n_bytes = Base64UrlUnpadded::decode_vec(&self.n)
            .map_err(|_| KeyInitError::Jwk("invalid base64url modulus".to_string()))?;
        let e_bytes = Base64UrlUnpadded::decode_vec(&self.e)
            .map_err(|_| KeyInitError::Jwk("invalid base64url exponent".to_string()))?;
        let n = BigUint::from_bytes_be(&n_bytes);
        let e = BigUint::from_bytes_be(&e_bytes);
        RsaPublicKey::new(n, e).map_err(|err| KeyInitError::Jwk(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_rsa_private_key;

    #[test]
    fn jwk_round_trips_public_key() -> Result<(), KeyInitError> {
        let public_key = RsaPublicKey::from(test_rsa_private_key());
        let jwk = Jwk::from_rsa_public_key(&public_key, "k1");
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.kid.as_deref(), Some("k1"));
        assert_eq!(jwk.to_rsa_public_key()?, public_key);
        Ok(())
    }

    #[test]
    fn first_signature_key_skips_non_rsa_and_enc_keys() {
        let public_key = RsaPublicKey::from(test_rsa_private_key());
        let enc = Jwk {
            key_use: Some("enc".to_string()),
            ..Jwk::from_rsa_public_key(&public_key, "enc-key")
        };
        let ec = Jwk {
            kty: "EC".to_string(),
            ..Jwk::from_rsa_public_key(&public_key, "ec-key")
        };
        let sig = Jwk::from_rsa_public_key(&public_key, "sig-key");
        let jwks = JwkSet {
            keys: vec![enc, ec, sig],
        };
        assert_eq!(
            jwks.first_signature_key().and_then(|key| key.kid.as_deref()),
            Some("sig-key")
        );
    }

    #[test]
    fn find_by_kid_matches_exactly() {
        let public_key = RsaPublicKey::from(test_rsa_private_key());
        let jwks = JwkSet {
            keys: vec![Jwk::from_rsa_public_key(&public_key, "k2")],
        };
        assert!(jwks.find_by_kid("k2").is_some());
        assert!(jwks.find_by_kid("k1").is_none());
    }

    #[test]
    fn rejects_invalid_modulus_encoding() {
        let jwk = Jwk {
            kty: "RSA".to_string(),
            alg: None,
            key_use: None,
            kid: None,
            n: "!!!".to_string(),
            e: "AQAB".to_string(),
        };
        assert!(matches!(jwk.to_rsa_public_key(), Err(KeyInitError::Jwk(_))));
    }

    #[test]
    fn parses_provider_document() -> Result<(), serde_json::Error> {
        let doc = r#"{"keys":[{"kty":"RSA","use":"sig","kid":"idp-1","n":"AQAB","e":"AQAB"}]}"#;
        let jwks = JwkSet::from_json(doc)?;
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid.as_deref(), Some("idp-1"));
        Ok(())
    }
}

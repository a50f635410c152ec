//! External identity provider plumbing: JWKS fetch and background refresh.
//!
//! Everything here runs off the request path. A failed refresh keeps the
//! previously adopted key in place; validation never goes dark because the
//! provider had a bad day.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::sleep};
use tracing::{error, info, warn};

use super::{JwkSet, KeyStore};
use crate::config::ExternalProviderConfig;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const REFRESH_ATTEMPTS: u32 = 3;

/// Fetch and decode a JWKS document.
///
/// # Errors
///
/// Returns an error if the request fails, the endpoint answers with an error
/// status, or the body is not a valid JWKS document.
pub async fn fetch_jwks(client: &reqwest::Client, url: &str) -> Result<JwkSet> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch JWKS from {url}"))?
        .error_for_status()
        .context("JWKS endpoint returned an error status")?;

    let jwks: JwkSet = response
        .json()
        .await
        .context("failed to decode JWKS document")?;

    Ok(jwks)
}

/// Fetch the provider JWKS and adopt its first RSA signature key into the
/// store.
///
/// # Errors
///
/// Returns an error if the fetch fails, the document carries no usable RSA
/// key, or the key cannot be decoded.
pub async fn refresh_external_key(
    client: &reqwest::Client,
    jwks_url: &str,
    issuer: &str,
    store: &KeyStore,
) -> Result<()> {
    let jwks = fetch_jwks(client, jwks_url).await?;
    let jwk = jwks
        .first_signature_key()
        .context("JWKS document contains no RSA signature key")?;
    store.adopt_external_jwk(jwk, issuer)?;

    info!(
        issuer,
        kid = jwk.kid.as_deref().unwrap_or("-"),
        "external validator key refreshed"
    );

    Ok(())
}

/// Spawn the periodic JWKS refresh task.
///
/// Each cycle retries up to three times with exponential backoff; after that
/// the previous key stays active until the next interval.
pub fn spawn_refresh(store: Arc<KeyStore>, config: ExternalProviderConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                error!("Failed to build JWKS HTTP client: {err}");
                return;
            }
        };

        loop {
            for attempt in 1..=REFRESH_ATTEMPTS {
                let backoff_time = 2u64.pow(attempt - 1);

                if attempt > 1 {
                    warn!("Backing off for {} seconds", backoff_time);
                    sleep(Duration::from_secs(backoff_time)).await;
                }

                match refresh_external_key(&client, &config.jwks_url, &config.issuer, &store).await
                {
                    Ok(()) => break,
                    Err(err) => {
                        error!("Failed to refresh external key: {err:#}");

                        if attempt == REFRESH_ATTEMPTS {
                            warn!("Keeping previous validator key until next refresh");
                        }
                    }
                }
            }

            sleep(config.refresh_interval).await;
        }
    })
}

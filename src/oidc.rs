//! OIDC token verification against a provider's discovery document and JWKS.

use crate::config::join_url;
use dashmap::DashMap;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why a token was refused. The text is shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OidcError {
    #[error("Project is not eligible for OIDC credential exchange")]
    NotEligible,

    #[error("Failed to validate OIDC token")]
    DiscoveryFailed,

    #[error("Project is not eligible for JWKS backed OIDC credential exchange")]
    NoJwks,

    #[error("Invalid OIDC token provided")]
    InvalidToken,

    #[error("Invalid kid found in the token provided")]
    UnknownKid,

    #[error("Could not verify the provided token against the OIDC provider")]
    VerificationFailed,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: Option<String>,
    jwks_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    #[serde(default)]
    keys: Vec<Value>,
}

#[derive(Clone)]
struct CachedJwks {
    keys: Vec<Value>,
    fetched_at: Instant,
}

/// Verifies OIDC tokens. JWKS documents are cached per URI.
pub struct OidcValidator {
    http: Client,
    jwks: DashMap<String, CachedJwks>,
    ttl: Duration,
}

impl std::fmt::Debug for OidcValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcValidator")
            .field("cached_jwks", &self.jwks.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl OidcValidator {
    pub fn new(http: Client, ttl_secs: u64) -> Self {
        Self {
            http,
            jwks: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Verify `token` against the provider at `discovery_url` and return its claims.
    /// Audience is left to the caller's claim matcher.
    pub async fn validate(&self, discovery_url: Option<&str>, token: &str) -> Result<Value, OidcError> {
        let discovery_url = discovery_url.ok_or(OidcError::NotEligible)?;
        let document = self.discover(discovery_url).await?;
        let jwks_uri = document.jwks_uri.ok_or(OidcError::NoJwks)?;

        let (keys, from_cache) = self.keys(&jwks_uri, false).await?;
        let header = decode_header(token).map_err(|_| OidcError::InvalidToken)?;
        let kid = header.kid.as_deref();

        let key = match find_key(&keys, kid) {
            Some(key) => key,
            // Providers rotate keys, a miss on a cached set earns one refetch
            None if from_cache => {
                let (keys, _) = self.keys(&jwks_uri, true).await?;
                find_key(&keys, kid).ok_or(OidcError::UnknownKid)?
            }
            None => return Err(OidcError::UnknownKid),
        };

        let alg = key
            .get("alg")
            .and_then(Value::as_str)
            .and_then(|alg| Algorithm::from_str(alg).ok())
            .unwrap_or(header.alg);
        let jwk: Jwk = serde_json::from_value(key).map_err(|_| OidcError::VerificationFailed)?;
        let decoding_key = DecodingKey::from_jwk(&jwk).map_err(|_| OidcError::VerificationFailed)?;

        let mut validation = Validation::new(alg);
        validation.validate_aud = false;
        if let Some(issuer) = &document.issuer {
            validation.set_issuer(&[issuer]);
        }

        decode::<Value>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("OIDC token rejected: {}", e);
                OidcError::VerificationFailed
            })
    }

    async fn discover(&self, discovery_url: &str) -> Result<DiscoveryDocument, OidcError> {
        let url = join_url(discovery_url, ".well-known/openid-configuration");
        let response = self.http.get(&url).send().await.map_err(|e| {
            warn!("OIDC discovery failed for {}: {}", url, e);
            OidcError::DiscoveryFailed
        })?;
        if !response.status().is_success() {
            warn!("OIDC discovery returned {} for {}", response.status(), url);
            return Err(OidcError::DiscoveryFailed);
        }
        response.json().await.map_err(|e| {
            warn!("Malformed OIDC discovery document at {}: {}", url, e);
            OidcError::DiscoveryFailed
        })
    }

    /// Keys at `uri`, plus whether they came from the cache
    async fn keys(&self, uri: &str, force: bool) -> Result<(Vec<Value>, bool), OidcError> {
        if !force {
            if let Some(entry) = self.jwks.get(uri) {
                if entry.fetched_at.elapsed() <= self.ttl {
                    return Ok((entry.keys.clone(), true));
                }
            }
        }

        let response = self
            .http
            .get(uri)
            .send()
            .await
            .map_err(|_| OidcError::NoJwks)?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(OidcError::NoJwks);
        }
        let document: JwksDocument = response.json().await.map_err(|_| OidcError::NoJwks)?;

        self.jwks.insert(
            uri.to_string(),
            CachedJwks {
                keys: document.keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok((document.keys, false))
    }
}

fn find_key(keys: &[Value], kid: Option<&str>) -> Option<Value> {
    let kid = kid?;
    keys.iter()
        .find(|key| key.get("kid").and_then(Value::as_str) == Some(kid))
        .cloned()
}

//! Connection authentication. The only claim the relay relies on is a
//! non-empty `sub`, which becomes the client identity.

use crate::config::VerifierConfig;
use crate::error::{AuthError, RelayError};
use crate::server::AppState;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Query},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header, jwk::JwkSet};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Unknown `kid`s only trigger a key refetch if the cached set is older than this.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct IdentityClaims {
    #[serde(default)]
    sub: Option<String>,
}

fn subject(claims: IdentityClaims) -> Result<String, AuthError> {
    claims
        .sub
        .filter(|sub| !sub.is_empty())
        .ok_or(AuthError::MissingSubject)
}

/// Checks an identity token and returns the identity it vouches for.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// Build the verifier selected by configuration.
pub fn verifier_from_config(config: &VerifierConfig) -> Arc<dyn TokenVerifier> {
    match config {
        VerifierConfig::Secret(secret) => Arc::new(SecretVerifier::new(secret.as_bytes())),
        VerifierConfig::Jwks { url, issuers, ttl } => {
            Arc::new(JwksVerifier::new(url.clone(), issuers, *ttl))
        }
    }
}

/// HS256 tokens signed with a shared secret.
pub struct SecretVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SecretVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Any audience for now; several client apps share the relay.
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for SecretVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<IdentityClaims>(token, &self.key, &self.validation)?;
        subject(data.claims)
    }
}

struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

/// RS256 OIDC identity tokens checked against the provider's published JWKS.
pub struct JwksVerifier {
    url: String,
    http: reqwest::Client,
    validation: Validation,
    ttl: Duration,
    cache: RwLock<Option<CachedKeys>>,
}

impl JwksVerifier {
    pub fn new(url: String, issuers: &[String], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        if !issuers.is_empty() {
            validation.set_issuer(issuers);
        }
        Self {
            url,
            http: reqwest::Client::new(),
            validation,
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                let age = cached.fetched_at.elapsed();
                if age < self.ttl {
                    if let Some(jwk) = cached.keys.find(kid) {
                        return Ok(DecodingKey::from_jwk(jwk)?);
                    }
                    if age < MIN_REFRESH_INTERVAL {
                        return Err(AuthError::InvalidToken(format!("unknown key id {kid}")));
                    }
                }
            }
        }

        let keys = self.fetch_keys().await?;
        let key = keys
            .find(kid)
            .map(DecodingKey::from_jwk)
            .transpose()?
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown key id {kid}")));

        *self.cache.write().await = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
        key
    }

    async fn fetch_keys(&self) -> Result<JwkSet, AuthError> {
        debug!(url = %self.url, "Fetching signing keys");
        let keys = self
            .http
            .get(&self.url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;
        info!(url = %self.url, count = keys.keys.len(), "Refreshed signing keys");
        Ok(keys)
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let header = decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("token header missing kid".into()))?;
        let key = self.key_for(&kid).await?;
        let data = decode::<IdentityClaims>(token, &key, &self.validation)?;
        subject(data.claims)
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pull the bearer credential out of the request: query first, then header.
pub fn extract_token(parts: &Parts) -> Option<String> {
    let from_query = Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty());

    from_query.or_else(|| bearer_from_headers(&parts.headers))
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

fn token_snippet(token: &str) -> String {
    let head: String = token.chars().take(10).collect();
    format!("{head}...")
}

/// Identity of a connection that passed token verification.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub id: String,
}

impl FromRequestParts<AppState> for AuthenticatedClient {
    type Rejection = RelayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let Some(token) = extract_token(parts) else {
            warn!(%remote_addr, "Connection attempt without token");
            return Err(AuthError::MissingToken.into());
        };

        match state.verifier.verify(&token).await {
            Ok(id) => Ok(AuthenticatedClient { id }),
            Err(e) => {
                warn!(
                    %remote_addr,
                    error = %e,
                    token_snippet = %token_snippet(&token),
                    "Token validation failed"
                );
                Err(e.into())
            }
        }
    }
}

//! # JWKS Validator
//!
//! Verifies bearer tokens issued by the authentication service. The signing keys are
//! fetched from the configured JWKS url and cached for as long as the response's
//! `Cache-Control: max-age` allows. A token signed with a key id that is not in the
//! cache triggers a refresh so that key rotation is picked up without a restart, but
//! refreshes are never more frequent than `min_refresh_interval`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use tokio::sync::{Mutex, RwLock};

use super::{AuthError, Authenticator, Claims};
use crate::config::AuthConfig;

/// Cache lifetime used when the JWKS response carries no max-age directive.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

#[derive(Debug)]
struct Cache {
    jwks: JwkSet,
    fetched_at: Option<Instant>,
    expires_at: Option<Instant>,
}

impl Cache {
    fn empty() -> Self {
        Self {
            jwks: JwkSet { keys: Vec::new() },
            fetched_at: None,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires| now >= expires)
    }
}

pub struct Validator {
    client: reqwest::Client,
    keys_url: Option<String>,
    audience: String,
    issuer: String,
    min_refresh_interval: Duration,
    cache: RwLock<Cache>,
    refresh: Mutex<()>,
}

impl Validator {
    pub fn new(conf: &AuthConfig) -> Result<Self, AuthError> {
        if conf.keys_url.is_empty() {
            return Err(AuthError::NoKeysUrl);
        }

        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            keys_url: Some(conf.keys_url.clone()),
            audience: conf.audience.clone(),
            issuer: conf.issuer.clone(),
            min_refresh_interval: conf.min_refresh_interval,
            cache: RwLock::new(Cache::empty()),
            refresh: Mutex::new(()),
        })
    }

    /// A validator over a fixed key set that never contacts the network.
    pub fn with_keys(jwks: JwkSet, audience: &str, issuer: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            keys_url: None,
            audience: audience.to_string(),
            issuer: issuer.to_string(),
            min_refresh_interval: Duration::MAX,
            cache: RwLock::new(Cache {
                jwks,
                fetched_at: Some(Instant::now()),
                expires_at: None,
            }),
            refresh: Mutex::new(()),
        }
    }

    /// Verify the signature and registered claims of the token and return its
    /// Ensign claims.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token)?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(AuthError::UnexpectedAlgorithm);
        }
        let kid = header.kid.as_deref().ok_or(AuthError::MissingKeyId)?;

        let jwk = self.find_key(kid).await?;
        if let Some(alg) = jwk.common.key_algorithm {
            if signing_algorithm(alg) != Some(header.alg) {
                return Err(AuthError::UnexpectedAlgorithm);
            }
        }
        let key = DecodingKey::from_jwk(&jwk)?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation
            .required_spec_claims
            .extend(["iss".to_string(), "aud".to_string()]);
        validation.validate_nbf = true;

        let data = decode::<Claims>(token, &key, &validation)?;
        Ok(data.claims)
    }

    async fn find_key(&self, kid: &str) -> Result<Jwk, AuthError> {
        let now = Instant::now();
        {
            let cache = self.cache.read().await;
            let fixed = self.keys_url.is_none();
            if let Some(jwk) = cache.jwks.find(kid) {
                if fixed || !cache.is_expired(now) {
                    return Ok(jwk.clone());
                }
            } else if fixed {
                return Err(AuthError::UnknownKeyId(kid.to_string()));
            }
        }

        self.refresh(now).await?;
        let cache = self.cache.read().await;
        cache
            .jwks
            .find(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))
    }

    /// Fetch the key set unless another task refreshed it after `requested` or the
    /// last fetch is more recent than the minimum refresh interval.
    async fn refresh(&self, requested: Instant) -> Result<(), AuthError> {
        let Some(url) = self.keys_url.as_deref() else {
            return Ok(());
        };

        let _guard = self.refresh.lock().await;
        if let Some(fetched) = self.cache.read().await.fetched_at {
            if fetched >= requested {
                return Ok(());
            }
            if fetched.elapsed() < self.min_refresh_interval {
                tracing::debug!("jwks refresh rate limited");
                return Ok(());
            }
        }

        let response = self.client.get(url).send().await?.error_for_status()?;
        let max_age = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|val| val.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_CACHE_TTL);
        let jwks: JwkSet = response.json().await?;

        let now = Instant::now();
        tracing::debug!(keys = jwks.keys.len(), max_age = ?max_age, "refreshed jwks cache");
        let mut cache = self.cache.write().await;
        *cache = Cache {
            jwks,
            fetched_at: Some(now),
            expires_at: Some(now + max_age),
        };
        Ok(())
    }
}

#[async_trait]
impl Authenticator for Validator {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        self.verify(token).await
    }
}

/// Extract the `max-age` directive of a Cache-Control header value. `no-cache` and
/// `no-store` are treated as a zero max-age.
pub fn parse_max_age(header: &str) -> Option<Duration> {
    let mut max_age = None;
    for directive in header.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-cache" || lower == "no-store" {
            return Some(Duration::ZERO);
        }
        if let Some(secs) = lower.strip_prefix("max-age=") {
            max_age = secs.trim_matches('"').parse::<u64>().ok().map(Duration::from_secs);
        }
    }
    max_age
}

/// The JWS algorithm a key is published for; encryption algorithms have none.
fn signing_algorithm(alg: KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

use crate::error::{RelayError, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
pub const DEFAULT_REDIRECT_URL: &str = "https://lystic.dev";
pub const DEFAULT_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];
const DEFAULT_JWKS_TTL_SECS: u64 = 3600;
const MIN_PING_PERIOD: Duration = Duration::from_millis(1);

/// How identity tokens are checked.
#[derive(Debug, Clone)]
pub enum VerifierConfig {
    /// RS256 tokens checked against a provider's published key set.
    Jwks {
        url: String,
        issuers: Vec<String>,
        ttl: Duration,
    },
    /// HS256 tokens signed with a shared secret (local development).
    Secret(String),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Time allowed to write one frame to a peer.
    pub write_wait: Duration,
    /// Time allowed to read the next pong from a peer.
    pub pong_wait: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    pub redirect_url: String,
    pub verifier: VerifierConfig,
    /// Put the surviving side of a half-failed match back in the pool.
    pub requeue_survivor: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            max_message_size: 8192,
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            verifier: VerifierConfig::Jwks {
                url: DEFAULT_JWKS_URL.to_string(),
                issuers: DEFAULT_ISSUERS.iter().map(|s| s.to_string()).collect(),
                ttl: Duration::from_secs(DEFAULT_JWKS_TTL_SECS),
            },
            requeue_survivor: false,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr = parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?;
        let write_wait = Duration::from_secs(parse_or(
            &lookup,
            "WRITE_WAIT_SECS",
            defaults.write_wait.as_secs(),
        )?);
        let pong_wait = Duration::from_secs(parse_or(
            &lookup,
            "PONG_WAIT_SECS",
            defaults.pong_wait.as_secs(),
        )?);
        let max_message_size = parse_or(&lookup, "MAX_MESSAGE_SIZE", defaults.max_message_size)?;
        let requeue_survivor =
            parse_or(&lookup, "MATCH_REQUEUE_SURVIVOR", defaults.requeue_survivor)?;
        let redirect_url = lookup("REDIRECT_URL").unwrap_or(defaults.redirect_url);

        let verifier = match lookup("JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => VerifierConfig::Secret(secret),
            None => {
                let issuers = match lookup("JWT_ISSUERS") {
                    Some(raw) => raw
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect(),
                    None => DEFAULT_ISSUERS.iter().map(|s| s.to_string()).collect(),
                };
                VerifierConfig::Jwks {
                    url: lookup("JWKS_URL").unwrap_or_else(|| DEFAULT_JWKS_URL.to_string()),
                    issuers,
                    ttl: Duration::from_secs(parse_or(
                        &lookup,
                        "JWKS_TTL_SECS",
                        DEFAULT_JWKS_TTL_SECS,
                    )?),
                }
            }
        };

        let config = Self {
            bind_addr,
            write_wait,
            pong_wait,
            max_message_size,
            redirect_url,
            verifier,
            requeue_survivor,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which no connection could ever work.
    pub fn validate(&self) -> Result<()> {
        if self.write_wait.is_zero() {
            return Err(RelayError::Config("WRITE_WAIT_SECS must be positive".into()));
        }
        if self.pong_wait.is_zero() {
            return Err(RelayError::Config("PONG_WAIT_SECS must be positive".into()));
        }
        if self.max_message_size == 0 {
            return Err(RelayError::Config("MAX_MESSAGE_SIZE must be positive".into()));
        }
        Ok(())
    }

    /// Ping period. Less than `pong_wait`, and never zero.
    pub fn ping_period(&self) -> Duration {
        (self.pong_wait * 9 / 10).max(MIN_PING_PERIOD)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RelayError::Config(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

//! Gateway configuration from environment variables.

use crate::backoff::{Backoff, RetryPolicy};
use crate::basket::BasketTimeouts;
use crate::client::CLIENT_CHANNEL_BUFFER_SIZE;
use crate::connection::ConnectionConfig;
use crate::error::{GatewayError, Result};
use crate::types::Source;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lookback used by the legacy `subscribe` message.
pub const DEFAULT_LEGACY_LOOKBACK_DAYS: u32 = 14;

/// Profile bucket width in price points.
pub const DEFAULT_PROFILE_BUCKET_POINTS: u32 = 10;

/// Endpoints of one upstream feed bridge.
#[derive(Clone)]
pub struct FeedConfig {
    pub source: Source,
    pub ws_url: String,
    pub rest_url: String,
    pub auth_token: Option<String>,
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("source", &self.source)
            .field("ws_url", &self.ws_url)
            .field("rest_url", &self.rest_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub feeds: Vec<FeedConfig>,
    pub connection: ConnectionConfig,
    pub retry: RetryPolicy,
    pub baskets: BasketTimeouts,
    pub legacy_lookback_days: u32,
    pub client_channel_buffer: usize,
    pub profile_bucket_points: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8082,
            metrics_port: 9093,
            feeds: vec![FeedConfig {
                source: Source::PrimaryVenue,
                ws_url: "ws://localhost:9001/stream".to_string(),
                rest_url: "http://localhost:9001".to_string(),
                auth_token: None,
            }],
            connection: ConnectionConfig::default(),
            retry: RetryPolicy::default(),
            baskets: BasketTimeouts::default(),
            legacy_lookback_days: DEFAULT_LEGACY_LOOKBACK_DAYS,
            client_channel_buffer: CLIENT_CHANNEL_BUFFER_SIZE,
            profile_bucket_points: DEFAULT_PROFILE_BUCKET_POINTS,
        }
    }
}

impl GatewayConfig {
    /// Load from the process environment with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(&lookup);

        let mut feeds = Vec::new();
        let primary = &defaults.feeds[0];
        feeds.push(FeedConfig {
            source: Source::PrimaryVenue,
            ws_url: env.string("PRIMARY_WS_URL").unwrap_or_else(|| primary.ws_url.clone()),
            rest_url: env
                .string("PRIMARY_REST_URL")
                .unwrap_or_else(|| primary.rest_url.clone()),
            auth_token: env.string("PRIMARY_AUTH_TOKEN"),
        });

        match (env.string("SECONDARY_WS_URL"), env.string("SECONDARY_REST_URL")) {
            (Some(ws_url), Some(rest_url)) => feeds.push(FeedConfig {
                source: Source::SecondaryVenue,
                ws_url,
                rest_url,
                auth_token: env.string("SECONDARY_AUTH_TOKEN"),
            }),
            (None, None) => {}
            _ => {
                return Err(GatewayError::Config(
                    "SECONDARY_WS_URL and SECONDARY_REST_URL must be set together".to_string(),
                ))
            }
        }

        let reconnect = Backoff::new(
            env.millis("RECONNECT_BASE_MS", defaults.connection.reconnect.base)?,
            env.millis("RECONNECT_MAX_MS", defaults.connection.reconnect.max_delay)?,
        );
        let connection = ConnectionConfig {
            connect_timeout: env.millis("CONNECT_TIMEOUT_MS", defaults.connection.connect_timeout)?,
            reconnect,
            max_queued: env.parse("MAX_QUEUED_REQUESTS", defaults.connection.max_queued)?,
        };

        let retry = RetryPolicy {
            backoff: Backoff::new(
                env.millis("FETCH_RETRY_BASE_MS", defaults.retry.backoff.base)?,
                env.millis("FETCH_RETRY_MAX_MS", defaults.retry.backoff.max_delay)?,
            ),
            max_retries: env.parse("FETCH_MAX_RETRIES", defaults.retry.max_retries)?,
        };

        let baskets = BasketTimeouts {
            init: env.millis("BASKET_INIT_TIMEOUT_MS", defaults.baskets.init)?,
            collection: env.millis("BASKET_COLLECTION_TIMEOUT_MS", defaults.baskets.collection)?,
        };

        let config = Self {
            http_port: env.parse("HTTP_PORT", defaults.http_port)?,
            metrics_port: env.parse("METRICS_PORT", defaults.metrics_port)?,
            feeds,
            connection,
            retry,
            baskets,
            legacy_lookback_days: env.parse("LEGACY_LOOKBACK_DAYS", defaults.legacy_lookback_days)?,
            client_channel_buffer: env.parse("CLIENT_CHANNEL_BUFFER", defaults.client_channel_buffer)?,
            profile_bucket_points: env.parse("PROFILE_BUCKET_POINTS", defaults.profile_bucket_points)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.client_channel_buffer == 0 {
            return Err(GatewayError::Config("CLIENT_CHANNEL_BUFFER must be positive".into()));
        }
        if self.connection.max_queued == 0 {
            return Err(GatewayError::Config("MAX_QUEUED_REQUESTS must be positive".into()));
        }
        if self.profile_bucket_points == 0 {
            return Err(GatewayError::Config("PROFILE_BUCKET_POINTS must be positive".into()));
        }
        if !(1..=crate::protocol::MAX_LOOKBACK_DAYS).contains(&self.legacy_lookback_days) {
            return Err(GatewayError::Config(format!(
                "LEGACY_LOOKBACK_DAYS must be between 1 and {}",
                crate::protocol::MAX_LOOKBACK_DAYS
            )));
        }
        Ok(())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| GatewayError::Config(format!("{} must be a number: {}", key, e))),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        let ms = self.parse(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Plain values consumed by the connection provider, publisher and consumers.
//! The struct is owned by the embedding service; `from_env` is a convenience
//! loader over the `RABBITMQ_*` environment variables.

use crate::{errors::AmqpError, retry::RetryPolicy};
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Prefix of every environment variable read by [`RabbitMqConfig::from_env`].
pub const ENV_PREFIX: &str = "RABBITMQ";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    #[serde(rename = "pass")]
    pub password: String,
    /// Main topic exchange the publisher writes to and the consumer binds to.
    pub exchange: String,
    #[serde(rename = "dlq_exchange")]
    pub dead_letter_exchange: String,
    /// `x-message-ttl` of the main queue, in milliseconds.
    pub message_ttl: u32,
    /// Dial attempts for the connection provider and per-message retries for the consumer.
    pub retry_count: u32,
    #[serde(rename = "initial_retry_interval")]
    pub initial_retry_interval_ms: u64,
    #[serde(rename = "max_retry_interval")]
    pub max_retry_interval_ms: u64,
    pub retry_multiplier: f64,
    pub prefetch_count: u16,
    #[serde(rename = "publish_confirm_timeout")]
    pub publish_confirm_timeout_ms: u64,
    pub concurrent_consumers: usize,
    pub connection_name: String,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        RabbitMqConfig {
            host: "localhost".to_owned(),
            port: 5672,
            vhost: "/".to_owned(),
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            exchange: String::new(),
            dead_letter_exchange: String::new(),
            message_ttl: 30_000,
            retry_count: 3,
            initial_retry_interval_ms: 1_000,
            max_retry_interval_ms: 10_000,
            retry_multiplier: 2.0,
            prefetch_count: 10,
            publish_confirm_timeout_ms: 5_000,
            concurrent_consumers: 3,
            connection_name: "amqp-reliability".to_owned(),
        }
    }
}

impl RabbitMqConfig {
    /// Loads the configuration from `RABBITMQ_*` environment variables,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::load(Environment::with_prefix(ENV_PREFIX))
    }

    pub(crate) fn load(env: Environment) -> Result<Self, AmqpError> {
        let cfg = Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to read rabbitmq configuration");
                AmqpError::ConfigError(err.to_string())
            })?;

        cfg.try_deserialize::<RabbitMqConfig>().map_err(|err| {
            error!(error = err.to_string(), "failure to parse rabbitmq configuration");
            AmqpError::ConfigError(err.to_string())
        })
    }

    /// AMQP URI for the configured broker. The default vhost `/` is sent
    /// percent-encoded.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_retry_interval_ms),
            Duration::from_millis(self.max_retry_interval_ms),
            self.retry_multiplier,
        )
    }

    pub fn publish_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_confirm_timeout_ms)
    }
}

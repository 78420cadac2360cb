// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Configuration
//!
//! Connection settings consumed by the supervisor, sourced from the process
//! environment. Every value has a default so a bare `RABBITMQ_HOST` is enough
//! to reach a broker with the stock credentials.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::{env, time::Duration};

pub const RABBITMQ_HOST_ENV_KEY: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_KEY: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_KEY: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_KEY: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_KEY: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_RECONNECT_TIMEOUT_ENV_KEY: &str = "RABBITMQ_RECONNECT_TIMEOUT_MS";
pub const APP_NAME_ENV_KEY: &str = "APP_NAME";
pub const DEBUG_ENV_KEY: &str = "DEBUG";

/// Fixed delay between two reconnection attempts, in milliseconds.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 2000;

/// Settings needed to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Used as the connection name.
    pub app_name: String,
    /// Backoff interval in milliseconds.
    pub reconnect_interval: u64,
    /// Enables verbose lifecycle logging.
    pub debug: bool,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            app_name: "resilient-amqp".to_owned(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL_MS,
            debug: false,
        }
    }
}

impl RabbitMQConfigs {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// Missing keys keep their default, values that do not parse are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();

        if let Some(host) = lookup(RABBITMQ_HOST_ENV_KEY) {
            cfg.host = host;
        }
        if let Some(port) = lookup(RABBITMQ_PORT_ENV_KEY) {
            cfg.port = port
                .parse()
                .map_err(|_| AmqpError::ConfigError(RABBITMQ_PORT_ENV_KEY.to_owned()))?;
        }
        if let Some(user) = lookup(RABBITMQ_USER_ENV_KEY) {
            cfg.user = user;
        }
        if let Some(password) = lookup(RABBITMQ_PASSWORD_ENV_KEY) {
            cfg.password = password;
        }
        if let Some(vhost) = lookup(RABBITMQ_VHOST_ENV_KEY) {
            cfg.vhost = vhost;
        }
        if let Some(name) = lookup(APP_NAME_ENV_KEY) {
            cfg.app_name = name;
        }
        if let Some(interval) = lookup(RABBITMQ_RECONNECT_TIMEOUT_ENV_KEY) {
            cfg.reconnect_interval = interval.parse().map_err(|_| {
                AmqpError::ConfigError(RABBITMQ_RECONNECT_TIMEOUT_ENV_KEY.to_owned())
            })?;
        }
        if let Some(debug) = lookup(DEBUG_ENV_KEY) {
            cfg.debug = matches!(debug.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(cfg)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    /// Renders the AMQP URI, percent-encoding the vhost.
    pub fn uri(&self) -> String {
        let vhost = self.vhost.replace('%', "%25").replace('/', "%2f");

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

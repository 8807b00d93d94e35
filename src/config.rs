use std::{env, time::Duration};

use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    client::{ClientConfig, DEFAULT_CALL_TIMEOUT},
    logging::parse_level,
    server::{ServerConfig, DEFAULT_BIND_ADDR},
    transport::split_host_port,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub duration_secs: u64,
    pub poll_slice: Duration,
    pub shutdown_grace: Duration,
    pub call_timeout: Duration,
    pub engine_log: LevelFilter,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CQRPC_BIND_ADDR must be host:port")]
    InvalidBindAddr,
    #[error("{0} must be a non-negative integer")]
    InvalidNumber(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("CQRPC_ENGINE_LOG must be one of off, error, warn, info, debug, trace")]
    InvalidLogLevel,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("CQRPC_BIND_ADDR")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        split_host_port(&bind_addr).map_err(|_| ConfigError::InvalidBindAddr)?;

        let duration_secs = number("CQRPC_DURATION_SECS")?.unwrap_or(0);
        let poll_slice_ms = positive("CQRPC_POLL_SLICE_MS")?.unwrap_or(1000);
        let shutdown_grace_secs = number("CQRPC_SHUTDOWN_GRACE_SECS")?.unwrap_or(5);
        let call_timeout = match positive("CQRPC_CALL_TIMEOUT_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_CALL_TIMEOUT,
        };
        let engine_log = env::var("CQRPC_ENGINE_LOG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| parse_level(&value).ok_or(ConfigError::InvalidLogLevel))
            .transpose()?
            .unwrap_or(LevelFilter::INFO);

        Ok(Self {
            bind_addr,
            duration_secs,
            poll_slice: Duration::from_millis(poll_slice_ms),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            call_timeout,
            engine_log,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            poll_slice: self.poll_slice,
            shutdown_grace: self.shutdown_grace,
            log_level: self.engine_log,
            ..ServerConfig::new(self.bind_addr.clone()).with_duration_secs(self.duration_secs)
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            default_timeout: self.call_timeout,
            log_level: self.engine_log,
            ..ClientConfig::default()
        }
    }
}

fn number(name: &'static str) -> Result<Option<u64>, ConfigError> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber(name))
        })
        .transpose()
}

fn positive(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match number(name)? {
        Some(0) => Err(ConfigError::ZeroValue(name)),
        value => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, MutexGuard};

    use super::*;
    use crate::completion::DEFAULT_DRAIN_TIMEOUT;

    const VARS: [&str; 6] = [
        "CQRPC_BIND_ADDR",
        "CQRPC_DURATION_SECS",
        "CQRPC_POLL_SLICE_MS",
        "CQRPC_SHUTDOWN_GRACE_SECS",
        "CQRPC_CALL_TIMEOUT_SECS",
        "CQRPC_ENGINE_LOG",
    ];

    static ENV: Mutex<()> = Mutex::new(());

    fn clean_env() -> MutexGuard<'static, ()> {
        let guard = ENV.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for var in VARS {
            env::remove_var(var);
        }
        guard
    }

    #[test]
    fn parse_defaults() {
        let _env = clean_env();

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.bind_addr, "127.0.0.1:50051");
        assert_eq!(config.duration_secs, 0);
        assert_eq!(config.poll_slice, Duration::from_secs(1));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.call_timeout, Duration::from_secs(15));
        assert_eq!(config.engine_log, LevelFilter::INFO);

        let server = config.server_config();
        assert_eq!(server.duration, None);
        assert_eq!(server.bind_address, "127.0.0.1:50051");
        assert_eq!(server.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert_eq!(config.client_config().drain_timeout, DEFAULT_DRAIN_TIMEOUT);
    }

    #[test]
    fn overrides_flow_into_engine_configs() {
        let _env = clean_env();
        env::set_var("CQRPC_BIND_ADDR", "0.0.0.0:6000");
        env::set_var("CQRPC_DURATION_SECS", "30");
        env::set_var("CQRPC_POLL_SLICE_MS", "250");
        env::set_var("CQRPC_CALL_TIMEOUT_SECS", "2");
        env::set_var("CQRPC_ENGINE_LOG", "debug");

        let config = Config::from_env().expect("config should parse");
        let server = config.server_config();
        assert_eq!(server.bind_address, "0.0.0.0:6000");
        assert_eq!(server.duration, Some(Duration::from_secs(30)));
        assert_eq!(server.poll_slice, Duration::from_millis(250));
        assert_eq!(server.log_level, LevelFilter::DEBUG);

        let client = config.client_config();
        assert_eq!(client.default_timeout, Duration::from_secs(2));
        assert_eq!(client.log_level, LevelFilter::DEBUG);
    }

    #[test]
    fn invalid_bind_addr_fails() {
        let _env = clean_env();
        env::set_var("CQRPC_BIND_ADDR", "no-port-here");

        let err = Config::from_env().expect_err("expected invalid address error");
        assert!(matches!(err, ConfigError::InvalidBindAddr));
    }

    #[test]
    fn invalid_numbers_fail() {
        let _env = clean_env();
        env::set_var("CQRPC_DURATION_SECS", "soon");
        let err = Config::from_env().expect_err("expected invalid number");
        assert!(matches!(err, ConfigError::InvalidNumber("CQRPC_DURATION_SECS")));

        env::remove_var("CQRPC_DURATION_SECS");
        env::set_var("CQRPC_POLL_SLICE_MS", "0");
        let err = Config::from_env().expect_err("expected zero poll slice error");
        assert!(matches!(err, ConfigError::ZeroValue("CQRPC_POLL_SLICE_MS")));
    }

    #[test]
    fn invalid_log_level_fails() {
        let _env = clean_env();
        env::set_var("CQRPC_ENGINE_LOG", "chatty");

        let err = Config::from_env().expect_err("expected invalid level");
        assert!(matches!(err, ConfigError::InvalidLogLevel));
    }
}

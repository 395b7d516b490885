//! Server configuration module
//! Handles dynamic configuration parameters for the broadcast server

use crate::constants::{
    DEFAULT_BASE_PATH, DEFAULT_HOST, DEFAULT_LEASE_REFRESH_SECS, DEFAULT_LEASE_TTL_SECS,
    DEFAULT_PORT, DEFAULT_SWEEP_INTERVAL_SECS,
};
use crate::error::{Result, RoomcastError};
use std::env;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix stripped before namespace resolution
    pub base_path: String,
    /// Interval of the heartbeat sweep over all connections
    pub sweep_interval: Duration,
    /// TTL written on cluster membership records
    pub lease_ttl: Duration,
    /// Interval of the owner-lease refresh loop (must be < lease_ttl)
    pub lease_refresh_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            base_path: DEFAULT_BASE_PATH.to_string(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            lease_refresh_interval: Duration::from_secs(DEFAULT_LEASE_REFRESH_SECS),
        }
    }
}

impl ServerConfig {
    /// Short intervals suitable for tests
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            base_path: DEFAULT_BASE_PATH.to_string(),
            sweep_interval: Duration::from_millis(50),
            lease_ttl: Duration::from_millis(500),
            lease_refresh_interval: Duration::from_millis(100),
        }
    }

    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let host = env::var("ROOMCAST_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = env::var("ROOMCAST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let base_path = env::var("ROOMCAST_BASE_PATH").unwrap_or(DEFAULT_BASE_PATH.to_string());

        let sweep_secs = env::var("ROOMCAST_SWEEP_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

        let lease_ttl_secs = env::var("ROOMCAST_LEASE_TTL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LEASE_TTL_SECS);

        let lease_refresh_secs = env::var("ROOMCAST_LEASE_REFRESH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LEASE_REFRESH_SECS);

        let config = Self {
            host,
            port,
            base_path,
            sweep_interval: Duration::from_secs(sweep_secs),
            lease_ttl: Duration::from_secs(lease_ttl_secs),
            lease_refresh_interval: Duration::from_secs(lease_refresh_secs),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(RoomcastError::ConfigError(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        if self.lease_refresh_interval >= self.lease_ttl {
            return Err(RoomcastError::ConfigError(format!(
                "lease refresh interval ({:?}) must be shorter than the lease TTL ({:?}), \
                 otherwise a live process lets its own membership records expire",
                self.lease_refresh_interval, self.lease_ttl
            )));
        }
        if self.base_path.contains('/') {
            return Err(RoomcastError::ConfigError(
                "base path must be a single path segment".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.lease_refresh_interval < config.lease_ttl);
    }

    #[test]
    fn test_refresh_must_undercut_ttl() {
        let config = ServerConfig {
            lease_ttl: Duration::from_secs(10),
            lease_refresh_interval: Duration::from_secs(10),
            ..ServerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease refresh"));
    }

    #[test]
    fn test_base_path_single_segment() {
        let config = ServerConfig {
            base_path: "a/b".to_string(),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Cache configuration types and builder patterns

use std::time::Duration;

use crate::error::{ResilienceError, ResilienceResult};

/// Hard TTL cap applied whenever a stored value is detected as sensitive.
pub const SENSITIVE_TTL_CAP: Duration = Duration::from_secs(30 * 60);

/// Configuration for cache behavior
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget for all stored payloads
    pub max_bytes: usize,

    /// Payloads at or above this encoded size are gzip-compressed
    pub compression_threshold: usize,

    /// Interval for the background expiry sweep
    pub sweep_interval: Duration,

    /// 32-byte AES-256-GCM key for sensitive entries; a random key is
    /// generated when not supplied
    pub encryption_key: Option<Vec<u8>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 32 * 1024 * 1024,
            compression_threshold: 4096,
            sweep_interval: Duration::from_secs(300),
            encryption_key: None,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_bytes == 0 {
            return Err(ResilienceError::config("max_bytes must be greater than 0"));
        }

        if self.sweep_interval.is_zero() {
            return Err(ResilienceError::config("sweep_interval must be greater than zero"));
        }

        if let Some(key) = &self.encryption_key {
            if key.len() != 32 {
                return Err(ResilienceError::config("encryption_key must be exactly 32 bytes"));
            }
        }

        Ok(())
    }
}

/// Builder for CacheConfig with fluent API
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the byte budget
    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.config.max_bytes = bytes;
        self
    }

    /// Set the compression threshold in bytes
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.config.compression_threshold = bytes;
        self
    }

    /// Set the background sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Supply an explicit 32-byte encryption key
    pub fn encryption_key(mut self, key: Vec<u8>) -> Self {
        self.config.encryption_key = Some(key);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> ResilienceResult<CacheConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

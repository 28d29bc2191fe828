use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries. 0 falls back to 1024.
    pub size: usize,

    /// How long (seconds) an expired entry stays servable as a stale
    /// answer while a background refresh runs. 0 disables stale serving.
    pub lazy_cache_ttl: u64,

    /// Snapshot file. None disables persistence.
    pub dump_file: Option<PathBuf>,

    /// Seconds between snapshot attempts.
    pub dump_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            size: 1024,
            lazy_cache_ttl: 0,
            dump_file: None,
            dump_interval: 600,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size > 10_000_000 {
            return Err(ConfigError::InvalidCacheSize(
                "cache size too large (max 10 million entries)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fallback race configuration. The primary and secondary chains are
/// constructor arguments, not config fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Threshold in milliseconds before the secondary branch launches
    /// with the primary still pending. 0 falls back to 500.
    pub threshold_ms: u64,

    /// Launch the secondary immediately and hold its result until the
    /// primary is known to have failed.
    pub always_standby: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            threshold_ms: 500,
            always_standby: false,
        }
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold_ms > 60_000 {
            return Err(ConfigError::InvalidThreshold(
                "threshold too large (max 60s)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Forwarder configuration: upstream list plus global option defaults
/// inherited by entries that omit a field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub upstreams: Vec<UpstreamConfig>,

    /// Concurrency cap for in-flight dispatches. 0 falls back to 10.
    pub concurrent: usize,

    pub socks5: Option<String>,
    pub so_mark: Option<u32>,
    pub bind_to_device: Option<String>,
    pub bootstrap: Option<String>,
    pub bootstrap_version: Option<u8>,
}

pub(crate) const DEFAULT_FORWARD_CONCURRENT: usize = 10;
pub(crate) const MAX_FORWARD_CONCURRENT: usize = 64;

impl ForwardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::InvalidUpstream(
                "at least one upstream is required".to_string(),
            ));
        }
        for upstream in &self.upstreams {
            upstream.validate()?;
        }
        if self.concurrent > MAX_FORWARD_CONCURRENT {
            return Err(ConfigError::InvalidConcurrency(format!(
                "concurrent {} exceeds maximum {}",
                self.concurrent, MAX_FORWARD_CONCURRENT
            )));
        }
        Ok(())
    }

    /// Upstream entries with global defaults filled in.
    pub(crate) fn resolved_upstreams(&self) -> Vec<UpstreamConfig> {
        self.upstreams
            .iter()
            .map(|u| {
                let mut u = u.clone();
                u.socks5 = u.socks5.or_else(|| self.socks5.clone());
                u.so_mark = u.so_mark.or(self.so_mark);
                u.bind_to_device = u.bind_to_device.or_else(|| self.bind_to_device.clone());
                u.bootstrap = u.bootstrap.or_else(|| self.bootstrap.clone());
                u.bootstrap_version = u.bootstrap_version.or(self.bootstrap_version);
                u
            })
            .collect()
    }
}

/// One upstream resolver.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub tag: String,

    /// Required. `host:port`, optionally prefixed with `udp://`.
    pub addr: String,

    /// Address actually dialed when it differs from `addr`.
    pub dial_addr: Option<String>,

    /// Seconds a pooled connection may sit idle before being dropped.
    pub idle_timeout: Option<u64>,

    pub enable_pipeline: bool,
    pub enable_http3: bool,
    pub insecure_skip_verify: bool,

    pub socks5: Option<String>,
    pub so_mark: Option<u32>,
    pub bind_to_device: Option<String>,
    pub bootstrap: Option<String>,
    pub bootstrap_version: Option<u8>,
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::InvalidUpstream(
                "upstream addr is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Redirect rules: `pattern target` lines. A pattern is an exact name,
/// or a suffix when prefixed with `domain:`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub rules: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_are_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(FallbackConfig::default().validate().is_ok());
    }

    #[test]
    fn forward_requires_upstreams() {
        assert!(ForwardConfig::default().validate().is_err());

        let cfg = ForwardConfig {
            upstreams: vec![UpstreamConfig {
                addr: "127.0.0.1:53".to_string(),
                ..UpstreamConfig::default()
            }],
            ..ForwardConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn upstream_addr_is_required() {
        let cfg = ForwardConfig {
            upstreams: vec![UpstreamConfig::default()],
            ..ForwardConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn global_options_are_inherited() {
        let cfg = ForwardConfig {
            upstreams: vec![
                UpstreamConfig {
                    addr: "127.0.0.1:53".to_string(),
                    ..UpstreamConfig::default()
                },
                UpstreamConfig {
                    addr: "127.0.0.2:53".to_string(),
                    so_mark: Some(7),
                    ..UpstreamConfig::default()
                },
            ],
            so_mark: Some(42),
            bind_to_device: Some("eth0".to_string()),
            ..ForwardConfig::default()
        };
        let resolved = cfg.resolved_upstreams();
        assert_eq!(resolved[0].so_mark, Some(42));
        assert_eq!(resolved[0].bind_to_device.as_deref(), Some("eth0"));
        // Entry-level values win over globals.
        assert_eq!(resolved[1].so_mark, Some(7));
    }

    #[test]
    fn oversized_cache_rejected() {
        let cfg = CacheConfig {
            size: 20_000_000,
            ..CacheConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

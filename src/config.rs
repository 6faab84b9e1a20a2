use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for one scan. Timings are kept in milliseconds so the struct maps
/// directly onto the JSON config file and the CLI flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Ports per batch; a checkpoint is written after every batch.
    pub batch_size: usize,
    /// Connect timeout per probe. Short on purpose: slow hosts read as closed.
    pub timeout_ms: u64,
    /// Upper bound on hostname resolution per probe.
    pub resolve_timeout_ms: u64,
    /// Pause after each port has been swept across all targets.
    pub port_delay_ms: u64,
    /// Random extra pause in `0..=jitter_ms` added to `port_delay_ms`.
    pub jitter_ms: u64,
    /// Maximum probes in flight.
    pub concurrency: usize,
    /// Aggregate probe rate ceiling (probes per second). `None` disables the governor.
    pub rate_per_sec: Option<u32>,
    /// Retries for a probe that hit descriptor exhaustion before the scan is halted.
    pub resource_retries: u32,
    /// First backoff for resource retries; doubled on each attempt.
    pub resource_backoff_ms: u64,
    /// Batches to skip at the start, to continue an interrupted run.
    pub skip_batches: usize,
    /// Seed for port/target shuffling. `None` seeds from entropy.
    pub shuffle_seed: Option<u64>,
    /// Cancel the scan after this many seconds.
    pub max_duration_secs: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            timeout_ms: 10,
            resolve_timeout_ms: 2000,
            port_delay_ms: 500,
            jitter_ms: 10,
            concurrency: 64,
            rate_per_sec: None,
            resource_retries: 3,
            resource_backoff_ms: 50,
            skip_batches: 0,
            shuffle_seed: None,
            max_duration_secs: None,
        }
    }
}

impl ScanConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_err = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let content = fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let config: ScanConfig =
            serde_json::from_str(&content).map_err(|e| file_err(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch_size" });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "timeout_ms" });
        }
        if self.resolve_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "resolve_timeout_ms",
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Zero { field: "concurrency" });
        }
        if self.rate_per_sec == Some(0) {
            return Err(ConfigError::Zero { field: "rate_per_sec" });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn port_delay(&self) -> Duration {
        Duration::from_millis(self.port_delay_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn resource_backoff(&self) -> Duration {
        Duration::from_millis(self.resource_backoff_ms)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_pacing() {
        let c = ScanConfig::default();
        assert_eq!(c.timeout(), Duration::from_millis(10));
        assert_eq!(c.port_delay(), Duration::from_millis(500));
        assert_eq!(c.batch_size, 1000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn zero_fields_rejected() {
        let c = ScanConfig {
            concurrency: 0,
            ..ScanConfig::default()
        };
        assert_eq!(
            c.validate(),
            Err(ConfigError::Zero {
                field: "concurrency"
            })
        );

        let c = ScanConfig {
            rate_per_sec: Some(0),
            ..ScanConfig::default()
        };
        assert!(c.validate().is_err());

        let c = ScanConfig {
            resolve_timeout_ms: 0,
            ..ScanConfig::default()
        };
        assert_eq!(
            c.validate(),
            Err(ConfigError::Zero {
                field: "resolve_timeout_ms"
            })
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{ "batch_size": 50, "rate_per_sec": 200 }}"#).unwrap();
        let c = ScanConfig::from_path(f.path()).unwrap();
        assert_eq!(c.batch_size, 50);
        assert_eq!(c.rate_per_sec, Some(200));
        assert_eq!(c.timeout_ms, 10);
    }

    #[test]
    fn bad_json_is_file_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "not json").unwrap();
        let err = ScanConfig::from_path(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));
    }
}

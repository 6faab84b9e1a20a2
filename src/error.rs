use std::path::PathBuf;

use thiserror::Error;

/// Why a single probe could not produce an open/closed answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("cannot resolve {target}: {reason}")]
    Resolution { target: String, reason: String },

    /// Descriptor or buffer exhaustion on the local side. Retryable.
    #[error("socket resources exhausted: {0}")]
    Resource(String),

    #[error("socket error: {0}")]
    Socket(String),
}

impl ProbeError {
    pub fn is_resource(&self) -> bool {
        matches!(self, ProbeError::Resource(_))
    }
}

/// Failures reading or writing scan artifacts.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        StoreError::Csv {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid configuration file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Conditions that halt a scan. Everything else is absorbed per probe.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("checkpoint after batch {batch} failed: {source}")]
    Persistence {
        batch: usize,
        #[source]
        source: StoreError,
    },

    #[error("probing {target}:{port} still failing after {attempts} attempts: {source}")]
    ResourceExhausted {
        target: String,
        port: u16,
        attempts: u32,
        #[source]
        source: ProbeError,
    },
}

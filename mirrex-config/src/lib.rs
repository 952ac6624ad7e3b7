//! Shared configuration library for Mirrex.
//!
//! This crate centralizes config loading and validation for the replication
//! service so the daemon and any auxiliary tooling agree on defaults and
//! override order. Service-level options live here; the core crate keeps its
//! own tuning struct for scheduler/bus policy knobs.

use std::{env, fs, path::{Path, PathBuf}};

use anyhow::{Context, anyhow};
use mirrex_core::replication::ReplicationConfig;
use mirrex_core::replication::manager::ServiceLimits;
use mirrex_model::HashAlgorithm;
use serde::{Deserialize, Serialize};

fn default_worker_count() -> usize {
    2
}

fn default_worker_max() -> usize {
    8
}

fn default_database_path() -> PathBuf {
    PathBuf::from("mirrex.db")
}

fn default_copy_buffer_size() -> usize {
    1024 * 1024
}

fn default_ignore_patterns() -> Vec<String> {
    vec![".DS_Store".into(), "Thumbs.db".into(), "*.tmp".into()]
}

fn default_scan_recursive() -> bool {
    true
}

/// Source that produced the service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Top-level service settings. Use these to tune how many copy workers a new
/// bucket gets, where the queue database lives, and how copies are verified.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServiceConfig {
    /// Worker cap assigned to newly created buckets.
    #[serde(alias = "workerDefaultCount")]
    pub worker_default_count: usize,
    /// Upper bound any bucket's worker cap is clamped to.
    #[serde(alias = "workerMaxCount")]
    pub worker_max_count: usize,
    /// Location of the embedded queue database.
    #[serde(alias = "databasePath")]
    pub database_path: PathBuf,
    /// Content-hash algorithm for copy verification. The fast xxHash variants
    /// are the default; switch to sha256 when collision resistance matters
    /// more than throughput.
    #[serde(alias = "hashAlgorithm")]
    pub hash_algorithm: HashAlgorithm,
    /// Chunk size for streamed copies, in bytes.
    #[serde(alias = "copyBufferSize")]
    pub copy_buffer_size: usize,
    /// File name patterns the scanner skips. Opaque to the core; the scanner
    /// interprets them.
    #[serde(alias = "scanIgnorePatterns")]
    pub scan_ignore_patterns: Vec<String>,
    /// Whether the scanner descends into subdirectories.
    #[serde(alias = "scanRecursive")]
    pub scan_recursive: bool,
    /// Core replication tuning: scheduler cadence, claim sizing, cache TTLs,
    /// event batching, and shutdown policy.
    pub replication: ReplicationConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_default_count: default_worker_count(),
            worker_max_count: default_worker_max(),
            database_path: default_database_path(),
            hash_algorithm: HashAlgorithm::default(),
            copy_buffer_size: default_copy_buffer_size(),
            scan_ignore_patterns: default_ignore_patterns(),
            scan_recursive: default_scan_recursive(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load service configuration overrides using environment variables.
    /// Evaluation order:
    /// 1) `$MIRREX_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$MIRREX_CONFIG_JSON` (inline JSON),
    /// 3) `mirrex.toml` in the working directory,
    /// 4) defaults if none are set.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var("MIRREX_CONFIG_PATH")
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var("MIRREX_CONFIG_JSON")
            && !raw.trim().is_empty()
        {
            let parsed: Self = serde_json::from_str(&raw)
                .context("failed to parse MIRREX_CONFIG_JSON")?;
            parsed.validate()?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        let default_file = PathBuf::from("mirrex.toml");
        if default_file.is_file() {
            let config = Self::load_from_file(&default_file)?;
            return Ok((config, ConfigSource::File(default_file)));
        }

        let config = Self::default();
        config.validate()?;
        Ok((config, ConfigSource::Default))
    }

    /// Parse a TOML or JSON config file, keyed on extension.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let parsed: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON config {}", path.display()))?,
            _ => toml::from_str(&raw)
                .with_context(|| format!("invalid TOML config {}", path.display()))?,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Guard rails applied to every load path.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_default_count == 0 {
            return Err(anyhow!("worker_default_count must be at least 1"));
        }
        if self.worker_max_count < self.worker_default_count {
            return Err(anyhow!(
                "worker_max_count ({}) must be >= worker_default_count ({})",
                self.worker_max_count,
                self.worker_default_count
            ));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(anyhow!("database_path must not be empty"));
        }
        if self.copy_buffer_size == 0 {
            return Err(anyhow!("copy_buffer_size must be non-zero"));
        }
        Ok(())
    }

    /// Clamp a requested bucket worker cap to the configured service bounds.
    pub fn clamp_worker_count(&self, requested: usize) -> usize {
        requested.clamp(1, self.worker_max_count)
    }

    /// The limits/policy view the bucket manager consumes.
    pub fn limits(&self) -> ServiceLimits {
        ServiceLimits {
            worker_default_count: self.worker_default_count,
            worker_max_count: self.worker_max_count,
            hash_algorithm: self.hash_algorithm,
            copy_buffer_size: self.copy_buffer_size,
        }
    }
}

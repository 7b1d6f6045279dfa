//! Configuration module for bucketfs.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation and defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for bucketfs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub mount: MountConfig,
    pub store: StoreConfig,
    pub metadata_cache: MetadataCacheConfig,
    pub file_cache: FileCacheConfig,
    pub read: ReadConfig,
    pub write: WriteConfig,
    pub logging: LoggingConfig,
}

/// Mount-level behaviour of the projected filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Synthesize directories from object prefixes that have no explicit
    /// `name/` marker object.
    pub implicit_directories: bool,
    /// Project only the subtree rooted at this prefix (empty = whole bucket).
    pub only_dir: String,
    /// Permission bits applied to synthesized directory attributes.
    pub dir_mode: u16,
    /// Permission bits applied to synthesized file attributes.
    pub file_mode: u16,
    /// Owner uid reported for every inode. `None` means the mounting user.
    pub uid: Option<u32>,
    /// Owner gid reported for every inode. `None` means the mounting group.
    pub gid: Option<u32>,
    /// Maximum number of entries in a directory that may be renamed.
    /// Directory renames are not atomic; 0 disables them entirely.
    pub rename_dir_limit: usize,
    /// TTL hint (seconds) returned to the kernel for directory entry caching.
    pub kernel_list_cache_ttl: u64,
    /// Absorb kernel interrupt requests instead of cancelling operations.
    pub ignore_interrupts: bool,
}

/// Object-store connection, pacing and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the object-store API endpoint.
    pub endpoint: String,
    /// Bucket to project.
    pub bucket: String,
    /// Upper bound on store operations per second. `<= 0` means unlimited.
    pub op_rate_limit: f64,
    /// Upper bound on egress bytes per second. `<= 0` means unlimited.
    pub egress_bandwidth_limit: f64,
    /// Maximum single retry sleep in seconds.
    pub max_retry_sleep: u64,
    /// Maximum retry attempts per request. 0 means retry until the deadline.
    pub max_retry_attempts: u32,
    /// Per-request deadline in seconds, covering all retries.
    pub request_timeout: u64,
    /// Skip authentication entirely (public buckets, emulators).
    pub anonymous_access: bool,
    /// Path to a service credential file.
    pub key_file: Option<PathBuf>,
    /// Token endpoint to exchange the credential against.
    pub token_url: Option<String>,
}

/// Stat-cache and type-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCacheConfig {
    /// Maximum number of stat-cache entries.
    pub stat_cache_capacity: usize,
    /// Stat-cache freshness in seconds.
    pub stat_cache_ttl: u64,
    /// Type-cache freshness in seconds.
    pub type_cache_ttl: u64,
    /// Maximum child entries remembered per directory.
    pub type_cache_max_entries_per_dir: usize,
}

/// Disk-backed file-content cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCacheConfig {
    /// Disk budget in MiB. 0 disables the file cache.
    pub max_size_mb: u64,
    /// Directory holding cached content.
    pub dir: PathBuf,
    /// Admit entries for random-read handles too. When false only
    /// sequential readers populate the cache.
    pub cache_file_for_range_read: bool,
    /// Download chunks with a worker pool instead of one sequential worker.
    pub enable_parallel_downloads: bool,
    /// Workers per file in parallel mode.
    pub parallel_downloads_per_file: usize,
    /// Chunk size in MiB (the unit of presence tracking and download).
    pub download_chunk_size_mb: u64,
    /// Validate each downloaded chunk against the object CRC32C.
    pub enable_crc: bool,
}

/// Read-path tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Window size hint in MiB for the sequential reader.
    pub sequential_read_size_mb: u64,
}

/// Write-path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Directory holding per-file scratch stores for pending writes.
    pub scratch_dir: PathBuf,
    /// Stream appends to the store as they accumulate instead of uploading
    /// the whole scratch store on close.
    pub enable_streaming_writes: bool,
    /// Streaming-mode buffer size in MiB.
    pub write_buffer_size_mb: u64,
    /// Keep the scratch store around when a flush loses the generation race.
    pub retain_scratch_on_clobber: bool,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Path to the log file.
    pub file: PathBuf,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/bucketfs/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("bucketfs")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            implicit_directories: false,
            only_dir: String::new(),
            dir_mode: 0o755,
            file_mode: 0o644,
            uid: None,
            gid: None,
            rename_dir_limit: 0,
            kernel_list_cache_ttl: 0,
            ignore_interrupts: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://storage.googleapis.com".to_string(),
            bucket: String::new(),
            op_rate_limit: -1.0,
            egress_bandwidth_limit: -1.0,
            max_retry_sleep: 60,
            max_retry_attempts: 0,
            request_timeout: 60,
            anonymous_access: false,
            key_file: None,
            token_url: None,
        }
    }
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            stat_cache_capacity: 4096,
            stat_cache_ttl: 60,
            type_cache_ttl: 60,
            type_cache_max_entries_per_dir: 4096,
        }
    }
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("bucketfs");
        Self {
            max_size_mb: 0,
            dir: data_dir.join("file-cache"),
            cache_file_for_range_read: false,
            enable_parallel_downloads: false,
            parallel_downloads_per_file: 16,
            download_chunk_size_mb: 8,
            enable_crc: false,
        }
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            sequential_read_size_mb: 200,
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("bucketfs");
        Self {
            scratch_dir: data_dir.join("scratch"),
            enable_streaming_writes: false,
            write_buffer_size_mb: 16,
            retain_scratch_on_clobber: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("bucketfs");
        Self {
            level: "info".to_string(),
            file: data_dir.join("bucketfs.log"),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"file_cache.max_size_mb"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- store ---
        if self.store.bucket.is_empty() {
            errors.push(ValidationError {
                field: "store.bucket".into(),
                message: "must not be empty".into(),
            });
        }
        if self.store.endpoint.is_empty() {
            errors.push(ValidationError {
                field: "store.endpoint".into(),
                message: "must not be empty".into(),
            });
        }
        if self.store.request_timeout == 0 {
            errors.push(ValidationError {
                field: "store.request_timeout".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.store.max_retry_sleep == 0 {
            errors.push(ValidationError {
                field: "store.max_retry_sleep".into(),
                message: "must be greater than 0".into(),
            });
        }
        if !self.store.anonymous_access && self.store.key_file.is_none() {
            errors.push(ValidationError {
                field: "store.key_file".into(),
                message: "required unless anonymous_access is enabled".into(),
            });
        }

        // --- metadata_cache ---
        if self.metadata_cache.stat_cache_capacity == 0 {
            errors.push(ValidationError {
                field: "metadata_cache.stat_cache_capacity".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.metadata_cache.type_cache_max_entries_per_dir == 0 {
            errors.push(ValidationError {
                field: "metadata_cache.type_cache_max_entries_per_dir".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- file_cache ---
        if self.file_cache.max_size_mb > 0 {
            if self.file_cache.download_chunk_size_mb == 0 {
                errors.push(ValidationError {
                    field: "file_cache.download_chunk_size_mb".into(),
                    message: "must be greater than 0".into(),
                });
            }
            if self.file_cache.enable_parallel_downloads
                && self.file_cache.parallel_downloads_per_file == 0
            {
                errors.push(ValidationError {
                    field: "file_cache.parallel_downloads_per_file".into(),
                    message: "must be greater than 0 when parallel downloads are enabled".into(),
                });
            }
        }

        // --- read ---
        if self.read.sequential_read_size_mb == 0 {
            errors.push(ValidationError {
                field: "read.sequential_read_size_mb".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- write ---
        if self.write.enable_streaming_writes && self.write.write_buffer_size_mb == 0 {
            errors.push(ValidationError {
                field: "write.write_buffer_size_mb".into(),
                message: "must be greater than 0 when streaming writes are enabled".into(),
            });
        }

        // --- mount ---
        if !self.mount.only_dir.is_empty() && self.mount.only_dir.starts_with('/') {
            errors.push(ValidationError {
                field: "mount.only_dir".into(),
                message: "must be a bucket-relative prefix, not an absolute path".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}', expected one of {:?}",
                    self.logging.level, VALID_LOG_LEVELS
                ),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.store.bucket = "my-bucket".to_string();
        config.store.anonymous_access = true;
        config
    }

    #[test]
    fn test_default_config_validates_after_bucket_set() {
        let config = valid_config();
        let errors = config.validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_missing_bucket_is_rejected() {
        let mut config = valid_config();
        config.store.bucket.clear();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.field == "store.bucket"));
    }

    #[test]
    fn test_credentials_required_without_anonymous_access() {
        let mut config = valid_config();
        config.store.anonymous_access = false;
        config.store.key_file = None;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.field == "store.key_file"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = valid_config();
        config.logging.level = "verbose".to_string();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.field == "logging.level"));
    }

    #[test]
    fn test_absolute_only_dir_rejected() {
        let mut config = valid_config();
        config.mount.only_dir = "/photos".to_string();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.field == "mount.only_dir"));
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = valid_config();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.store.bucket, "my-bucket");
        assert_eq!(
            parsed.metadata_cache.stat_cache_capacity,
            config.metadata_cache.stat_cache_capacity
        );
    }

    #[test]
    fn test_load_missing_file_falls_back_to_default() {
        let config = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(config.metadata_cache.stat_cache_ttl, 60);
    }

    #[test]
    fn test_streaming_writes_require_buffer() {
        let mut config = valid_config();
        config.write.enable_streaming_writes = true;
        config.write.write_buffer_size_mb = 0;
        let errors = config.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "write.write_buffer_size_mb"));
    }
}

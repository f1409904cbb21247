//! Configuration management.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default number of compiled statements kept per session.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;

/// Default `SQLite` busy timeout.
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

/// Main configuration for a catalogue store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Maximum compiled statements per session (and on the connection).
    pub statement_cache_capacity: usize,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Heuristics applied when upgrading historical stores.
    pub legacy: LegacyPolicy,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Whether to install the Prometheus metrics recorder.
    pub metrics_enabled: bool,
}

/// Which spelling wins when legacy data holds case-variant duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanonicalCasing {
    /// Byte-wise greatest spelling (the historical behaviour).
    #[default]
    Max,
    /// Byte-wise least spelling.
    Min,
}

impl CanonicalCasing {
    /// Parses a policy name, falling back to [`CanonicalCasing::Max`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "min" | "least" => Self::Min,
            _ => Self::Max,
        }
    }

    /// SQL aggregate implementing the policy.
    #[must_use]
    pub const fn aggregate(self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Min => "min",
        }
    }
}

/// Legacy-data heuristics used by the migration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyPolicy {
    /// Spelling picked for series and authors that differ only by case.
    pub canonical_casing: CanonicalCasing,
    /// Whether the duplicate author/series clean-up step merges rows.
    pub merge_duplicate_entities: bool,
}

impl Default for LegacyPolicy {
    fn default() -> Self {
        Self {
            canonical_casing: CanonicalCasing::Max,
            merge_duplicate_entities: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name, falling back to pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default)]
pub struct LoggingSettings {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directive; `SHELFSTORE_LOG` overrides it.
    pub filter: Option<String>,
    /// Optional file to append logs to instead of stderr.
    pub file: Option<PathBuf>,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Database path.
    pub database_path: Option<String>,
    /// Statement cache capacity.
    pub statement_cache_capacity: Option<usize>,
    /// Busy timeout.
    pub busy_timeout_ms: Option<u32>,
    /// Metrics recorder toggle.
    pub metrics_enabled: Option<bool>,
    /// Legacy policy section.
    pub legacy: Option<ConfigFileLegacy>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
}

/// Legacy section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLegacy {
    /// `max` or `min`.
    pub canonical_casing: Option<String>,
    /// Merge case-variant duplicates during migration.
    pub merge_duplicate_entities: Option<bool>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLogging {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Filter directive.
    pub filter: Option<String>,
    /// Log file path.
    pub file: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            legacy: LegacyPolicy::default(),
            logging: LoggingSettings::default(),
            metrics_enabled: false,
        }
    }
}

fn default_database_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".shelfstore").join("catalogue.db"),
        |dirs| dirs.data_dir().join("shelfstore").join("catalogue.db"),
    )
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a value
    /// is out of range.
    pub fn load_from_file(path: &Path) -> crate::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| crate::Error::OperationFailed {
                operation: "read_config_file".to_string(),
                cause: e.to_string(),
            })?;

        let file: ConfigFile =
            toml::from_str(&contents).map_err(|e| crate::Error::OperationFailed {
                operation: "parse_config_file".to_string(),
                cause: e.to_string(),
            })?;

        let config = Self::from_config_file(file);
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir (`~/Library/Application Support/shelfstore/` on macOS)
    /// 2. XDG config dir (`~/.config/shelfstore/` for Unix compatibility)
    ///
    /// Returns default configuration if no config file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let platform_config = base_dirs
            .config_dir()
            .join("shelfstore")
            .join("config.toml");
        if platform_config.exists() {
            if let Ok(config) = Self::load_from_file(&platform_config) {
                return config;
            }
        }

        let xdg_config = base_dirs
            .home_dir()
            .join(".config")
            .join("shelfstore")
            .join("config.toml");
        if xdg_config.exists() {
            if let Ok(config) = Self::load_from_file(&xdg_config) {
                return config;
            }
        }

        Self::default()
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] for a zero statement cache capacity.
    pub fn validate(&self) -> crate::Result<()> {
        if self.statement_cache_capacity == 0 {
            return Err(crate::Error::InvalidInput(
                "statement_cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Converts a `ConfigFile` to `StoreConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(path) = file.database_path {
            config.database_path = PathBuf::from(path);
        }
        if let Some(capacity) = file.statement_cache_capacity {
            config.statement_cache_capacity = capacity;
        }
        if let Some(timeout) = file.busy_timeout_ms {
            config.busy_timeout_ms = timeout;
        }
        if let Some(enabled) = file.metrics_enabled {
            config.metrics_enabled = enabled;
        }
        if let Some(legacy) = file.legacy {
            if let Some(casing) = legacy.canonical_casing {
                config.legacy.canonical_casing = CanonicalCasing::parse(&casing);
            }
            if let Some(merge) = legacy.merge_duplicate_entities {
                config.legacy.merge_duplicate_entities = merge;
            }
        }
        if let Some(logging) = file.logging {
            if let Some(format) = logging.format {
                config.logging.format = LogFormat::parse(&format);
            }
            config.logging.filter = logging.filter;
            config.logging.file = logging.file.map(PathBuf::from);
        }

        config
    }

    /// Sets the database path.
    #[must_use]
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Sets the statement cache capacity.
    #[must_use]
    pub const fn with_statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    /// Sets the legacy policy.
    #[must_use]
    pub const fn with_legacy_policy(mut self, legacy: LegacyPolicy) -> Self {
        self.legacy = legacy;
        self
    }
}

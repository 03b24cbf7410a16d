//! Runtime configuration for the dispatch pipeline.
//!
//! Loads [`RuntimeConfig`] from a TOML file (`xe-runtime.toml`) with
//! environment variable overrides via `XE_*` prefixed variables. Every field
//! has a default, so a partial file only needs the settings it changes.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::math::{KB, MB, PAGE_SIZE};

/// When the command stream receiver hands work to the submission backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Submit on every flush.
    #[default]
    Immediate,
    /// Accumulate flushes and submit when a wait, explicit flush or
    /// command-buffer exhaustion requires it.
    Batched,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Batched => write!(f, "batched"),
        }
    }
}

impl std::str::FromStr for DispatchMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "batched" => Ok(Self::Batched),
            other => Err(format!("unknown dispatch mode: {other}")),
        }
    }
}

/// Heuristic used by `suggest_group_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestGroupSizeMode {
    /// Fill dimensions in order, largest divisor first.
    #[default]
    Nd,
    /// Prefer square tiles for two-dimensional ranges.
    Squared,
    /// Balance the first two dimensions.
    TwoD,
    /// Only the first dimension is tiled.
    OneD,
}

impl std::fmt::Display for SuggestGroupSizeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nd => write!(f, "nd"),
            Self::Squared => write!(f, "squared"),
            Self::TwoD => write!(f, "twod"),
            Self::OneD => write!(f, "oned"),
        }
    }
}

impl std::str::FromStr for SuggestGroupSizeMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nd" => Ok(Self::Nd),
            "squared" => Ok(Self::Squared),
            "twod" | "2d" => Ok(Self::TwoD),
            "oned" | "1d" => Ok(Self::OneD),
            other => Err(format!("unknown group size heuristic: {other}")),
        }
    }
}

/// Forced unified-memory placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SvmModeOverride {
    /// Pick from device capability flags.
    #[default]
    Auto,
    ZeroCopy,
    DualStorage,
    KmdMigrated,
}

impl std::fmt::Display for SvmModeOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::ZeroCopy => write!(f, "zerocopy"),
            Self::DualStorage => write!(f, "dualstorage"),
            Self::KmdMigrated => write!(f, "kmdmigrated"),
        }
    }
}

impl std::str::FromStr for SvmModeOverride {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "auto" => Ok(Self::Auto),
            "zerocopy" => Ok(Self::ZeroCopy),
            "dualstorage" => Ok(Self::DualStorage),
            "kmdmigrated" => Ok(Self::KmdMigrated),
            other => Err(format!("unknown SVM mode: {other}")),
        }
    }
}

/// Log output format for the simulation binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Command stream receiver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrConfig {
    /// Override: `XE_DISPATCH_MODE`
    pub dispatch_mode: DispatchMode,

    /// Minimum command buffer allocation in bytes.
    /// Override: `XE_COMMAND_BUFFER_SIZE`
    pub command_buffer_size: usize,

    /// Minimum indirect heap allocation in bytes.
    /// Override: `XE_INDIRECT_HEAP_SIZE`
    pub indirect_heap_size: usize,

    /// Upper bound for completion waits in microseconds (0 = unbounded).
    /// Override: `XE_WAIT_TIMEOUT_US`
    pub wait_timeout_us: u64,

    /// Slack added after command buffers and heaps for hardware prefetch.
    /// Override: `XE_CSR_OVERFETCH`
    pub overfetch_bytes: usize,

    /// Emit timestamp packets when the family supports them.
    /// Override: `XE_ENABLE_TIMESTAMP_PACKETS`
    pub enable_timestamp_packets: bool,

    /// Timestamp packet nodes per pooled page.
    pub timestamp_nodes_per_page: usize,

    /// Create a second engine for internal work.
    /// Override: `XE_INTERNAL_ENGINE`
    pub create_internal_engine: bool,
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Immediate,
            command_buffer_size: 64 * KB,
            indirect_heap_size: 64 * KB,
            wait_timeout_us: 0,
            overfetch_bytes: PAGE_SIZE,
            enable_timestamp_packets: true,
            timestamp_nodes_per_page: 64,
            create_internal_engine: false,
        }
    }
}

impl CsrConfig {
    /// Wait bound as a [`Duration`], `None` when unbounded.
    #[must_use]
    pub const fn wait_timeout(&self) -> Option<Duration> {
        if self.wait_timeout_us == 0 {
            None
        } else {
            Some(Duration::from_micros(self.wait_timeout_us))
        }
    }
}

/// Kernel and payload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Override: `XE_SUGGEST_GROUP_SIZE`
    pub suggest_group_size: SuggestGroupSizeMode,

    /// Override: `XE_PRINTF_BUFFER_SIZE`
    pub printf_buffer_size: usize,

    /// Cap on the private-memory surface allocated per kernel.
    /// Override: `XE_MAX_PRIVATE_MEMORY`
    pub max_private_memory: usize,

    /// Insert compression translation passes around dispatches that need them.
    /// Override: `XE_AUX_TRANSLATION`
    pub aux_translation: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            suggest_group_size: SuggestGroupSizeMode::Nd,
            printf_buffer_size: 4 * MB,
            max_private_memory: 256 * MB,
            aux_translation: true,
        }
    }
}

/// Memory manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Override: `XE_SVM_MODE`
    pub svm_mode: SvmModeOverride,

    /// GPU memory budget in bytes (0 = unlimited).
    /// Override: `XE_MEMORY_BUDGET`
    pub memory_budget: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            svm_mode: SvmModeOverride::Auto,
            memory_budget: 0,
        }
    }
}

/// Debugging aids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Directory receiving one JSON record per submitted dispatch.
    /// Override: `XE_DUMP_DISPATCH_DIR`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_dispatch_dir: Option<PathBuf>,

    /// Ask for confirmation before every submission.
    /// Override: `XE_BREAK_ON_SUBMISSION`
    pub break_on_submission: bool,

    /// Override: `XE_LOG_LEVEL`
    pub log_level: String,

    /// Override: `XE_LOG_FORMAT`
    pub log_format: LogFormat,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            dump_dispatch_dir: None,
            break_on_submission: false,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub csr: CsrConfig,
    pub kernel: KernelConfig,
    pub memory: MemoryConfig,
    pub debug: DebugConfig,
}

/// Errors that can occur when loading or validating a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render TOML: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

fn env_value<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::EnvOverride {
                key: key.into(),
                value: value.clone(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::EnvOverride {
                key: key.into(),
                value,
                reason: "expected a boolean (1/0, true/false, yes/no, on/off)".into(),
            }),
        },
        Err(_) => Ok(None),
    }
}

impl RuntimeConfig {
    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: RuntimeConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let csr = &self.csr;
        if csr.command_buffer_size < PAGE_SIZE || csr.command_buffer_size % PAGE_SIZE != 0 {
            return Err(ConfigError::Validation(format!(
                "csr.command_buffer_size must be a non-zero multiple of {PAGE_SIZE}, got {}",
                csr.command_buffer_size
            )));
        }
        if csr.indirect_heap_size < PAGE_SIZE || csr.indirect_heap_size % PAGE_SIZE != 0 {
            return Err(ConfigError::Validation(format!(
                "csr.indirect_heap_size must be a non-zero multiple of {PAGE_SIZE}, got {}",
                csr.indirect_heap_size
            )));
        }
        if csr.overfetch_bytes % 64 != 0 {
            return Err(ConfigError::Validation(format!(
                "csr.overfetch_bytes must be a multiple of 64, got {}",
                csr.overfetch_bytes
            )));
        }
        if csr.timestamp_nodes_per_page == 0 {
            return Err(ConfigError::Validation(
                "csr.timestamp_nodes_per_page must be > 0".into(),
            ));
        }
        if self.kernel.printf_buffer_size < 8 || self.kernel.printf_buffer_size % 4 != 0 {
            return Err(ConfigError::Validation(format!(
                "kernel.printf_buffer_size must be a multiple of 4 and >= 8, got {}",
                self.kernel.printf_buffer_size
            )));
        }
        if !LOG_LEVELS.contains(&self.debug.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "debug.log_level must be one of {LOG_LEVELS:?}, got {:?}",
                self.debug.log_level
            )));
        }
        Ok(())
    }

    /// Apply `XE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(mode) = env_value("XE_DISPATCH_MODE")? {
            self.csr.dispatch_mode = mode;
        }
        if let Some(size) = env_value("XE_COMMAND_BUFFER_SIZE")? {
            self.csr.command_buffer_size = size;
        }
        if let Some(size) = env_value("XE_INDIRECT_HEAP_SIZE")? {
            self.csr.indirect_heap_size = size;
        }
        if let Some(timeout) = env_value("XE_WAIT_TIMEOUT_US")? {
            self.csr.wait_timeout_us = timeout;
        }
        if let Some(bytes) = env_value("XE_CSR_OVERFETCH")? {
            self.csr.overfetch_bytes = bytes;
        }
        if let Some(enabled) = env_flag("XE_ENABLE_TIMESTAMP_PACKETS")? {
            self.csr.enable_timestamp_packets = enabled;
        }
        if let Some(enabled) = env_flag("XE_INTERNAL_ENGINE")? {
            self.csr.create_internal_engine = enabled;
        }
        if let Some(mode) = env_value("XE_SUGGEST_GROUP_SIZE")? {
            self.kernel.suggest_group_size = mode;
        }
        if let Some(size) = env_value("XE_PRINTF_BUFFER_SIZE")? {
            self.kernel.printf_buffer_size = size;
        }
        if let Some(size) = env_value("XE_MAX_PRIVATE_MEMORY")? {
            self.kernel.max_private_memory = size;
        }
        if let Some(enabled) = env_flag("XE_AUX_TRANSLATION")? {
            self.kernel.aux_translation = enabled;
        }
        if let Some(mode) = env_value("XE_SVM_MODE")? {
            self.memory.svm_mode = mode;
        }
        if let Some(budget) = env_value("XE_MEMORY_BUDGET")? {
            self.memory.memory_budget = budget;
        }
        if let Ok(dir) = std::env::var("XE_DUMP_DISPATCH_DIR") {
            self.debug.dump_dispatch_dir = if dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(enabled) = env_flag("XE_BREAK_ON_SUBMISSION")? {
            self.debug.break_on_submission = enabled;
        }
        if let Ok(level) = std::env::var("XE_LOG_LEVEL") {
            self.debug.log_level = level;
        }
        if let Some(format) = env_value("XE_LOG_FORMAT")? {
            self.debug.log_format = format;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_KEYS: [&str; 17] = [
        "XE_DISPATCH_MODE",
        "XE_COMMAND_BUFFER_SIZE",
        "XE_INDIRECT_HEAP_SIZE",
        "XE_WAIT_TIMEOUT_US",
        "XE_CSR_OVERFETCH",
        "XE_ENABLE_TIMESTAMP_PACKETS",
        "XE_INTERNAL_ENGINE",
        "XE_SUGGEST_GROUP_SIZE",
        "XE_PRINTF_BUFFER_SIZE",
        "XE_MAX_PRIVATE_MEMORY",
        "XE_AUX_TRANSLATION",
        "XE_SVM_MODE",
        "XE_MEMORY_BUDGET",
        "XE_DUMP_DISPATCH_DIR",
        "XE_BREAK_ON_SUBMISSION",
        "XE_LOG_LEVEL",
        "XE_LOG_FORMAT",
    ];

    fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
        let vars: Vec<(&str, Option<&str>)> = ALL_KEYS
            .iter()
            .map(|key| {
                let value = set.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
                (*key, value)
            })
            .collect();
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn default_toml_round_trips() {
        let rendered = RuntimeConfig::default_toml().unwrap();
        let cfg: RuntimeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    #[serial(xe_env)]
    fn partial_toml_keeps_defaults() {
        with_env(&[], || {
            let cfg = RuntimeConfig::from_toml(
                r#"
[csr]
dispatch_mode = "batched"
wait_timeout_us = 2500

[kernel]
suggest_group_size = "squared"
"#,
            )
            .unwrap();
            assert_eq!(cfg.csr.dispatch_mode, DispatchMode::Batched);
            assert_eq!(cfg.csr.wait_timeout(), Some(Duration::from_micros(2500)));
            assert_eq!(cfg.csr.command_buffer_size, 64 * KB);
            assert_eq!(cfg.kernel.suggest_group_size, SuggestGroupSizeMode::Squared);
            assert_eq!(cfg.kernel.printf_buffer_size, 4 * MB);
            assert_eq!(cfg.memory, MemoryConfig::default());
        });
    }

    #[test]
    fn unbounded_wait_by_default() {
        assert_eq!(CsrConfig::default().wait_timeout(), None);
    }

    #[test]
    fn validation_rejects_unaligned_command_buffer() {
        let mut cfg = RuntimeConfig::default();
        cfg.csr.command_buffer_size = 5000;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("command_buffer_size"));
    }

    #[test]
    fn validation_rejects_bad_printf_size() {
        let mut cfg = RuntimeConfig::default();
        cfg.kernel.printf_buffer_size = 6;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn validation_rejects_unknown_log_level() {
        let mut cfg = RuntimeConfig::default();
        cfg.debug.log_level = "chatty".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    #[serial(xe_env)]
    fn env_overrides_apply_after_file() {
        with_env(
            &[
                ("XE_DISPATCH_MODE", "batched"),
                ("XE_COMMAND_BUFFER_SIZE", "131072"),
                ("XE_ENABLE_TIMESTAMP_PACKETS", "0"),
                ("XE_SVM_MODE", "dual-storage"),
                ("XE_DUMP_DISPATCH_DIR", "/tmp/xe-dump"),
                ("XE_LOG_FORMAT", "json"),
            ],
            || {
                let cfg = RuntimeConfig::from_toml("[csr]\ndispatch_mode = \"immediate\"\n").unwrap();
                assert_eq!(cfg.csr.dispatch_mode, DispatchMode::Batched);
                assert_eq!(cfg.csr.command_buffer_size, 128 * KB);
                assert!(!cfg.csr.enable_timestamp_packets);
                assert_eq!(cfg.memory.svm_mode, SvmModeOverride::DualStorage);
                assert_eq!(
                    cfg.debug.dump_dispatch_dir.as_deref(),
                    Some(Path::new("/tmp/xe-dump"))
                );
                assert_eq!(cfg.debug.log_format, LogFormat::Json);
            },
        );
    }

    #[test]
    #[serial(xe_env)]
    fn invalid_env_override_names_the_key() {
        with_env(&[("XE_WAIT_TIMEOUT_US", "soon")], || {
            match RuntimeConfig::from_env().unwrap_err() {
                ConfigError::EnvOverride { key, value, .. } => {
                    assert_eq!(key, "XE_WAIT_TIMEOUT_US");
                    assert_eq!(value, "soon");
                }
                other => panic!("expected EnvOverride, got: {other}"),
            }
        });
    }

    #[test]
    #[serial(xe_env)]
    fn invalid_env_flag_is_rejected() {
        with_env(&[("XE_BREAK_ON_SUBMISSION", "maybe")], || {
            let err = RuntimeConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::EnvOverride { .. }));
        });
    }

    #[test]
    #[serial(xe_env)]
    fn env_override_can_fail_validation() {
        with_env(&[("XE_INDIRECT_HEAP_SIZE", "100")], || {
            let err = RuntimeConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
        });
    }

    #[test]
    #[serial(xe_env)]
    fn load_from_tempfile() {
        with_env(&[], || {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("xe-runtime.toml");
            std::fs::write(&path, RuntimeConfig::default_toml().unwrap()).unwrap();
            let cfg = RuntimeConfig::load(&path).unwrap();
            assert_eq!(cfg, RuntimeConfig::default());
        });
    }

    #[test]
    fn load_nonexistent_file() {
        let result = RuntimeConfig::load(Path::new("/nonexistent/xe-runtime.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let result = RuntimeConfig::from_toml("[csr\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn enum_display_parses_back() {
        for mode in [DispatchMode::Immediate, DispatchMode::Batched] {
            assert_eq!(mode.to_string().parse::<DispatchMode>().unwrap(), mode);
        }
        for mode in [
            SuggestGroupSizeMode::Nd,
            SuggestGroupSizeMode::Squared,
            SuggestGroupSizeMode::TwoD,
            SuggestGroupSizeMode::OneD,
        ] {
            assert_eq!(mode.to_string().parse::<SuggestGroupSizeMode>().unwrap(), mode);
        }
        for mode in [
            SvmModeOverride::Auto,
            SvmModeOverride::ZeroCopy,
            SvmModeOverride::DualStorage,
            SvmModeOverride::KmdMigrated,
        ] {
            assert_eq!(mode.to_string().parse::<SvmModeOverride>().unwrap(), mode);
        }
    }
}

//! Application configuration.

use crate::error::{AppError, AppResult};
use oi_client::{ProxyConfig, RetryPolicy};
use oi_core::Symbol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Backfill loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Pause between cycles (seconds). Default: 300.
    #[serde(default = "default_cycle_secs")]
    pub cycle_secs: u64,
    /// Furthest the exchange serves history back (days). Default: 30.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Margin kept from both horizon edges (seconds). Default: 3600.
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: u64,
    /// Points requested per page (1..=1000). Default: 1000.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

fn default_cycle_secs() -> u64 {
    300
}

fn default_lookback_days() -> u32 {
    30
}

fn default_buffer_secs() -> u64 {
    3600
}

fn default_page_limit() -> u32 {
    1000
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            cycle_secs: default_cycle_secs(),
            lookback_days: default_lookback_days(),
            buffer_secs: default_buffer_secs(),
            page_limit: default_page_limit(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Instruments to collect. Upper-cased on load.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Root of every persisted file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-attempt request timeout (seconds). Default: 5.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts per remote call, including the first. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Explicit worker-pool size for snapshot batches.
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Snapshot cadence (seconds). Default: 60.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Age after which data, error and log files are swept. Default: 30.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            data_dir: default_data_dir(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            max_workers: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
            retention_days: default_retention_days(),
            proxy: ProxyConfig::default(),
            backfill: BackfillConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a specific file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&content)?.with_env_overrides()?;
        info!(path = %path.display(), symbols = config.symbols.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.normalize_symbols();
        Ok(config)
    }

    /// `DATA_DIR` and `OI_MAX_WORKERS` override the file; proxy fields
    /// left unset fall back to the usual proxy variables.
    pub fn with_env_overrides(mut self) -> AppResult<Self> {
        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(raw) = std::env::var("OI_MAX_WORKERS") {
            let workers = raw
                .trim()
                .parse::<usize>()
                .map_err(|e| AppError::Config(format!("Invalid OI_MAX_WORKERS {raw:?}: {e}")))?;
            self.max_workers = Some(workers);
        }
        self.proxy = self.proxy.with_env_fallback();
        Ok(self)
    }

    /// Replace the configured symbols (e.g. from the command line).
    pub fn set_symbols(&mut self, symbols: Vec<String>) {
        self.symbols = symbols;
        self.normalize_symbols();
    }

    fn normalize_symbols(&mut self) {
        let mut seen = BTreeSet::new();
        self.symbols = self
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.symbols.is_empty() {
            return Err(AppError::Config("No symbols configured".to_string()));
        }
        self.parsed_symbols()?;
        if self.max_attempts == 0 {
            return Err(AppError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.snapshot_interval_secs == 0 {
            return Err(AppError::Config(
                "snapshot_interval_secs must be positive".to_string(),
            ));
        }
        if !(1..=1000).contains(&self.backfill.page_limit) {
            return Err(AppError::Config(format!(
                "backfill.page_limit must be within 1..=1000, got {}",
                self.backfill.page_limit
            )));
        }
        if self.max_workers == Some(0) {
            return Err(AppError::Config("max_workers must be positive".to_string()));
        }
        Ok(())
    }

    pub fn parsed_symbols(&self) -> AppResult<Vec<Symbol>> {
        self.symbols
            .iter()
            .map(|s| {
                Symbol::new(s).map_err(|e| AppError::Config(format!("Invalid symbol {s:?}: {e}")))
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.max_attempts)
    }
}

/// Remove `invalid` from the `symbols` array of the TOML file at `path`.
/// Returns the removed symbols.
///
/// Other keys keep their values, but the file is re-rendered: comments and
/// layout are not preserved. The file is left untouched when nothing is
/// removed.
pub fn prune_symbols_in_file(path: &Path, invalid: &BTreeSet<Symbol>) -> AppResult<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("Failed to read config {}: {e}", path.display())))?;
    let mut doc: toml::Table = toml::from_str(&content)
        .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;

    let Some(toml::Value::Array(symbols)) = doc.get_mut("symbols") else {
        return Err(AppError::Config("Config has no symbols array".to_string()));
    };

    let mut removed = Vec::new();
    symbols.retain(|v| {
        let keep = v
            .as_str()
            .and_then(|s| Symbol::new(s).ok())
            .map_or(true, |s| !invalid.contains(&s));
        if !keep {
            removed.push(v.as_str().unwrap_or_default().to_string());
        }
        keep
    });

    if !removed.is_empty() {
        let rendered = toml::to_string_pretty(&doc)
            .map_err(|e| AppError::Config(format!("Failed to render config: {e}")))?;
        oi_persistence::write_atomic(path, |w| {
            use std::io::Write;
            w.write_all(rendered.as_bytes())?;
            Ok(())
        })?;
        info!(path = %path.display(), removed = ?removed, "Pruned invalid symbols from config");
    }
    Ok(removed)
}

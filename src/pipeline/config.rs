//! Pipeline configuration from environment variables

use super::types::{EntityId, GRID_STEP};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Anchor entities used to find the newest 5-minute timestamp
pub const DEFAULT_LIQUID_ENTITIES: [EntityId; 15] = [
    2, 314, 453, 554, 555, 556, 557, 560, 561, 562, 565, 7936, 12934, 21820, 27616,
];

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(&'static str),
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(key) => write!(f, "Missing environment variable {}", key),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: {:?}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Where workers hand their batches to the importer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffBackend {
    /// Bounded in-memory channel; rejected batches spill to the staging dir
    Channel,
    /// Batch files in the staging dir, survive restarts
    File,
}

impl HandoffBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "channel" | "memory" => Some(HandoffBackend::Channel),
            "file" | "files" => Some(HandoffBackend::File),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffBackend::Channel => "channel",
            HandoffBackend::File => "file",
        }
    }
}

/// Catch-up window bounds configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    pub retention_days: i64,
    /// `t0` is floored to a multiple of this many seconds
    pub round_t0_secs: i64,
    /// `t1` is floored to a multiple of this many seconds
    pub round_t1_secs: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            retention_days: 456,
            round_t0_secs: 86_400,
            round_t1_secs: 3_600,
        }
    }
}

/// Configuration for one catch-up run
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Raw feed store (opened read-only)
    pub source_db_path: PathBuf,

    /// Analytics store (single writer)
    pub analytics_db_path: PathBuf,

    /// Directory for staged batch files
    pub staging_dir: PathBuf,

    pub tracked_entities: Vec<EntityId>,
    pub liquid_entities: Vec<EntityId>,
    pub window: WindowConfig,

    pub worker_count: usize,

    /// Importer keeps polling at least this long even when idle
    pub importer_min_runtime: Duration,

    /// Importer wait between empty passes
    pub importer_poll_interval: Duration,

    /// Rows buffered per entity before a batch is staged
    pub flush_threshold: usize,

    /// Minimum expired rows before the planner evicts an entity
    pub eviction_min_rows: u64,

    pub handoff_backend: HandoffBackend,
    pub channel_capacity: usize,

    pub status_interval: Duration,

    pub compact_after_run: bool,
    pub compaction_temp_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_db_path: PathBuf::from("data/timeseries.db"),
            analytics_db_path: PathBuf::from("data/analytics.db"),
            staging_dir: PathBuf::from("data/staging"),
            tracked_entities: Vec::new(),
            liquid_entities: DEFAULT_LIQUID_ENTITIES.to_vec(),
            window: WindowConfig::default(),
            worker_count: 3,
            importer_min_runtime: Duration::from_secs(15),
            importer_poll_interval: Duration::from_millis(3_000),
            flush_threshold: 2_016,
            eviction_min_rows: 1,
            handoff_backend: HandoffBackend::Channel,
            channel_capacity: 64,
            status_interval: Duration::from_millis(2_000),
            compact_after_run: false,
            compaction_temp_path: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ITEMFLOW_SOURCE_DB` (default: data/timeseries.db)
    /// - `ITEMFLOW_ANALYTICS_DB` (default: data/analytics.db)
    /// - `ITEMFLOW_STAGING_DIR` (default: data/staging)
    /// - `TRACKED_ENTITIES` (comma-separated, default: empty)
    /// - `LIQUID_ENTITIES` (comma-separated, default: 15 high-volume items)
    /// - `RETENTION_DAYS` (default: 456)
    /// - `WINDOW_ROUND_T0_SECS` (default: 86400)
    /// - `WINDOW_ROUND_T1_SECS` (default: 3600)
    /// - `WORKER_COUNT` (default: 3)
    /// - `IMPORTER_MIN_RUNTIME_SECS` (default: 15)
    /// - `IMPORTER_POLL_INTERVAL_MS` (default: 3000)
    /// - `FLUSH_THRESHOLD_ROWS` (default: 2016)
    /// - `EVICTION_MIN_ROWS` (default: 1)
    /// - `HANDOFF_BACKEND` (channel|file, default: channel)
    /// - `CHANNEL_CAPACITY` (default: 64)
    /// - `STATUS_INTERVAL_MS` (default: 2000)
    /// - `COMPACT_AFTER_RUN` (default: false)
    /// - `COMPACTION_TEMP_PATH` (default: next to the analytics store)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let handoff_backend = match env::var("HANDOFF_BACKEND") {
            Ok(value) => HandoffBackend::from_str(&value).ok_or(ConfigError::InvalidValue {
                key: "HANDOFF_BACKEND",
                value,
            })?,
            Err(_) => defaults.handoff_backend,
        };

        let config = Self {
            source_db_path: env::var("ITEMFLOW_SOURCE_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.source_db_path),

            analytics_db_path: env::var("ITEMFLOW_ANALYTICS_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.analytics_db_path),

            staging_dir: env::var("ITEMFLOW_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_dir),

            tracked_entities: entity_list("TRACKED_ENTITIES")?
                .unwrap_or(defaults.tracked_entities),

            liquid_entities: entity_list("LIQUID_ENTITIES")?
                .unwrap_or(defaults.liquid_entities),

            window: WindowConfig {
                retention_days: parse_var("RETENTION_DAYS")?
                    .unwrap_or(defaults.window.retention_days),

                round_t0_secs: parse_var("WINDOW_ROUND_T0_SECS")?
                    .unwrap_or(defaults.window.round_t0_secs),

                round_t1_secs: parse_var("WINDOW_ROUND_T1_SECS")?
                    .unwrap_or(defaults.window.round_t1_secs),
            },

            worker_count: parse_var("WORKER_COUNT")?.unwrap_or(defaults.worker_count),

            importer_min_runtime: parse_var("IMPORTER_MIN_RUNTIME_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.importer_min_runtime),

            importer_poll_interval: parse_var("IMPORTER_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.importer_poll_interval),

            flush_threshold: parse_var("FLUSH_THRESHOLD_ROWS")?.unwrap_or(defaults.flush_threshold),

            eviction_min_rows: parse_var("EVICTION_MIN_ROWS")?.unwrap_or(defaults.eviction_min_rows),

            handoff_backend,

            channel_capacity: parse_var("CHANNEL_CAPACITY")?.unwrap_or(defaults.channel_capacity),

            status_interval: parse_var("STATUS_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.status_interval),

            compact_after_run: parse_var("COMPACT_AFTER_RUN")?.unwrap_or(defaults.compact_after_run),

            compaction_temp_path: env::var("COMPACTION_TEMP_PATH").ok().map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, value: String| ConfigError::InvalidValue { key, value };

        if self.worker_count == 0 {
            return Err(invalid("WORKER_COUNT", self.worker_count.to_string()));
        }
        if self.flush_threshold == 0 {
            return Err(invalid("FLUSH_THRESHOLD_ROWS", self.flush_threshold.to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("CHANNEL_CAPACITY", self.channel_capacity.to_string()));
        }
        if self.window.retention_days < 1 {
            return Err(invalid("RETENTION_DAYS", self.window.retention_days.to_string()));
        }

        let t1 = self.window.round_t1_secs;
        if t1 <= 0 || t1 % GRID_STEP != 0 {
            return Err(invalid("WINDOW_ROUND_T1_SECS", t1.to_string()));
        }
        let t0 = self.window.round_t0_secs;
        if t0 < t1 || t0 % GRID_STEP != 0 {
            return Err(invalid("WINDOW_ROUND_T0_SECS", t0.to_string()));
        }

        Ok(())
    }
}

/// Parse a single env var; `Ok(None)` when unset, `InvalidValue` when it does not parse
fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Parse a comma-separated entity list; `Ok(None)` when the variable is unset
fn entity_list(key: &'static str) -> Result<Option<Vec<EntityId>>, ConfigError> {
    let raw = match env::var(key) {
        Ok(raw) => raw,
        Err(_) => return Ok(None),
    };

    parse_entity_list(&raw)
        .map(Some)
        .ok_or(ConfigError::InvalidValue { key, value: raw })
}

pub fn parse_entity_list(raw: &str) -> Option<Vec<EntityId>> {
    let mut entities = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = part.parse().ok()?;
        if !entities.contains(&id) {
            entities.push(id);
        }
    }
    Some(entities)
}

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::Duration;
use error_stack::{Report, ResultExt};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::cache::{CacheConfig, DEFAULT_MAX_ENTRIES_PER_EXCHANGE};
use crate::debounce::DEFAULT_DEBOUNCE_MS;
use crate::detector::{
    DEFAULT_MAX_STALE_MS, DEFAULT_MIN_HOLD_MS, DEFAULT_QUEUE_CAP, DEFAULT_SHARD_COUNT,
    DetectorConfig,
};
use crate::error::ConfigError;
use crate::health::DEFAULT_REPORT_INTERVAL_MS;
use crate::model::ExchangeId;
use crate::notify::Verbosity;
use crate::source::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_RECOVERY_DELAY_MS, SourceConfig};
use crate::symbol::Symbol;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_minimum_spread() -> String {
    "0.0005".into()
}

fn default_warning_spread() -> String {
    "0.0010".into()
}

fn default_critical_spread() -> String {
    "0.0030".into()
}

fn default_debounce_ms() -> i64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_min_hold_ms() -> i64 {
    DEFAULT_MIN_HOLD_MS
}

fn default_max_stale_ms() -> i64 {
    DEFAULT_MAX_STALE_MS
}

fn default_shards() -> usize {
    DEFAULT_SHARD_COUNT
}

fn default_queue_cap() -> usize {
    DEFAULT_QUEUE_CAP
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_recovery_delay_ms() -> u64 {
    DEFAULT_RECOVERY_DELAY_MS
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES_PER_EXCHANGE
}

fn default_report_interval_ms() -> u64 {
    DEFAULT_REPORT_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub exchanges: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub detector: DetectorSection,
    #[serde(default)]
    pub rest: RestSection,
    #[serde(default)]
    pub ws: WsSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub notification: NotificationSection,
    #[serde(default)]
    pub health: HealthSection,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct DetectorSection {
    /// Spread thresholds as decimal strings to keep them off the float path.
    #[serde(default = "default_minimum_spread")]
    pub minimum_spread: String,
    #[serde(default = "default_warning_spread")]
    pub warning_spread: String,
    #[serde(default = "default_critical_spread")]
    pub critical_spread: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,
    #[serde(default = "default_min_hold_ms")]
    pub min_hold_ms: i64,
    #[serde(default = "default_max_stale_ms")]
    pub max_stale_ms: i64,
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_queue_cap")]
    pub queue_cap: usize,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            minimum_spread: default_minimum_spread(),
            warning_spread: default_warning_spread(),
            critical_spread: default_critical_spread(),
            debounce_ms: default_debounce_ms(),
            min_hold_ms: default_min_hold_ms(),
            max_stale_ms: default_max_stale_ms(),
            shards: default_shards(),
            queue_cap: default_queue_cap(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RestSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RestSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsSection {
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
    /// Exchanges forced onto REST polling regardless of WebSocket health.
    #[serde(default)]
    pub disable: Vec<String>,
}

impl Default for WsSection {
    fn default() -> Self {
        Self {
            recovery_delay_ms: default_recovery_delay_ms(),
            disable: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct CacheSection {
    #[serde(default = "default_max_entries")]
    pub max_entries_per_exchange: usize,
    /// Per-exchange staleness overrides in milliseconds, keyed by name.
    #[serde(default)]
    pub stale_ms: HashMap<String, u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct NotificationSection {
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelConfig {
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: Option<String>,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;
    Ok(config)
}

const VALID_CHANNEL_KINDS: &[&str] = &["terminal", "log", "webhook", "telegram"];

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_exchanges(config)?;
    validate_symbols(config)?;
    validate_thresholds(config)?;
    validate_durations(config)?;
    validate_cache_overrides(config)?;
    validate_ws_disable(config)?;
    validate_channels(config)?;
    Ok(())
}

fn validate_exchanges(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.exchanges.is_empty() {
        return Err(Report::new(ConfigError::Validation {
            field: "exchanges: at least one exchange is required".into(),
        }));
    }

    let mut seen = HashSet::new();
    for name in &config.exchanges {
        if ExchangeId::parse(name).is_none() {
            return Err(Report::new(ConfigError::Validation {
                field: format!("exchanges: unknown exchange \"{name}\""),
            }));
        }
        if !seen.insert(name.as_str()) {
            return Err(Report::new(ConfigError::Validation {
                field: format!("exchanges: duplicate entry \"{name}\""),
            }));
        }
    }
    Ok(())
}

fn validate_symbols(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.symbols.is_empty() {
        return Err(Report::new(ConfigError::Validation {
            field: "symbols: at least one symbol is required".into(),
        }));
    }

    for raw in &config.symbols {
        if Symbol::parse(raw).is_err() {
            return Err(Report::new(ConfigError::Validation {
                field: format!("symbols: \"{raw}\" is not a canonical BASEUSDT symbol"),
            }));
        }
    }
    Ok(())
}

fn parse_spread(field: &str, raw: &str) -> Result<Decimal, Report<ConfigError>> {
    raw.parse::<Decimal>()
        .change_context(ConfigError::Validation {
            field: format!("detector.{field}: \"{raw}\" is not a decimal"),
        })
}

fn validate_thresholds(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let minimum = parse_spread("minimum_spread", &config.detector.minimum_spread)?;
    let warning = parse_spread("warning_spread", &config.detector.warning_spread)?;
    let critical = parse_spread("critical_spread", &config.detector.critical_spread)?;

    if minimum <= Decimal::ZERO {
        return Err(Report::new(ConfigError::Validation {
            field: "detector.minimum_spread must be > 0".into(),
        }));
    }
    if !(minimum <= warning && warning <= critical) {
        return Err(Report::new(ConfigError::Validation {
            field: "detector spreads must satisfy minimum <= warning <= critical".into(),
        }));
    }
    Ok(())
}

fn validate_durations(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let positive: [(&str, i64); 3] = [
        ("detector.debounce_ms", config.detector.debounce_ms),
        ("detector.min_hold_ms", config.detector.min_hold_ms),
        ("detector.max_stale_ms", config.detector.max_stale_ms),
    ];
    for (field, value) in positive {
        if value <= 0 {
            return Err(Report::new(ConfigError::Validation {
                field: format!("{field} must be > 0"),
            }));
        }
    }

    if config.rest.poll_interval_ms == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "rest.poll_interval_ms must be > 0".into(),
        }));
    }
    if config.detector.shards == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "detector.shards must be > 0".into(),
        }));
    }
    Ok(())
}

fn validate_cache_overrides(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for (name, value) in &config.cache.stale_ms {
        if ExchangeId::parse(name).is_none() {
            return Err(Report::new(ConfigError::Validation {
                field: format!("cache.stale_ms: unknown exchange \"{name}\""),
            }));
        }
        if *value == 0 {
            return Err(Report::new(ConfigError::Validation {
                field: format!("cache.stale_ms.{name} must be > 0"),
            }));
        }
    }
    Ok(())
}

fn validate_ws_disable(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for name in &config.ws.disable {
        if ExchangeId::parse(name).is_none() {
            return Err(Report::new(ConfigError::Validation {
                field: format!("ws.disable: unknown exchange \"{name}\""),
            }));
        }
    }
    Ok(())
}

fn validate_channels(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for channel in &config.notification.channels {
        if !VALID_CHANNEL_KINDS.contains(&channel.kind.as_str()) {
            return Err(Report::new(ConfigError::Validation {
                field: format!("notification.channels: unknown kind \"{}\"", channel.kind),
            }));
        }

        match channel.kind.as_str() {
            "webhook" if channel.url.as_deref().unwrap_or("").is_empty() => {
                return Err(Report::new(ConfigError::Validation {
                    field: "notification.channels[webhook].url is required".into(),
                }));
            }
            "telegram"
                if channel.bot_token.as_deref().unwrap_or("").is_empty()
                    || channel.chat_id.as_deref().unwrap_or("").is_empty() =>
            {
                return Err(Report::new(ConfigError::Validation {
                    field: "notification.channels[telegram] requires bot_token and chat_id"
                        .into(),
                }));
            }
            _ => {}
        }
    }
    Ok(())
}

impl AppConfig {
    /// Enabled exchanges in config order. Call after validation.
    pub fn exchange_ids(&self) -> Vec<ExchangeId> {
        self.exchanges
            .iter()
            .filter_map(|name| ExchangeId::parse(name))
            .collect()
    }

    pub fn watch_symbols(&self) -> Vec<Symbol> {
        self.symbols
            .iter()
            .filter_map(|raw| Symbol::parse(raw).ok())
            .collect()
    }

    /// Exchanges the operator explicitly forced off WebSocket.
    pub fn ws_disabled_ids(&self) -> Vec<ExchangeId> {
        self.ws
            .disable
            .iter()
            .filter_map(|name| ExchangeId::parse(name))
            .collect()
    }

    fn stale_ms_for(&self, exchange: ExchangeId) -> u64 {
        self.cache
            .stale_ms
            .get(exchange.as_str())
            .copied()
            .unwrap_or_else(|| exchange.default_stale_ms())
    }

    pub fn detector_config(&self) -> DetectorConfig {
        let defaults = DetectorConfig::default();
        DetectorConfig {
            minimum_spread: self
                .detector
                .minimum_spread
                .parse()
                .unwrap_or(defaults.minimum_spread),
            warning_spread: self
                .detector
                .warning_spread
                .parse()
                .unwrap_or(defaults.warning_spread),
            critical_spread: self
                .detector
                .critical_spread
                .parse()
                .unwrap_or(defaults.critical_spread),
            min_hold: Duration::milliseconds(self.detector.min_hold_ms),
            max_stale: Duration::milliseconds(self.detector.max_stale_ms),
            shard_count: self.detector.shards,
            queue_cap: self.detector.queue_cap,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries_per_exchange: self.cache.max_entries_per_exchange,
            stale_ms: ExchangeId::ALL
                .into_iter()
                .map(|e| (e, self.stale_ms_for(e)))
                .collect(),
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            poll_interval: StdDuration::from_millis(self.rest.poll_interval_ms),
            recovery_delay: Duration::milliseconds(self.ws.recovery_delay_ms as i64),
            ws_stale: ExchangeId::ALL
                .into_iter()
                .map(|e| (e, Duration::milliseconds(self.stale_ms_for(e) as i64)))
                .collect(),
        }
    }

    pub fn report_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.health.report_interval_ms)
    }
}

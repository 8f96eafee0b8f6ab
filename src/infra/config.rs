//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/tracker.toml

use crate::domain::journey::DEFAULT_MOVEMENT_THRESHOLD_M;
use crate::domain::types::CardId;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardReaderKind {
    /// Line-oriented reader on a serial port (one id per line)
    Serial,
    /// Ids typed or piped on standard input
    Stdin,
}

impl CardReaderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardReaderKind::Serial => "serial",
            CardReaderKind::Stdin => "stdin",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpsConfig {
    /// Serial device path; when absent the port is found by `usb_vid`
    #[serde(default)]
    pub device: Option<String>,
    /// USB vendor id (hex) of the receiver, e.g. "1546" for u-blox
    #[serde(default = "default_gps_usb_vid")]
    pub usb_vid: String,
    #[serde(default = "default_gps_baud")]
    pub baud: u32,
    #[serde(default = "default_gps_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            device: None,
            usb_vid: default_gps_usb_vid(),
            baud: default_gps_baud(),
            retry_interval_ms: default_gps_retry_interval_ms(),
        }
    }
}

fn default_gps_usb_vid() -> String {
    "1546".to_string()
}

fn default_gps_baud() -> u32 {
    9600
}

fn default_gps_retry_interval_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardConfig {
    #[serde(default = "default_card_reader")]
    pub reader: CardReaderKind,
    #[serde(default = "default_card_device")]
    pub device: String,
    #[serde(default = "default_card_baud")]
    pub baud: u32,
    /// Card ids allowed to start and stop a journey
    #[serde(default)]
    pub allow_list: Vec<String>,
    /// Minimum delay between two accepted reads
    #[serde(default = "default_card_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            reader: default_card_reader(),
            device: default_card_device(),
            baud: default_card_baud(),
            allow_list: Vec::new(),
            debounce_ms: default_card_debounce_ms(),
        }
    }
}

fn default_card_reader() -> CardReaderKind {
    CardReaderKind::Serial
}

fn default_card_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_card_baud() -> u32 {
    9600
}

fn default_card_debounce_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory holding `routes.log` and `routes/`
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { log_dir: default_log_dir() }
    }
}

fn default_log_dir() -> String {
    "logs/gps_logs".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct JourneyConfig {
    /// Segments at or below this length (meters) are treated as jitter
    #[serde(default = "default_movement_threshold_m")]
    pub movement_threshold_m: f64,
    #[serde(default = "default_position_queue_capacity")]
    pub position_queue_capacity: usize,
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            movement_threshold_m: default_movement_threshold_m(),
            position_queue_capacity: default_position_queue_capacity(),
        }
    }
}

fn default_movement_threshold_m() -> f64 {
    DEFAULT_MOVEMENT_THRESHOLD_M
}

fn default_position_queue_capacity() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub card: CardConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub journey: JourneyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    gps_device: Option<String>,
    gps_usb_vid: String,
    gps_baud: u32,
    gps_retry_interval_ms: u64,
    card_reader: CardReaderKind,
    card_device: String,
    card_baud: u32,
    allow_list: Vec<CardId>,
    debounce_ms: u64,
    log_dir: PathBuf,
    movement_threshold_m: f64,
    position_queue_capacity: usize,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        let mut allow_list = Vec::with_capacity(toml_config.card.allow_list.len());
        for raw in &toml_config.card.allow_list {
            match CardId::parse(raw) {
                Some(id) => allow_list.push(id),
                None => tracing::warn!(card_id = %raw, "allow_list_entry_ignored"),
            }
        }

        Self {
            gps_device: toml_config.gps.device.filter(|d| !d.is_empty()),
            gps_usb_vid: toml_config.gps.usb_vid,
            gps_baud: toml_config.gps.baud,
            gps_retry_interval_ms: toml_config.gps.retry_interval_ms,
            card_reader: toml_config.card.reader,
            card_device: toml_config.card.device,
            card_baud: toml_config.card.baud,
            allow_list,
            debounce_ms: toml_config.card.debounce_ms,
            log_dir: PathBuf::from(toml_config.storage.log_dir),
            movement_threshold_m: toml_config.journey.movement_threshold_m,
            // A zero-capacity queue could never hand a fix over
            position_queue_capacity: toml_config.journey.position_queue_capacity.max(1),
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            config_file: config_file.to_string(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn gps_device(&self) -> Option<&str> {
        self.gps_device.as_deref()
    }

    pub fn gps_usb_vid(&self) -> &str {
        &self.gps_usb_vid
    }

    pub fn gps_baud(&self) -> u32 {
        self.gps_baud
    }

    pub fn gps_retry_interval_ms(&self) -> u64 {
        self.gps_retry_interval_ms
    }

    pub fn card_reader(&self) -> CardReaderKind {
        self.card_reader
    }

    pub fn card_device(&self) -> &str {
        &self.card_device
    }

    pub fn card_baud(&self) -> u32 {
        self.card_baud
    }

    pub fn allow_list(&self) -> &[CardId] {
        &self.allow_list
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce_ms
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.log_dir.join("routes.log")
    }

    pub fn routes_dir(&self) -> PathBuf {
        self.log_dir.join("routes")
    }

    pub fn movement_threshold_m(&self) -> f64 {
        self.movement_threshold_m
    }

    pub fn position_queue_capacity(&self) -> usize {
        self.position_queue_capacity
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to point storage at a scratch directory
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Builder method for tests to set the allow-list
    pub fn with_allow_list(mut self, ids: &[&str]) -> Self {
        self.allow_list = ids.iter().filter_map(|raw| CardId::parse(raw)).collect();
        self
    }

    /// Builder method for tests to set the debounce interval
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }
}

use std::path::PathBuf;

use serde::Deserialize;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `config.json`.
//
// It defines:
// - How sessions reach the messaging platform (transport)
// - Where links and accounts are stored
// - Which links are collected and how they are classified
// - Collector tuning (scratch space, limits, timeouts)
// - Credentials to register at start-up
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub transport: TransportConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    /// Session strings registered (validated + stored) on start-up.
    ///
    /// NOTE:
    /// These are security-sensitive. The config file must not be
    /// committed to version control.
    #[serde(default)]
    pub sessions: Vec<String>,

    /// Optional debug configuration
    pub debug: Option<DebugConfig>,
}

// ------------------------------------------------------------
// Transport configuration
// ------------------------------------------------------------
//
// The messaging protocol itself is provided by a gateway that
// speaks JSON over WebSocket (see `transport::gateway`).
//
#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Transport identifier, resolved by `transport::get_transport`
    #[serde(default = "default_transport_kind")]
    pub kind: String,

    /// WebSocket URL of the gateway (wss://…)
    pub url: String,

    /// HTTP base URL used to download attachments
    pub files_url: String,

    /// Platform API credentials forwarded on login
    pub api_id: i64,
    pub api_hash: String,

    /// Upper bound for a single connect + login handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

// ------------------------------------------------------------
// Storage configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database: PathBuf,

    /// Directory used by JSON exports
    #[serde(default = "default_exports_dir")]
    pub exports_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            exports_dir: default_exports_dir(),
        }
    }
}

// ------------------------------------------------------------
// Classifier configuration
// ------------------------------------------------------------
//
// All pattern lists are regular expressions matched
// case-insensitively against the normalized URL.
//
// Empty family lists fall back to the built-in patterns of
// `classifier::LinkClassifier`.
//
#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    /// Hosts whose links are never collected (subdomains included)
    #[serde(default)]
    pub blacklisted_domains: Vec<String>,

    /// URLs matching any of these patterns are never collected
    #[serde(default)]
    pub ignored_patterns: Vec<String>,

    /// Query parameters removed during normalization
    /// (`utm_*` is always removed)
    #[serde(default = "default_tracking_params")]
    pub tracking_params: Vec<String>,

    #[serde(default)]
    pub families: FamilyPatterns,

    /// Persist links that match no family (tagged `other`)
    #[serde(default = "default_true")]
    pub collect_other: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            blacklisted_domains: Vec::new(),
            ignored_patterns: Vec::new(),
            tracking_params: default_tracking_params(),
            families: FamilyPatterns::default(),
            collect_other: true,
        }
    }
}

/// Per-family pattern overrides. Checked in declaration order.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FamilyPatterns {
    #[serde(default)]
    pub telegram_private_group: Vec<String>,

    #[serde(default)]
    pub telegram_public_group: Vec<String>,

    #[serde(default)]
    pub whatsapp_invite: Vec<String>,
}

// ------------------------------------------------------------
// Collector configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Where attachments are downloaded before scanning.
    /// Defaults to the system temp directory.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Attachments above this size are skipped without download
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,

    /// Cap on inflated size for compressed attachments
    #[serde(default = "default_max_decoded_bytes")]
    pub max_decoded_bytes: u64,

    /// Bound on `stop()` waiting for workers and disconnects
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Random extra delay added to platform back-offs
    #[serde(default = "default_rate_limit_jitter_ms")]
    pub rate_limit_jitter_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            max_attachment_bytes: default_max_attachment_bytes(),
            max_decoded_bytes: default_max_decoded_bytes(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            rate_limit_jitter_ms: default_rate_limit_jitter_ms(),
        }
    }
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Raises the default log filter to `debug`
    pub log: Option<bool>,

    /// Logs every raw gateway frame (very noisy)
    pub raw: Option<bool>,
}

impl Config {
    pub fn debug_log(&self) -> bool {
        self.debug.as_ref().is_some_and(|d| d.log.unwrap_or(false))
    }

    pub fn debug_raw(&self) -> bool {
        self.debug.as_ref().is_some_and(|d| d.raw.unwrap_or(false))
    }
}

fn default_transport_kind() -> String {
    "gateway".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_database_path() -> PathBuf {
    PathBuf::from("links_collector.db")
}

fn default_exports_dir() -> PathBuf {
    PathBuf::from("exports")
}

fn default_tracking_params() -> Vec<String> {
    [
        "fbclid", "gclid", "yclid", "dclid", "msclkid", "igshid", "mc_cid", "mc_eid", "_ga",
        "ref", "ref_src", "si",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_max_attachment_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_max_decoded_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_rate_limit_jitter_ms() -> u64 {
    500
}

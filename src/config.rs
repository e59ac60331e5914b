use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Sentinel rollup expression that matches every path. Always considered
/// last during classification.
pub const CATCHALL: &str = "CATCHALL";

/// Top-level configuration for the cairnstore service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Line-protocol listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// HTTP query API configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Prometheus self-metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Backing wide-column store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Sorted-set path index configuration.
    #[serde(default)]
    pub index: IndexConfig,

    /// Rollup definitions keyed by path expression.
    #[serde(default)]
    pub rollups: HashMap<String, RollupDefConfig>,

    /// Classification order for rollup expressions. First match wins;
    /// CATCHALL must be last.
    #[serde(default)]
    pub rollup_priority: Vec<String>,
}

/// Line-protocol listener configuration.
#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    /// TCP listen address. Default: "0.0.0.0:2003".
    #[serde(default = "default_listener_tcp")]
    pub tcp: String,

    /// Optional UDP listen address. Omit to disable the UDP listener.
    #[serde(default)]
    pub udp: Option<String>,
}

/// HTTP query API configuration.
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// Listen address. Default: "0.0.0.0:8080".
    #[serde(default = "default_api_addr")]
    pub addr: String,

    /// How long a dispatched request may take before the API gives up
    /// on it. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Prometheus self-metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Backing wide-column store configuration.
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// Contact points, host:port. Default: ["127.0.0.1:9042"].
    #[serde(default = "default_store_hosts")]
    pub hosts: Vec<String>,

    /// Keyspace holding the rollup tables. Default: "cairnstore".
    #[serde(default = "default_keyspace")]
    pub keyspace: String,

    /// Replication strategy class for keyspace creation.
    /// Default: "SimpleStrategy".
    #[serde(default = "default_strategy")]
    pub replication_strategy: String,

    /// Extra replication options appended to the keyspace definition,
    /// e.g. "'replication_factor': 1".
    #[serde(default = "default_replication_options")]
    pub replication_options: String,

    /// Maximum rows per write batch. Default: 500.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Sorted-set path index configuration.
#[derive(Debug, Deserialize)]
pub struct IndexConfig {
    /// Redis connection URL. Default: "redis://127.0.0.1:6379/0".
    #[serde(default = "default_index_url")]
    pub url: String,

    /// Sorted-set key holding the path index. Default: "cairnstore.paths".
    #[serde(default = "default_path_key")]
    pub path_key: String,
}

/// How samples are folded into a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Average,
    Max,
    Min,
    Sum,
}

/// One aggregation window as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Bucket width.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// How long the rollup table keeps rows; also the TTL basis.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

/// One rollup definition as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupDefConfig {
    pub method: Method,
    pub windows: Vec<WindowConfig>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listener_tcp() -> String {
    "0.0.0.0:2003".to_string()
}

fn default_api_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_store_hosts() -> Vec<String> {
    vec!["127.0.0.1:9042".to_string()]
}

fn default_keyspace() -> String {
    "cairnstore".to_string()
}

fn default_strategy() -> String {
    "SimpleStrategy".to_string()
}

fn default_replication_options() -> String {
    "'replication_factor': 1".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_index_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_path_key() -> String {
    "cairnstore.paths".to_string()
}

// --- Default trait impls ---

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            tcp: default_listener_tcp(),
            udp: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hosts: default_store_hosts(),
            keyspace: default_keyspace(),
            replication_strategy: default_strategy(),
            replication_options: default_replication_options(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            path_key: default_path_key(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.rollups.is_empty() {
            bail!("at least one rollup definition is required");
        }

        if self.rollup_priority.is_empty() {
            bail!("rollup_priority is required");
        }

        if self.rollup_priority.last().map(String::as_str) != Some(CATCHALL) {
            bail!("rollup_priority must end with {CATCHALL}");
        }

        for expr in &self.rollup_priority {
            if !self.rollups.contains_key(expr) {
                bail!("rollup_priority entry {expr:?} has no rollup definition");
            }
        }

        for expr in self.rollups.keys() {
            if !self.rollup_priority.contains(expr) {
                bail!("rollup {expr:?} is missing from rollup_priority");
            }
        }

        for (expr, def) in &self.rollups {
            if def.windows.is_empty() {
                bail!("rollup {expr:?} has no windows");
            }

            for w in &def.windows {
                if w.window.as_secs() == 0 || w.window.subsec_nanos() != 0 {
                    bail!("rollup {expr:?}: window must be a whole number of seconds");
                }
                if w.retention.subsec_nanos() != 0 {
                    bail!("rollup {expr:?}: retention must be a whole number of seconds");
                }
                if w.window > w.retention {
                    bail!("rollup {expr:?}: window exceeds retention");
                }
            }
        }

        if self.store.batch_size == 0 {
            bail!("store.batch_size must be positive");
        }

        if self.store.hosts.is_empty() {
            bail!("store.hosts is required");
        }

        Ok(())
    }
}

/// One aggregation window with its derived table name.
#[derive(Debug, Clone)]
pub struct Window {
    pub window: Duration,
    pub retention: Duration,
    pub table: String,
}

/// A compiled rollup definition.
#[derive(Debug)]
pub struct RollupDef {
    pub method: Method,
    /// Compiled path expression; None for the catchall.
    pub expression: Option<Regex>,
    pub windows: Vec<Window>,
}

/// The full compiled rollup set: definitions plus classification order.
///
/// Immutable after startup; shared by the store manager and read workers.
#[derive(Debug)]
pub struct Rollups {
    priority: Vec<String>,
    defs: HashMap<String, RollupDef>,
}

impl Rollups {
    /// Compile the configured rollup definitions: regexes, derived table
    /// names, and the classification order.
    pub fn compile(cfg: &Config) -> Result<Self> {
        let mut defs = HashMap::with_capacity(cfg.rollups.len());

        for (expr, def) in &cfg.rollups {
            let expression = if expr == CATCHALL {
                None
            } else {
                Some(
                    Regex::new(expr)
                        .with_context(|| format!("compiling rollup expression {expr:?}"))?,
                )
            };

            let windows = def
                .windows
                .iter()
                .map(|w| Window {
                    window: w.window,
                    retention: w.retention,
                    table: table_name(w.window, w.retention),
                })
                .collect();

            defs.insert(
                expr.clone(),
                RollupDef {
                    method: def.method,
                    expression,
                    windows,
                },
            );
        }

        Ok(Self {
            priority: cfg.rollup_priority.clone(),
            defs,
        })
    }

    /// Returns the first expression in priority order that matches the
    /// supplied path. The catchall always appears last and is therefore
    /// the default.
    pub fn classify(&self, path: &str) -> &str {
        let mut chosen = CATCHALL;
        for expr in &self.priority {
            chosen = expr;
            if expr != CATCHALL {
                if let Some(def) = self.defs.get(expr) {
                    if def.expression.as_ref().is_some_and(|re| re.is_match(path)) {
                        break;
                    }
                }
            }
        }
        chosen
    }

    /// Returns the definition for an expression key.
    ///
    /// Panics only on a key not produced by `classify`, which cannot
    /// happen for a validated configuration.
    pub fn def(&self, expr: &str) -> &RollupDef {
        &self.defs[expr]
    }

    /// Expression keys in classification order.
    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.priority.iter().map(String::as_str)
    }

    /// All distinct rollup tables with their retentions, in stable order.
    pub fn tables(&self) -> BTreeMap<String, Duration> {
        let mut tables = BTreeMap::new();
        for def in self.defs.values() {
            for w in &def.windows {
                tables.insert(w.table.clone(), w.retention);
            }
        }
        tables
    }
}

/// Derives the table name for a window: `rollup_<window>_<retention>`,
/// both rendered in whole seconds.
fn table_name(window: Duration, retention: Duration) -> String {
    format!("rollup_{}_{}", window.as_secs(), retention.as_secs())
}

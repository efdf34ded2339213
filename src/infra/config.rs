//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and field has a default, so partial files are valid.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted when `routing.api_key` is not set
pub const ROUTING_API_KEY_ENV: &str = "ROUTING_API_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier, used as the Prometheus `site` label
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "dispatch".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default = "default_geocoder_base_url")]
    pub base_url: String,
    /// Tried in order until one yields a match
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    /// Pause between two language attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Longest wait for the admission gate before a language attempt is abandoned
    #[serde(default = "default_admission_max_wait_ms")]
    pub admission_max_wait_ms: u64,
    /// Minimum spacing between two admitted calls
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub referer: Option<String>,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoder_base_url(),
            languages: default_languages(),
            country_code: default_country_code(),
            backoff_ms: default_backoff_ms(),
            admission_max_wait_ms: default_admission_max_wait_ms(),
            min_interval_ms: default_min_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
            referer: None,
        }
    }
}

impl GeocoderConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_geocoder_base_url() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}

fn default_languages() -> Vec<String> {
    vec!["ro".to_string(), "ru".to_string(), "en".to_string()]
}

fn default_country_code() -> String {
    "md".to_string()
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_admission_max_wait_ms() -> u64 {
    5000
}

fn default_min_interval_ms() -> u64 {
    1100
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    concat!("dispatch-engine/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_routing_base_url")]
    pub base_url: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Bearer credential; falls back to the ROUTING_API_KEY environment variable
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_avoid_features")]
    pub avoid_features: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_url: default_routing_base_url(),
            profile: default_profile(),
            api_key: None,
            request_timeout_ms: default_request_timeout_ms(),
            avoid_features: default_avoid_features(),
        }
    }
}

impl RoutingConfig {
    /// Configured key, else the environment, else empty
    pub fn resolved_api_key(&self) -> String {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| env::var(ROUTING_API_KEY_ENV).ok())
            .unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_routing_base_url() -> String {
    "https://api.openrouteservice.org".to_string()
}

fn default_profile() -> String {
    "driving-car".to_string()
}

fn default_avoid_features() -> Vec<String> {
    vec!["ferries".to_string(), "tollways".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankingConfig {
    /// Candidates kept after the straight-line pre-filter
    #[serde(default = "default_shortlist_size")]
    pub shortlist_size: usize,
    #[serde(default = "default_max_concurrent_routes")]
    pub max_concurrent_routes: usize,
    #[serde(default = "default_route_timeout_ms")]
    pub route_timeout_ms: u64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            shortlist_size: default_shortlist_size(),
            max_concurrent_routes: default_max_concurrent_routes(),
            route_timeout_ms: default_route_timeout_ms(),
        }
    }
}

impl RankingConfig {
    pub fn route_timeout(&self) -> Duration {
        Duration::from_millis(self.route_timeout_ms)
    }
}

fn default_shortlist_size() -> usize {
    5
}

fn default_max_concurrent_routes() -> usize {
    4
}

fn default_route_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_reservation_attempts")]
    pub max_reservation_attempts: u32,
    /// Route the lead technician through the selected warehouse
    #[serde(default = "default_lead_via_warehouse")]
    pub lead_via_warehouse: bool,
    /// Batch mode concurrency
    #[serde(default = "default_max_concurrent_orders")]
    pub max_concurrent_orders: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_reservation_attempts: default_max_reservation_attempts(),
            lead_via_warehouse: default_lead_via_warehouse(),
            max_concurrent_orders: default_max_concurrent_orders(),
        }
    }
}

fn default_max_reservation_attempts() -> u32 {
    3
}

fn default_lead_via_warehouse() -> bool {
    true
}

fn default_max_concurrent_orders() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "dispatch".to_string()
}

fn default_op_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// TOML file with warehouses (and stock) and the technician roster
    #[serde(default = "default_fleet_file")]
    pub file: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self { file: default_fleet_file() }
    }
}

fn default_fleet_file() -> String {
    "config/fleet.toml".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    #[serde(default = "default_egress_enabled")]
    pub enabled: bool,
    /// File path for assignment egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { enabled: default_egress_enabled(), file: default_egress_file() }
    }
}

fn default_egress_enabled() -> bool {
    true
}

fn default_egress_file() -> String {
    "assignments.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site: SiteConfig,
    geocoder: GeocoderConfig,
    routing: RoutingConfig,
    ranking: RankingConfig,
    dispatch: DispatchConfig,
    store: StoreConfig,
    fleet: FleetConfig,
    egress: EgressConfig,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site: toml_config.site,
            geocoder: toml_config.geocoder,
            routing: toml_config.routing,
            ranking: toml_config.ranking,
            dispatch: toml_config.dispatch,
            store: toml_config.store,
            fleet: toml_config.fleet,
            egress: toml_config.egress,
            metrics: toml_config.metrics,
            config_file,
        }
    }

    /// Determine config file path from an explicit argument or the environment
    pub fn resolve_config_path(explicit: Option<&str>) -> String {
        if let Some(path) = explicit {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults on any error
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Resolve the path (argument, env, default) and load it
    pub fn load(explicit: Option<&str>) -> Self {
        Self::load_from_path(Self::resolve_config_path(explicit))
    }

    pub fn site_id(&self) -> &str {
        &self.site.id
    }

    pub fn geocoder(&self) -> &GeocoderConfig {
        &self.geocoder
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    pub fn ranking(&self) -> &RankingConfig {
        &self.ranking
    }

    pub fn dispatch(&self) -> &DispatchConfig {
        &self.dispatch
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn fleet(&self) -> &FleetConfig {
        &self.fleet
    }

    pub fn egress(&self) -> &EgressConfig {
        &self.egress
    }

    pub fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

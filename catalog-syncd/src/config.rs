use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Removed services older than this are purged by maintenance
    #[serde(default = "default_removed_retention_days")]
    pub removed_retention_days: u32,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first attempt
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Pause before each sub-folder request
    #[serde(default = "default_folder_delay")]
    pub folder_delay_ms: u64,
    /// Pause between regions in a full sync
    #[serde(default = "default_region_delay")]
    pub region_delay_ms: u64,
    /// Periodic full sync, 0 disables it
    #[serde(default)]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// One upstream ArcGIS REST catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    /// Short code accepted in queries, e.g. "WA"
    pub code: String,
    /// Canonical name stored with each service, e.g. "washington"
    pub name: String,
    /// REST services root, e.g. "https://gis.ecology.wa.gov/serverext/rest/services/"
    pub url: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/catalog-syncd/catalog.db")
}

fn default_removed_retention_days() -> u32 {
    30
}

fn default_maintenance_interval() -> u64 {
    3600
}

fn default_timeout() -> u64 {
    20
}

fn default_retries() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    format!("catalog-syncd/{}", env!("CARGO_PKG_VERSION"))
}

fn default_folder_delay() -> u64 {
    100
}

fn default_region_delay() -> u64 {
    1000
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_listen() -> String {
    "[::]:8090".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            removed_retention_days: default_removed_retention_days(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            retries: default_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            folder_delay_ms: default_folder_delay(),
            region_delay_ms: default_region_delay(),
            interval_secs: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff before retry number `attempt` (0-based), capped at `max_delay_ms`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.fetch.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be at least 1");
        }
        for (i, region) in self.regions.iter().enumerate() {
            if region.name.trim().is_empty() {
                bail!("region #{} has an empty name", i + 1);
            }
            if !region.url.starts_with("http://") && !region.url.starts_with("https://") {
                bail!("region '{}' has a non-http url: {}", region.name, region.url);
            }
            let duplicate = self.regions[..i].iter().any(|other| {
                other.name.eq_ignore_ascii_case(&region.name)
                    || other.code.eq_ignore_ascii_case(&region.code)
            });
            if duplicate {
                bail!("region '{}' is configured twice", region.name);
            }
        }
        Ok(())
    }

    pub fn find_region(&self, name: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Map a region code or name to the canonical stored name.
    /// Unknown values are trimmed and lower-cased.
    pub fn normalize_region(&self, value: &str) -> String {
        let value = value.trim();
        self.regions
            .iter()
            .find(|r| r.code.eq_ignore_ascii_case(value) || r.name.eq_ignore_ascii_case(value))
            .map(|r| r.name.clone())
            .unwrap_or_else(|| value.to_lowercase())
    }
}

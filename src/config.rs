use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_max_board_articles")]
    pub max_board_articles: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_status_filter")]
    pub status_filter: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_markets_per_cycle")]
    pub max_markets_per_cycle: usize,
    #[serde(default = "default_source_timeout")]
    pub request_timeout_secs: u64,
}

/// Weights of the interestingness score. Each component is roughly in [0, 1].
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_volume_weight")]
    pub volume_weight: f64,
    #[serde(default = "default_spread_weight")]
    pub spread_weight: f64,
    #[serde(default = "default_open_interest_weight")]
    pub open_interest_weight: f64,
    #[serde(default = "default_time_weight")]
    pub time_to_close_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_articles_per_cycle")]
    pub max_articles_per_cycle: usize,
    #[serde(default = "default_max_results_per_cycle")]
    pub max_results_per_cycle: usize,
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    #[serde(default = "default_generation_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Optional model override; each provider has its own default.
    #[serde(default)]
    pub model: Option<String>,
    /// Regenerate before TTL expiry when the market moved materially.
    #[serde(default)]
    pub invalidate_on_change: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_index_ttl")]
    pub index_ttl_secs: u64,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_mins: u64,
    #[serde(default = "default_resolution_interval")]
    pub resolution_check_interval_mins: u64,
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub csv_logging: bool,
    #[serde(default = "default_csv_path")]
    pub csv_log_path: String,
}

fn default_max_board_articles() -> usize { 50 }
fn default_status_filter() -> String { "open".to_string() }
fn default_page_limit() -> usize { 100 }
fn default_max_pages() -> usize { 1 }
fn default_max_markets_per_cycle() -> usize { 15 }
fn default_source_timeout() -> u64 { 15 }
fn default_volume_weight() -> f64 { 40.0 }
fn default_spread_weight() -> f64 { 30.0 }
fn default_open_interest_weight() -> f64 { 20.0 }
fn default_time_weight() -> f64 { 10.0 }
fn default_max_articles_per_cycle() -> usize { 3 }
fn default_max_results_per_cycle() -> usize { 2 }
fn default_min_words() -> usize { 400 }
fn default_max_words() -> usize { 650 }
fn default_generation_timeout() -> u64 { 90 }
fn default_max_tokens() -> u32 { 2000 }
fn default_cache_backend() -> String { "sqlite".to_string() }
fn default_cache_ttl() -> u64 { 3600 }
fn default_index_ttl() -> u64 { 7 * 24 * 3600 }
fn default_sqlite_path() -> String { "cache/prediction_pulse.db".to_string() }
fn default_key_prefix() -> String { "prediction_pulse".to_string() }
fn default_refresh_interval() -> u64 { 20 }
fn default_resolution_interval() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_csv_path() -> String { "logs/cycles.csv".to_string() }

impl Default for SystemConfig {
    fn default() -> Self {
        Self { max_board_articles: default_max_board_articles() }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            status_filter: default_status_filter(),
            page_limit: default_page_limit(),
            max_pages: default_max_pages(),
            max_markets_per_cycle: default_max_markets_per_cycle(),
            request_timeout_secs: default_source_timeout(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            volume_weight: default_volume_weight(),
            spread_weight: default_spread_weight(),
            open_interest_weight: default_open_interest_weight(),
            time_to_close_weight: default_time_weight(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_articles_per_cycle: default_max_articles_per_cycle(),
            max_results_per_cycle: default_max_results_per_cycle(),
            min_words: default_min_words(),
            max_words: default_max_words(),
            request_timeout_secs: default_generation_timeout(),
            max_tokens: default_max_tokens(),
            model: None,
            invalidate_on_change: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            ttl_secs: default_cache_ttl(),
            index_ttl_secs: default_index_ttl(),
            sqlite_path: default_sqlite_path(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_mins: default_refresh_interval(),
            resolution_check_interval_mins: default_resolution_interval(),
            run_on_start: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: default_csv_path(),
        }
    }
}

impl SourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl GenerationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_mins.max(1) * 60)
    }

    pub fn resolution_interval(&self) -> Duration {
        Duration::from_secs(self.resolution_check_interval_mins.max(1) * 60)
    }
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub llm_provider: String,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub kalshi_api_base: String,
    pub redis_url: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;

        if config.generation.min_words > config.generation.max_words {
            anyhow::bail!(
                "generation.min_words ({}) exceeds generation.max_words ({})",
                config.generation.min_words,
                config.generation.max_words
            );
        }

        Ok(config)
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let env_opt = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Ok(Self {
            llm_provider: std::env::var("LLM_PROVIDER")
                .unwrap_or_else(|_| "anthropic".to_string())
                .to_lowercase(),
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            groq_api_key: env_opt("GROQ_API_KEY"),
            kalshi_api_base: std::env::var("KALSHI_API_BASE")
                .unwrap_or_else(|_| "https://api.elections.kalshi.com/trade-api/v2".to_string()),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
        })
    }
}

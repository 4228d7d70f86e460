//! Fakes for the external collaborators, shared by the unit tests.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use crate::config::{GenerationConfig, ScoringConfig};
use crate::data::cache::{Cache, CacheBackend, CacheError, MemoryCache};
use crate::data::kalshi_api::{MarketSource, SourceError};
use crate::data::types::{Market, MarketStatus, PricePoint};
use crate::generation::llm::{GenerationError, TextGenerator};
use crate::generation::orchestrator::ArticleOrchestrator;
use crate::pipeline::board::ArticleBoard;
use crate::pipeline::refresh::{PipelineSettings, RefreshPipeline};
use crate::ranking::scoring::ScoringEngine;

/// Open market closing in three days. The id is bracketed in the title so
/// prompts can be matched back to their market.
pub fn sample_market(id: &str, probability: f64) -> Market {
    Market {
        id: id.to_string(),
        title: format!("Will [{}] resolve YES?", id),
        subtitle: None,
        probability,
        volume: 10_000,
        volume_24h: 400,
        open_interest: 500,
        close_time: Utc::now() + ChronoDuration::days(3),
        status: MarketStatus::Open,
        result: None,
        price_change: None,
    }
}

/// A well-formed model reply whose body has `words` words.
pub fn article_json(words: usize) -> String {
    let body = vec!["word"; words].join(" ");
    serde_json::json!({
        "title": "Markets Are Split",
        "teaser": "A genuinely open question.",
        "content": body,
    })
    .to_string()
}

pub struct ScriptedGenerator {
    default_response: String,
    overrides: Vec<(String, String)>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(default_response: String) -> Self {
        Self {
            default_response,
            overrides: Vec::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_words(words: usize) -> Self {
        Self::new(article_json(words))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reply with `response` whenever the prompt is about `market_id`.
    pub fn respond_to(mut self, market_id: &str, response: String) -> Self {
        self.overrides.push((format!("[{}]", market_id), response));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every user prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, _system_prompt: &str, user_prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(user_prompt.to_string());
        }
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let response = self.overrides
            .iter()
            .find(|(needle, _)| user_prompt.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.default_response.clone());
        Ok(response)
    }

    fn provider(&self) -> &'static str {
        "scripted"
    }
}

pub struct StaticSource {
    markets: Option<Vec<Market>>,
    lookup: Mutex<HashMap<String, Market>>,
    history: Mutex<HashMap<String, Vec<PricePoint>>>,
    lookups: Mutex<Vec<String>>,
    delay: Duration,
    fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(markets: Vec<Market>) -> Self {
        Self {
            markets: Some(markets),
            lookup: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            lookups: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            markets: None,
            lookup: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            lookups: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `get_market` return this snapshot.
    pub fn set_market(&self, market: Market) {
        if let Ok(mut lookup) = self.lookup.lock() {
            lookup.insert(market.id.clone(), market);
        }
    }

    /// Prices returned by `get_price_history`, newest first.
    pub fn set_history(&self, id: &str, prices: &[f64]) {
        let points = prices.iter().map(|&yes_price| PricePoint { yes_price, ts: None }).collect();
        if let Ok(mut history) = self.history.lock() {
            history.insert(id.to_string(), points);
        }
    }

    /// Ids passed to `get_market`, in call order.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketSource for StaticSource {
    async fn fetch_markets(&self, status: MarketStatus) -> Result<Vec<Market>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.markets {
            Some(markets) => Ok(markets.iter().filter(|m| m.status == status).cloned().collect()),
            None => Err(SourceError::Unavailable("connection refused".to_string())),
        }
    }

    async fn get_market(&self, id: &str) -> Result<Option<Market>, SourceError> {
        if self.markets.is_none() {
            return Err(SourceError::Unavailable("connection refused".to_string()));
        }
        if let Ok(mut lookups) = self.lookups.lock() {
            lookups.push(id.to_string());
        }
        Ok(self.lookup.lock().ok().and_then(|lookup| lookup.get(id).cloned()))
    }

    async fn get_price_history(&self, id: &str) -> Result<Vec<PricePoint>, SourceError> {
        if self.markets.is_none() {
            return Err(SourceError::Unavailable("connection refused".to_string()));
        }
        Ok(self.history
            .lock()
            .ok()
            .and_then(|history| history.get(id).cloned())
            .unwrap_or_default())
    }
}

/// Backend that fails every call, as an unreachable Redis would.
pub struct UnavailableCache;

#[async_trait]
impl CacheBackend for UnavailableCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

pub fn pipeline_settings(max_articles: usize) -> PipelineSettings {
    PipelineSettings {
        status_filter: MarketStatus::Open,
        max_markets_per_cycle: 15,
        max_articles_per_cycle: max_articles,
        max_results_per_cycle: 2,
        source_timeout: Duration::from_secs(5),
    }
}

/// Pipeline over an in-memory cache with default scoring weights.
pub async fn pipeline(
    source: Arc<StaticSource>,
    generator: Arc<ScriptedGenerator>,
    max_articles: usize,
) -> RefreshPipeline {
    let cache = Cache::new(Arc::new(MemoryCache::new()), "test");
    let orchestrator = Arc::new(ArticleOrchestrator::new(
        generator,
        cache.clone(),
        &GenerationConfig::default(),
        Duration::from_secs(60),
    ));
    let board = ArticleBoard::load(cache, 50, Duration::from_secs(600)).await;

    RefreshPipeline::new(
        source,
        ScoringEngine::new(ScoringConfig::default()),
        orchestrator,
        board,
        pipeline_settings(max_articles),
    )
}

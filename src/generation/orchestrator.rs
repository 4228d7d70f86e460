use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use crate::config::GenerationConfig;
use crate::data::cache::Cache;
use crate::data::types::{article_id, Article, ArticleKind, ArticleStatus, Market};
use crate::generation::llm::{GenerationError, TextGenerator};
use crate::generation::prompt::{
    self, WordBand, ANALYSIS_STYLE, RESULTS_BAND, RESULTS_STYLE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleOrigin {
    Cached,
    Generated,
}

#[derive(Debug, Clone)]
pub struct EnsuredArticle {
    pub article: Article,
    pub origin: ArticleOrigin,
}

/// Every article for a market lives under this one key.
pub fn cache_key(market_id: &str) -> String {
    format!("article:{}", market_id)
}

/// Turns markets into articles, calling the text generator only on a cache
/// miss and never twice at once for the same market.
pub struct ArticleOrchestrator {
    generator: Arc<dyn TextGenerator>,
    cache: Cache,
    locks: DashMap<String, Arc<Mutex<()>>>,
    band: WordBand,
    ttl: Duration,
    timeout: Duration,
    invalidate_on_change: bool,
}

/// Holds a per-key lock and drops the map entry once nobody else wants it.
struct KeyLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: no holder and no waiter
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ArticleOrchestrator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        cache: Cache,
        config: &GenerationConfig,
        ttl: Duration,
    ) -> Self {
        Self {
            generator,
            cache,
            locks: DashMap::new(),
            band: WordBand { min: config.min_words, max: config.max_words },
            ttl,
            timeout: config.request_timeout(),
            invalidate_on_change: config.invalidate_on_change,
        }
    }

    /// Number of per-key locks currently allocated.
    #[cfg(test)]
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// The live cached analysis article for this market, without generating.
    pub async fn cached_article(&self, market: &Market) -> Option<Article> {
        self.cached_analysis(&cache_key(&market.id), &market.fingerprint()).await
    }

    /// Drop expired entries from backends that keep them around.
    pub async fn sweep_expired(&self) -> usize {
        self.cache.purge_expired().await
    }

    /// Return the live cached analysis article for this market, or generate,
    /// cache and return a new one.
    pub async fn ensure_article(&self, market: &Market) -> Result<EnsuredArticle, GenerationError> {
        let key = cache_key(&market.id);
        let fingerprint = market.fingerprint();

        if let Some(article) = self.cached_analysis(&key, &fingerprint).await {
            return Ok(EnsuredArticle { article, origin: ArticleOrigin::Cached });
        }

        let _lease = self.acquire(&key).await;

        // Whoever held the lock before us may have just written it
        if let Some(article) = self.cached_analysis(&key, &fingerprint).await {
            debug!("Reusing article generated concurrently for {}", market.id);
            return Ok(EnsuredArticle { article, origin: ArticleOrigin::Cached });
        }

        let now = Utc::now();
        let user_prompt = prompt::build_article_prompt(market, self.band, now);
        let article = self
            .generate(market, ArticleKind::Analysis, ANALYSIS_STYLE, &user_prompt, self.band, None)
            .await?;

        self.store(&key, &article).await;
        Ok(EnsuredArticle { article, origin: ArticleOrigin::Generated })
    }

    /// Post-resolution article for a settled market. Supersedes the analysis
    /// article under the same key.
    pub async fn ensure_results_article(
        &self,
        market: &Market,
        original: Option<&Article>,
    ) -> Result<EnsuredArticle, GenerationError> {
        let outcome = market
            .result
            .ok_or_else(|| GenerationError::Unresolved(market.id.clone()))?;
        let key = cache_key(&market.id);

        if let Some(article) = self.cached_results(&key).await {
            return Ok(EnsuredArticle { article, origin: ArticleOrigin::Cached });
        }

        let _lease = self.acquire(&key).await;

        if let Some(article) = self.cached_results(&key).await {
            return Ok(EnsuredArticle { article, origin: ArticleOrigin::Cached });
        }

        let now = Utc::now();
        let user_prompt = prompt::build_results_prompt(market, outcome, original, now);
        let mut article = self
            .generate(market, ArticleKind::Results, RESULTS_STYLE, &user_prompt, RESULTS_BAND, original)
            .await?;
        article.outcome = Some(outcome);
        article.status = ArticleStatus::Resolved;

        self.store(&key, &article).await;
        Ok(EnsuredArticle { article, origin: ArticleOrigin::Generated })
    }

    async fn acquire(&self, key: &str) -> KeyLease<'_> {
        let lock = self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let mut lease = KeyLease {
            locks: &self.locks,
            key: key.to_string(),
            guard: None,
        };
        lease.guard = Some(lock.lock_owned().await);
        lease
    }

    async fn cached_analysis(&self, key: &str, fingerprint: &str) -> Option<Article> {
        let article = self.cache.get_json::<Article>(key).await?;

        if article.kind != ArticleKind::Analysis {
            return None;
        }
        if self.invalidate_on_change && article.fingerprint != fingerprint {
            info!("Market {} changed since its article was written, regenerating", article.market_id);
            return None;
        }
        Some(article)
    }

    async fn cached_results(&self, key: &str) -> Option<Article> {
        self.cache
            .get_json::<Article>(key)
            .await
            .filter(|a| a.kind == ArticleKind::Results)
    }

    async fn store(&self, key: &str, article: &Article) {
        if !self.cache.set_json(key, article, self.ttl).await {
            warn!(
                "Article for {} generated but not cached; it will be regenerated next cycle",
                article.market_id
            );
        }
    }

    async fn generate(
        &self,
        market: &Market,
        kind: ArticleKind,
        style: &str,
        user_prompt: &str,
        band: WordBand,
        original: Option<&Article>,
    ) -> Result<Article, GenerationError> {
        info!("Generating {:?} article for market: {}", kind, market.id);

        let raw = match tokio::time::timeout(self.timeout, self.generator.complete(style, user_prompt)).await {
            Ok(result) => result?,
            Err(_) => return Err(GenerationError::Timeout(self.timeout)),
        };

        let text = prompt::parse_generated(&raw)?;
        let word_count = prompt::word_count(&text.content);
        let within_length_band = band.contains(word_count);
        if !within_length_band {
            warn!(
                "Article for {} is {} words, outside the {}-{} band; keeping it",
                market.id, word_count, band.min, band.max
            );
        }

        let generated_at = Utc::now();
        let article = Article {
            id: article_id(&market.id, generated_at, kind),
            kind,
            market_id: market.id.clone(),
            market_title: market.title.clone(),
            title: text.title,
            teaser: text.teaser,
            body: text.content,
            probability_pct: market.probability_pct(),
            close_time: market.close_time,
            volume: market.volume,
            generated_at,
            word_count,
            within_length_band,
            status: ArticleStatus::Active,
            outcome: None,
            original_article_id: original.map(|a| a.id.clone()),
            fingerprint: market.fingerprint(),
        };

        info!(
            "Generated article: {} ({} words)",
            article.title.chars().take(50).collect::<String>(),
            word_count
        );
        Ok(article)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::cache::MemoryCache;
    use crate::data::types::{MarketResult, MarketStatus};
    use crate::testing::{article_json, sample_market, ScriptedGenerator, UnavailableCache};

    fn orchestrator(generator: Arc<ScriptedGenerator>, config: GenerationConfig) -> ArticleOrchestrator {
        let cache = Cache::new(Arc::new(MemoryCache::new()), "test");
        ArticleOrchestrator::new(generator, cache, &config, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_cache_hit_skips_generation() {
        let generator = Arc::new(ScriptedGenerator::with_words(450));
        let orch = orchestrator(generator.clone(), GenerationConfig::default());
        let market = sample_market("FED", 0.5);

        let first = orch.ensure_article(&market).await.unwrap();
        let second = orch.ensure_article(&market).await.unwrap();

        assert_eq!(first.origin, ArticleOrigin::Generated);
        assert_eq!(second.origin, ArticleOrigin::Cached);
        assert_eq!(first.article, second.article);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_generation() {
        let generator = Arc::new(
            ScriptedGenerator::with_words(450).with_delay(Duration::from_millis(200)),
        );
        let orch = Arc::new(orchestrator(generator.clone(), GenerationConfig::default()));
        let market = sample_market("FED", 0.5);

        let a = {
            let orch = orch.clone();
            let market = market.clone();
            tokio::spawn(async move { orch.ensure_article(&market).await })
        };
        let b = {
            let orch = orch.clone();
            let market = market.clone();
            tokio::spawn(async move { orch.ensure_article(&market).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(generator.calls(), 1);
        assert_eq!(a.article.id, b.article.id);
        assert_eq!(generator.max_in_flight(), 1);
        assert_eq!(orch.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_different_markets_generate_in_parallel() {
        let generator = Arc::new(
            ScriptedGenerator::with_words(450).with_delay(Duration::from_millis(200)),
        );
        let orch = Arc::new(orchestrator(generator.clone(), GenerationConfig::default()));

        let market_a = sample_market("A", 0.5);
        let market_b = sample_market("B", 0.5);

        let (a, b) = tokio::join!(
            orch.ensure_article(&market_a),
            orch.ensure_article(&market_b),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(generator.calls(), 2);
        assert_eq!(generator.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_empty_generation_is_not_cached() {
        let generator = Arc::new(ScriptedGenerator::with_words(450).respond_to("FED", String::new()));
        let orch = orchestrator(generator.clone(), GenerationConfig::default());
        let market = sample_market("FED", 0.5);

        assert!(matches!(orch.ensure_article(&market).await, Err(GenerationError::Empty)));
        assert!(matches!(orch.ensure_article(&market).await, Err(GenerationError::Empty)));
        assert_eq!(generator.calls(), 2);
        assert_eq!(orch.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_out_of_band_length_is_flagged_not_rejected() {
        let generator = Arc::new(ScriptedGenerator::with_words(120));
        let orch = orchestrator(generator, GenerationConfig::default());

        let ensured = orch.ensure_article(&sample_market("SHORT", 0.5)).await.unwrap();

        assert_eq!(ensured.article.word_count, 120);
        assert!(!ensured.article.within_length_band);
    }

    #[tokio::test]
    async fn test_timeout_is_a_local_failure() {
        let generator = Arc::new(
            ScriptedGenerator::with_words(450).with_delay(Duration::from_millis(500)),
        );
        let config = GenerationConfig { request_timeout_secs: 0, ..GenerationConfig::default() };
        let orch = orchestrator(generator, config);

        let result = orch.ensure_article(&sample_market("SLOW", 0.5)).await;

        assert!(matches!(result, Err(GenerationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_unavailable_cache_regenerates_every_time() {
        let generator = Arc::new(ScriptedGenerator::with_words(450));
        let cache = Cache::new(Arc::new(UnavailableCache), "test");
        let orch = ArticleOrchestrator::new(
            generator.clone(),
            cache,
            &GenerationConfig::default(),
            Duration::from_secs(60),
        );
        let market = sample_market("FED", 0.5);

        assert!(orch.ensure_article(&market).await.is_ok());
        assert!(orch.ensure_article(&market).await.is_ok());
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn test_identifier_only_cache_ignores_price_moves() {
        let generator = Arc::new(ScriptedGenerator::with_words(450));
        let orch = orchestrator(generator.clone(), GenerationConfig::default());

        orch.ensure_article(&sample_market("FED", 0.40)).await.unwrap();
        let again = orch.ensure_article(&sample_market("FED", 0.70)).await.unwrap();

        assert_eq!(again.origin, ArticleOrigin::Cached);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_fingerprint_invalidation_when_enabled() {
        let generator = Arc::new(ScriptedGenerator::with_words(450));
        let config = GenerationConfig { invalidate_on_change: true, ..GenerationConfig::default() };
        let orch = orchestrator(generator.clone(), config);

        orch.ensure_article(&sample_market("FED", 0.40)).await.unwrap();
        let same = orch.ensure_article(&sample_market("FED", 0.40)).await.unwrap();
        let moved = orch.ensure_article(&sample_market("FED", 0.70)).await.unwrap();

        assert_eq!(same.origin, ArticleOrigin::Cached);
        assert_eq!(moved.origin, ArticleOrigin::Generated);
        assert_eq!(moved.article.probability_pct, Some(70));
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn test_results_article_supersedes_analysis() {
        let generator = Arc::new(ScriptedGenerator::with_words(400));
        let orch = orchestrator(generator.clone(), GenerationConfig::default());
        let open = sample_market("FED", 0.73);
        let analysis = orch.ensure_article(&open).await.unwrap().article;

        let mut settled = open.clone();
        settled.status = MarketStatus::Settled;
        settled.result = Some(MarketResult::No);
        let results = orch.ensure_results_article(&settled, Some(&analysis)).await.unwrap();

        assert_eq!(results.article.kind, ArticleKind::Results);
        assert_eq!(results.article.outcome, Some(MarketResult::No));
        assert_eq!(results.article.original_article_id, Some(analysis.id.clone()));
        assert!(results.article.id.ends_with("-results"));

        // The analysis entry is gone from the cache: a fresh request regenerates
        let again = orch.ensure_article(&open).await.unwrap();
        assert_eq!(again.origin, ArticleOrigin::Generated);
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_cached_article_never_generates() {
        let generator = Arc::new(ScriptedGenerator::with_words(450));
        let orch = orchestrator(generator.clone(), GenerationConfig::default());
        let market = sample_market("FED", 0.5);

        assert!(orch.cached_article(&market).await.is_none());
        orch.ensure_article(&market).await.unwrap();

        assert!(orch.cached_article(&market).await.is_some());
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_results_requires_settled_result() {
        let generator = Arc::new(ScriptedGenerator::new(article_json(10)));
        let orch = orchestrator(generator.clone(), GenerationConfig::default());

        let result = orch.ensure_results_article(&sample_market("OPEN", 0.5), None).await;

        assert!(matches!(result, Err(GenerationError::Unresolved(_))));
        assert_eq!(generator.calls(), 0);
    }
}

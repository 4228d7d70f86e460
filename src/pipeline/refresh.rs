use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use crate::config::Config;
use crate::data::kalshi_api::{MarketSource, SourceError};
use crate::data::types::{price_change, Article, ArticleKind, ArticleStatus, Market, MarketStatus};
use crate::generation::llm::GenerationError;
use crate::generation::orchestrator::{ArticleOrchestrator, ArticleOrigin, EnsuredArticle};
use crate::monitoring::logger::CsvLogger;
use crate::pipeline::board::ArticleBoard;
use crate::ranking::scoring::ScoringEngine;
use crate::ranking::selection::select;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub status_filter: MarketStatus,
    pub max_markets_per_cycle: usize,
    pub max_articles_per_cycle: usize,
    pub max_results_per_cycle: usize,
    pub source_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let status_filter = config.source.status_filter
            .parse::<MarketStatus>()
            .map_err(anyhow::Error::msg)?;

        Ok(Self {
            status_filter,
            max_markets_per_cycle: config.source.max_markets_per_cycle,
            max_articles_per_cycle: config.generation.max_articles_per_cycle,
            max_results_per_cycle: config.generation.max_results_per_cycle,
            source_timeout: config.source.request_timeout(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// Every selected market has a current article
    Success,
    /// Some markets failed, others were produced
    PartialSuccess,
    /// Source answered but nothing was worth writing about
    NoMarkets,
    /// Source unreachable; the board was left as it was
    SourceUnavailable,
    /// Every selected market failed
    Failed,
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleStatus::Success => write!(f, "success"),
            CycleStatus::PartialSuccess => write!(f, "partial_success"),
            CycleStatus::NoMarkets => write!(f, "no_markets"),
            CycleStatus::SourceUnavailable => write!(f, "source_unavailable"),
            CycleStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketFailure {
    pub market_id: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub status: CycleStatus,
    pub markets_fetched: usize,
    pub markets_selected: usize,
    pub generated: usize,
    pub reused: usize,
    /// Uncovered markets left for a later cycle by the generation budget
    pub deferred: usize,
    pub failures: Vec<MarketFailure>,
}

impl CycleReport {
    fn empty(started_at: DateTime<Utc>, status: CycleStatus) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            status,
            markets_fetched: 0,
            markets_selected: 0,
            generated: 0,
            reused: 0,
            deferred: 0,
            failures: Vec::new(),
        }
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: fetched={} selected={} generated={} reused={} deferred={} failed={} in {:?}",
            self.status,
            self.markets_fetched,
            self.markets_selected,
            self.generated,
            self.reused,
            self.deferred,
            self.failures.len(),
            self.duration
        )
    }
}

#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Completed(CycleReport),
    /// Another cycle held the Running state; this trigger did nothing
    AlreadyRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub resolved: usize,
    pub results_generated: usize,
    pub failures: usize,
}

/// Idle -> Running transition; dropping the guard returns to Idle whether
/// the cycle finished, failed or was cancelled.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// fetch -> score -> select -> generate -> publish, behind a single
/// Running flag shared by timer and manual triggers.
pub struct RefreshPipeline {
    source: Arc<dyn MarketSource>,
    scoring: ScoringEngine,
    orchestrator: Arc<ArticleOrchestrator>,
    board: ArticleBoard,
    settings: PipelineSettings,
    cycle_log: Option<Arc<CsvLogger>>,
    running: AtomicBool,
    resolving: AtomicBool,
    last_lookup: DashMap<String, Instant>,
}

impl RefreshPipeline {
    pub fn new(
        source: Arc<dyn MarketSource>,
        scoring: ScoringEngine,
        orchestrator: Arc<ArticleOrchestrator>,
        board: ArticleBoard,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            scoring,
            orchestrator,
            board,
            settings,
            cycle_log: None,
            running: AtomicBool::new(false),
            resolving: AtomicBool::new(false),
            last_lookup: DashMap::new(),
        }
    }

    pub fn with_cycle_log(mut self, logger: CsvLogger) -> Self {
        self.cycle_log = Some(Arc::new(logger));
        self
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Articles to serve, newest first. Unaffected by failed cycles.
    pub fn get_current_articles(&self) -> Vec<Article> {
        self.board.current()
    }

    /// Run one full cycle unless one is already running.
    pub async fn trigger_refresh(&self) -> RefreshOutcome {
        let _guard = match RunningGuard::try_acquire(&self.running) {
            Some(guard) => guard,
            None => {
                info!("Refresh already running, ignoring trigger");
                return RefreshOutcome::AlreadyRunning;
            }
        };

        let report = self.run_cycle().await;

        match report.status {
            CycleStatus::Success | CycleStatus::NoMarkets => info!("Refresh cycle {}", report),
            CycleStatus::PartialSuccess => warn!("Refresh cycle {}", report),
            CycleStatus::SourceUnavailable | CycleStatus::Failed => error!("Refresh cycle {}", report),
        }

        for failure in &report.failures {
            debug!("  {} failed: {}", failure.market_id, failure.error);
        }

        if let Some(logger) = &self.cycle_log {
            let logger = logger.clone();
            let row = report.clone();
            match tokio::task::spawn_blocking(move || logger.log_cycle(&row)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to write cycle log: {:#}", e),
                Err(e) => warn!("Cycle log task failed: {}", e),
            }
        }

        RefreshOutcome::Completed(report)
    }

    async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let clock = Instant::now();

        let markets = match self.fetch_markets().await {
            Ok(markets) => markets,
            Err(e) => {
                error!("{}; keeping previously published articles", e);
                let mut report = CycleReport::empty(started_at, CycleStatus::SourceUnavailable);
                report.duration = clock.elapsed();
                return report;
            }
        };
        let markets_fetched = markets.len();

        let scored = self.scoring.score_all(markets, started_at);
        let selected = select(scored, self.settings.max_markets_per_cycle);
        for market in &selected {
            let b = self.scoring.breakdown_at(market, started_at);
            debug!(
                "Selected {}: score {:.1} (volume {:.2}, spread {:.2}, open interest {:.2}, time {:.2})",
                market.id, b.total, b.volume, b.spread, b.open_interest, b.time_to_close
            );
        }

        let mut report = CycleReport::empty(started_at, CycleStatus::Success);
        report.markets_fetched = markets_fetched;
        report.markets_selected = selected.len();

        // Covered markets stay on the board; only uncovered ones spend the
        // generation budget
        let cached = join_all(selected.iter().map(|m| self.orchestrator.cached_article(m))).await;
        let mut produced = Vec::with_capacity(selected.len());
        let mut uncovered = Vec::new();
        for (market, article) in selected.into_iter().zip(cached) {
            match article {
                Some(article) => {
                    report.reused += 1;
                    produced.push(article);
                }
                None => uncovered.push(market),
            }
        }

        let budget = self.settings.max_articles_per_cycle;
        report.deferred = uncovered.len().saturating_sub(budget);
        uncovered.truncate(budget);

        let results = join_all(uncovered.iter().map(|m| self.write_article(m))).await;

        for (market, result) in uncovered.iter().zip(results) {
            match result {
                Ok(ensured) => {
                    match ensured.origin {
                        ArticleOrigin::Generated => report.generated += 1,
                        ArticleOrigin::Cached => report.reused += 1,
                    }
                    produced.push(ensured.article);
                }
                Err(e) => {
                    warn!("Skipping market {} this cycle: {}", market.id, e);
                    report.failures.push(MarketFailure {
                        market_id: market.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.status = if report.markets_selected == 0 {
            CycleStatus::NoMarkets
        } else if report.failures.is_empty() {
            CycleStatus::Success
        } else if produced.is_empty() {
            CycleStatus::Failed
        } else {
            CycleStatus::PartialSuccess
        };

        self.board.publish(produced).await;
        report.duration = clock.elapsed();
        report
    }

    /// Attach recent price movement, then generate (or reuse) the article.
    async fn write_article(&self, market: &Market) -> Result<EnsuredArticle, GenerationError> {
        let mut market = market.clone();
        market.price_change = self.recent_price_change(&market.id).await;
        self.orchestrator.ensure_article(&market).await
    }

    async fn recent_price_change(&self, id: &str) -> Option<f64> {
        match tokio::time::timeout(self.settings.source_timeout, self.source.get_price_history(id)).await {
            Ok(Ok(history)) => price_change(&history),
            Ok(Err(e)) => {
                debug!("No price history for {}: {}", id, e);
                None
            }
            Err(_) => {
                debug!("Price history for {} timed out", id);
                None
            }
        }
    }

    async fn fetch_markets(&self) -> Result<Vec<Market>, SourceError> {
        let timeout = self.settings.source_timeout;
        match tokio::time::timeout(timeout, self.source.fetch_markets(self.settings.status_filter)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Unavailable(format!("fetch timed out after {:?}", timeout))),
        }
    }

    /// Mark articles whose market has closed as resolved and write results
    /// articles for the ones that have settled. Returns `None` if a check is
    /// already in progress.
    pub async fn check_resolutions(&self) -> Option<ResolutionReport> {
        let _guard = RunningGuard::try_acquire(&self.resolving)?;

        let now = Utc::now();
        let mut due: Vec<Article> = self.board
            .current()
            .into_iter()
            .filter(|a| a.kind == ArticleKind::Analysis && a.close_time < now)
            .collect();

        // Least recently looked up first, so markets that never settle
        // cannot starve the ones that do
        self.last_lookup.retain(|id, _| due.iter().any(|a| &a.market_id == id));
        due.sort_by(|a, b| {
            let checked_a = self.last_lookup.get(&a.market_id).map(|t| *t);
            let checked_b = self.last_lookup.get(&b.market_id).map(|t| *t);
            checked_a
                .cmp(&checked_b)
                .then_with(|| a.close_time.cmp(&b.close_time))
                .then_with(|| a.market_id.cmp(&b.market_id))
        });

        let mut report = ResolutionReport::default();
        let mut superseded = Vec::new();
        let mut lookups = 0;

        for article in due {
            let mut replacement = match article.status {
                ArticleStatus::Active => {
                    info!("Marked article as resolved: {}", article.market_id);
                    report.resolved += 1;
                    Some(article.resolved())
                }
                ArticleStatus::Resolved => None,
            };

            if lookups < self.settings.max_results_per_cycle {
                lookups += 1;
                self.last_lookup.insert(article.market_id.clone(), Instant::now());
                if let Some(results) = self.results_for(&article, &mut report).await {
                    replacement = Some(results);
                }
            }

            superseded.extend(replacement);
        }

        self.board.publish(superseded).await;
        let purged = self.orchestrator.sweep_expired().await;
        info!(
            "Resolution check complete: {} resolved, {} results articles, {} failures, {} expired entries purged",
            report.resolved, report.results_generated, report.failures, purged
        );
        Some(report)
    }

    async fn results_for(&self, article: &Article, report: &mut ResolutionReport) -> Option<Article> {
        let timeout = self.settings.source_timeout;
        let market = match tokio::time::timeout(timeout, self.source.get_market(&article.market_id)).await {
            Ok(Ok(Some(market))) => market,
            Ok(Ok(None)) => {
                debug!("Market {} no longer listed", article.market_id);
                return None;
            }
            Ok(Err(e)) => {
                warn!("Could not fetch {} for resolution: {}", article.market_id, e);
                report.failures += 1;
                return None;
            }
            Err(_) => {
                warn!("Timed out fetching {} for resolution", article.market_id);
                report.failures += 1;
                return None;
            }
        };

        if market.result.is_none() {
            debug!("Market {} closed but not settled yet", market.id);
            return None;
        }

        match self.orchestrator.ensure_results_article(&market, Some(article)).await {
            Ok(ensured) => {
                if ensured.origin == ArticleOrigin::Generated {
                    report.results_generated += 1;
                }
                Some(ensured.article)
            }
            Err(e) => {
                warn!("Failed to generate results for {}: {}", market.id, e);
                report.failures += 1;
                None
            }
        }
    }
}

mod config;
mod data;
mod generation;
mod monitoring;
mod pipeline;
mod ranking;
#[cfg(test)]
mod testing;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use config::{Config, EnvConfig};
use data::cache::Cache;
use data::kalshi_api::KalshiApiClient;
use generation::orchestrator::ArticleOrchestrator;
use monitoring::logger::CsvLogger;
use pipeline::board::ArticleBoard;
use pipeline::refresh::{PipelineSettings, RefreshPipeline};
use pipeline::scheduler::RefreshScheduler;
use ranking::scoring::ScoringEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,prediction_pulse=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Prediction Pulse starting...");

    // Load configuration
    let config = Config::load("config.toml")?;
    let env_config = EnvConfig::load()?;

    tracing::info!("LLM provider: {}", env_config.llm_provider);
    tracing::info!("Market source: {}", env_config.kalshi_api_base);
    tracing::info!(
        "Refresh every {} min, up to {} articles per cycle",
        config.scheduler.refresh_interval_mins,
        config.generation.max_articles_per_cycle
    );

    let backend = data::open_cache_backend(&config.cache, &env_config.redis_url).await?;
    let cache = Cache::new(backend, config.cache.key_prefix.clone());

    let source = Arc::new(KalshiApiClient::new(env_config.kalshi_api_base.clone(), &config.source)?);
    let generator = generation::llm::generator_from_env(&env_config, &config.generation)?;
    let orchestrator = Arc::new(ArticleOrchestrator::new(
        generator,
        cache.clone(),
        &config.generation,
        config.cache.ttl(),
    ));
    let board = ArticleBoard::load(
        cache,
        config.system.max_board_articles,
        config.cache.index_ttl(),
    )
    .await;
    tracing::info!("Serving {} articles from previous runs", board.len());

    let mut pipeline = RefreshPipeline::new(
        source,
        ScoringEngine::new(config.scoring.clone()),
        orchestrator,
        board,
        PipelineSettings::from_config(&config)?,
    );
    if config.monitoring.csv_logging {
        pipeline = pipeline.with_cycle_log(CsvLogger::new(config.monitoring.csv_log_path.clone())?);
    }
    let pipeline = Arc::new(pipeline);

    let scheduler = RefreshScheduler::start(pipeline, &config.scheduler);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    scheduler.stop().await;

    Ok(())
}

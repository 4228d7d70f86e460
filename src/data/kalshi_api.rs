use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};
use crate::config::SourceConfig;
use crate::data::types::{Market, MarketResult, MarketStatus, PricePoint};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Market source unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view over an external prediction-market provider.
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Fetch normalized markets with the given status. Malformed records are
    /// skipped one by one; only a wholly unreachable provider is an error.
    async fn fetch_markets(&self, status: MarketStatus) -> Result<Vec<Market>, SourceError>;

    /// Fetch a single market by id, `None` if the provider does not know it.
    async fn get_market(&self, id: &str) -> Result<Option<Market>, SourceError>;

    /// Recent price history, newest first. Empty when the provider has none.
    async fn get_price_history(&self, id: &str) -> Result<Vec<PricePoint>, SourceError>;
}

pub struct KalshiApiClient {
    client: Client,
    base_url: String,
    page_limit: usize,
    max_pages: usize,
}

#[derive(Debug, Deserialize)]
struct KalshiMarket {
    ticker: String,
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    yes_sub_title: Option<String>,
    #[serde(default)]
    yes_bid: Option<f64>,
    #[serde(default)]
    last_price: Option<f64>,
    #[serde(default)]
    volume: Option<i64>,
    #[serde(default)]
    volume_24h: Option<i64>,
    #[serde(default)]
    open_interest: Option<i64>,
    close_time: String,
    status: String,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KalshiMarketsPage {
    #[serde(default)]
    markets: Vec<serde_json::Value>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KalshiMarketEnvelope {
    market: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct KalshiHistoryPage {
    #[serde(default)]
    history: Vec<serde_json::Value>,
}

const HISTORY_LIMIT: usize = 50;

impl KalshiApiClient {
    pub fn new(base_url: String, config: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .user_agent("PredictionPulse/0.1")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_limit: config.page_limit.max(1),
            max_pages: config.max_pages.max(1),
        })
    }

    async fn fetch_page(
        &self,
        status: MarketStatus,
        cursor: Option<&str>,
    ) -> Result<KalshiMarketsPage> {
        let url = format!("{}/markets", self.base_url);

        let mut query: Vec<(&str, String)> = vec![
            ("limit", self.page_limit.to_string()),
            ("status", status.as_str().to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let page = self.client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json::<KalshiMarketsPage>()
            .await?;

        Ok(page)
    }
}

#[async_trait]
impl MarketSource for KalshiApiClient {
    async fn fetch_markets(&self, status: MarketStatus) -> Result<Vec<Market>, SourceError> {
        let mut raw = Vec::new();
        let mut cursor: Option<String> = None;

        for page_no in 0..self.max_pages {
            let page = match self.fetch_page(status, cursor.as_deref()).await {
                Ok(page) => page,
                // A later page failing still leaves us with usable data
                Err(e) if page_no > 0 => {
                    warn!("Stopping pagination after page {}: {:#}", page_no, e);
                    break;
                }
                Err(e) => return Err(SourceError::Unavailable(format!("{:#}", e))),
            };

            debug!("Fetched page {} with {} raw markets", page_no, page.markets.len());
            raw.extend(page.markets);

            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        let (markets, skipped) = normalize_markets(raw);
        if skipped > 0 {
            warn!(
                "Partial source data: skipped {} malformed market records, kept {}",
                skipped,
                markets.len()
            );
        }

        Ok(markets)
    }

    async fn get_market(&self, id: &str) -> Result<Option<Market>, SourceError> {
        let url = format!("{}/markets/{}", self.base_url, id);

        let response = self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let envelope: KalshiMarketEnvelope = response
            .error_for_status()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        Ok(envelope.market.and_then(|raw| match convert_record(raw) {
            Ok(market) => Some(market),
            Err(e) => {
                warn!("Malformed record for market {}: {}", id, e);
                None
            }
        }))
    }

    async fn get_price_history(&self, id: &str) -> Result<Vec<PricePoint>, SourceError> {
        let url = format!("{}/markets/{}/history", self.base_url, id);

        let page: KalshiHistoryPage = self.client
            .get(&url)
            .query(&[("limit", HISTORY_LIMIT)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        Ok(parse_history(page.history))
    }
}

/// Keep the history entries that carry a usable price, in provider order.
fn parse_history(raw: Vec<serde_json::Value>) -> Vec<PricePoint> {
    raw.into_iter()
        .filter_map(|entry| serde_json::from_value::<PricePoint>(entry).ok())
        .filter(|point| (0.0..=100.0).contains(&point.yes_price))
        .collect()
}

/// Normalize raw provider records, returning the kept markets and the
/// number of records that were dropped.
pub fn normalize_markets(raw: Vec<serde_json::Value>) -> (Vec<Market>, usize) {
    let mut markets = Vec::with_capacity(raw.len());
    let mut skipped = 0;

    for record in raw {
        match convert_record(record) {
            Ok(market) => markets.push(market),
            Err(e) => {
                debug!("Skipping market record: {}", e);
                skipped += 1;
            }
        }
    }

    (markets, skipped)
}

/// Convert one Kalshi record to our internal Market type
fn convert_record(record: serde_json::Value) -> Result<Market> {
    let km: KalshiMarket = serde_json::from_value(record)?;

    if km.ticker.trim().is_empty() {
        return Err(anyhow!("empty ticker"));
    }
    if km.title.trim().is_empty() {
        return Err(anyhow!("market {} has no title", km.ticker));
    }

    let close_time = DateTime::parse_from_rfc3339(&km.close_time)
        .map_err(|e| anyhow!("market {} close_time: {}", km.ticker, e))?
        .with_timezone(&Utc);

    let status: MarketStatus = km.status.parse().map_err(|e: String| anyhow!(e))?;

    let count = |field: &str, value: Option<i64>| -> Result<u64> {
        match value {
            None => Ok(0),
            Some(v) if v < 0 => Err(anyhow!("market {} has negative {}", km.ticker, field)),
            Some(v) => Ok(v as u64),
        }
    };
    let volume = count("volume", km.volume)?;
    let volume_24h = count("volume_24h", km.volume_24h)?;
    let open_interest = count("open_interest", km.open_interest)?;

    // Prices are quoted in cents; a zero bid means nobody is bidding
    let probability = km.yes_bid
        .filter(|p| *p > 0.0)
        .or(km.last_price)
        .filter(|p| (0.0..=100.0).contains(p))
        .map(|cents| cents / 100.0)
        .unwrap_or(f64::NAN);

    let result = match km.result.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("yes") => Some(MarketResult::Yes),
        Some("no") => Some(MarketResult::No),
        _ => None,
    };

    Ok(Market {
        id: km.ticker,
        title: km.title,
        subtitle: km.subtitle.or(km.yes_sub_title).filter(|s| !s.trim().is_empty()),
        probability,
        volume,
        volume_24h,
        open_interest,
        close_time,
        status,
        result,
        price_change: None,
    })
}

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Settled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Settled => "settled",
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketStatus {
    type Err = String;

    /// Accepts the upstream lifecycle names as well as our own.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "active" | "initialized" => Ok(MarketStatus::Open),
            "closed" | "paused" => Ok(MarketStatus::Closed),
            "settled" | "determined" | "finalized" => Ok(MarketStatus::Settled),
            other => Err(format!("unknown market status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketResult {
    Yes,
    No,
}

impl fmt::Display for MarketResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketResult::Yes => f.write_str("YES"),
            MarketResult::No => f.write_str("NO"),
        }
    }
}

/// Normalized snapshot of one prediction market, taken once per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub title: String,
    pub subtitle: Option<String>,
    /// 0.0..=1.0, NaN when the source had no usable price
    pub probability: f64,
    pub volume: u64,
    pub volume_24h: u64,
    pub open_interest: u64,
    pub close_time: DateTime<Utc>,
    pub status: MarketStatus,
    pub result: Option<MarketResult>,
    /// Recent move in percentage points, filled in from price history
    /// just before an article is written
    #[serde(default)]
    pub price_change: Option<f64>,
}

impl Market {
    /// Probability in whole percent, or None when unknown.
    pub fn probability_pct(&self) -> Option<u32> {
        if self.probability.is_finite() {
            Some((self.probability.clamp(0.0, 1.0) * 100.0).round() as u32)
        } else {
            None
        }
    }

    /// Hash of the fields an article is written from.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.title.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(format!("{:?}", self.probability_pct()).as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.volume.to_le_bytes());
        hasher.update(self.open_interest.to_le_bytes());
        hasher.update(self.close_time.timestamp().to_le_bytes());
        hasher.update(self.status.as_str().as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

/// One entry of a market's price history, newest first as the provider
/// returns it. Prices are in cents.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PricePoint {
    pub yes_price: f64,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Change between the newest and oldest point, `None` with fewer than two.
pub fn price_change(history: &[PricePoint]) -> Option<f64> {
    match (history.first(), history.last()) {
        (Some(recent), Some(older)) if history.len() >= 2 => Some(recent.yes_price - older.yes_price),
        _ => None,
    }
}

/// A market with its interestingness score for the current cycle only.
#[derive(Debug, Clone)]
pub struct ScoredMarket {
    pub market: Market,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleKind {
    Analysis,
    Results,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Active,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub kind: ArticleKind,
    pub market_id: String,
    pub market_title: String,
    pub title: String,
    pub teaser: String,
    pub body: String,
    pub probability_pct: Option<u32>,
    pub close_time: DateTime<Utc>,
    pub volume: u64,
    pub generated_at: DateTime<Utc>,
    pub word_count: usize,
    pub within_length_band: bool,
    pub status: ArticleStatus,
    pub outcome: Option<MarketResult>,
    pub original_article_id: Option<String>,
    pub fingerprint: String,
}

impl Article {
    /// Copy of this article marked resolved; the original value is left intact.
    pub fn resolved(&self) -> Article {
        Article {
            status: ArticleStatus::Resolved,
            ..self.clone()
        }
    }
}

/// Short id derived from the market and the hour of generation.
pub fn article_id(market_id: &str, generated_at: DateTime<Utc>, kind: ArticleKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}-{}", market_id, generated_at.format("%Y%m%d%H")).as_bytes());
    let id = hex::encode(&hasher.finalize()[..6]);
    match kind {
        ArticleKind::Analysis => id,
        ArticleKind::Results => format!("{}-results", id),
    }
}

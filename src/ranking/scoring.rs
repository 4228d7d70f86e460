use chrono::{DateTime, Utc};
use crate::config::ScoringConfig;
use crate::data::types::{Market, MarketStatus, ScoredMarket};

/// Volume at which the volume component reaches 1.0
const VOLUME_REFERENCE: f64 = 1_000_000.0;
/// Open interest at which the open-interest component reaches 1.0
const OPEN_INTEREST_REFERENCE: f64 = 100_000.0;

/// Half-width of the "genuinely uncertain" band around 50% (20%..80%).
const UNCERTAIN_BAND: f64 = 0.3;

const HOURS_TOO_SOON: f64 = 2.0;
const HOURS_PLATEAU_START: f64 = 24.0;
const HOURS_PLATEAU_END: f64 = 14.0 * 24.0;

/// Per-component breakdown of a score, kept for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub volume: f64,
    pub spread: f64,
    pub open_interest: f64,
    pub time_to_close: f64,
    pub total: f64,
}

pub struct ScoringEngine {
    weights: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(weights: ScoringConfig) -> Self {
        Self { weights }
    }

    #[cfg(test)]
    pub fn score(&self, market: &Market) -> f64 {
        self.score_at(market, Utc::now())
    }

    /// Score against an explicit clock. Pure function of its inputs.
    pub fn score_at(&self, market: &Market, now: DateTime<Utc>) -> f64 {
        self.breakdown_at(market, now).total
    }

    pub fn breakdown_at(&self, market: &Market, now: DateTime<Utc>) -> ScoreBreakdown {
        if market.status != MarketStatus::Open {
            return ScoreBreakdown {
                volume: 0.0,
                spread: 0.0,
                open_interest: 0.0,
                time_to_close: 0.0,
                total: 0.0,
            };
        }

        let hours_to_close = (market.close_time - now).num_seconds() as f64 / 3600.0;

        let volume = log_component(market.volume, VOLUME_REFERENCE);
        let spread = spread_component(market.probability);
        let open_interest = log_component(market.open_interest, OPEN_INTEREST_REFERENCE);
        let time_to_close = time_to_close_component(hours_to_close);

        let w = &self.weights;
        let total = w.volume_weight * volume
            + w.spread_weight * spread
            + w.open_interest_weight * open_interest
            + w.time_to_close_weight * time_to_close;

        ScoreBreakdown {
            volume,
            spread,
            open_interest,
            time_to_close,
            total: if total.is_finite() { total } else { 0.0 },
        }
    }

    /// Score every open market; closed and settled markets are dropped here.
    pub fn score_all(&self, markets: Vec<Market>, now: DateTime<Utc>) -> Vec<ScoredMarket> {
        markets
            .into_iter()
            .filter(|m| m.status == MarketStatus::Open)
            .map(|market| {
                let score = self.score_at(&market, now);
                ScoredMarket { market, score }
            })
            .collect()
    }
}

/// ln(1+x) normalized so that `reference` maps to 1.0. Zero maps to 0.
pub fn log_component(value: u64, reference: f64) -> f64 {
    (value as f64).ln_1p() / reference.ln_1p()
}

/// 1.0 at p = 0.5, 0.5 at the 20%/80% edges, then a cubic fall to 0 at
/// certainty. Unknown or degenerate probabilities contribute nothing.
pub fn spread_component(probability: f64) -> f64 {
    if !probability.is_finite() || probability <= 0.0 || probability >= 1.0 {
        return 0.0;
    }

    let distance = (probability - 0.5).abs();
    if distance <= UNCERTAIN_BAND {
        1.0 - 0.5 * (distance / UNCERTAIN_BAND).powi(2)
    } else {
        let outer = 0.5 - UNCERTAIN_BAND;
        0.5 * ((0.5 - distance) / outer).powi(3)
    }
}

/// Markets closing within a day ramp up, one day to two weeks is the sweet
/// spot, and anything further out decays with distance.
pub fn time_to_close_component(hours: f64) -> f64 {
    if !hours.is_finite() || hours <= 0.0 {
        0.0
    } else if hours < HOURS_TOO_SOON {
        0.15 * hours
    } else if hours < HOURS_PLATEAU_START {
        0.3 + 0.7 * (hours - HOURS_TOO_SOON) / (HOURS_PLATEAU_START - HOURS_TOO_SOON)
    } else if hours <= HOURS_PLATEAU_END {
        1.0
    } else {
        HOURS_PLATEAU_END / hours
    }
}

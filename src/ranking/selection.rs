use std::cmp::Ordering;
use crate::data::types::{Market, ScoredMarket};

/// Highest scores first, ties broken by market id so the order is stable
/// across cycles. Never errors; a short pool is returned whole.
pub fn select(mut scored: Vec<ScoredMarket>, limit: usize) -> Vec<Market> {
    scored.sort_by(compare);
    scored.truncate(limit);
    scored.into_iter().map(|s| s.market).collect()
}

fn compare(a: &ScoredMarket, b: &ScoredMarket) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.market.id.cmp(&b.market.id))
}

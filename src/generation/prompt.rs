use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use crate::data::types::{Article, Market, MarketResult};
use crate::generation::llm::GenerationError;

pub const ANALYSIS_STYLE: &str = "You write sharp, readable analysis of prediction markets for a finance audience.
Lead with the numbers, then the reasoning. Opinions are allowed but must be argued, not asserted.
Be skeptical of the crowd and say where the price may be wrong.
Vary sentence length. Use first person sparingly.
No bullet points, no numbered lists, no filler phrases such as \"it's important to note\" or \"in conclusion\".
The result should read like a good markets column, not a press release and not a podcast transcript.";

pub const RESULTS_STYLE: &str = "You write short post-mortems on prediction markets that have just resolved.
Open with the outcome. Judge whether the market priced it well and what signals were missed or caught.
Be honest about hindsight. No bullet points, no numbered lists, no filler phrases.";

/// Word band the prompt asks for. Enforcement happens after generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordBand {
    pub min: usize,
    pub max: usize,
}

impl WordBand {
    pub fn contains(&self, words: usize) -> bool {
        (self.min..=self.max).contains(&words)
    }
}

pub const RESULTS_BAND: WordBand = WordBand { min: 350, max: 500 };

/// The article fields returned by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratedText {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub teaser: String,
    #[serde(default)]
    pub content: String,
}

fn probability_line(market: &Market) -> String {
    match market.probability_pct() {
        Some(pct) => format!("{}% chance of YES", pct),
        None => "no reliable price".to_string(),
    }
}

/// Reply wrapped in a markdown code fence, optionally language-tagged.
static CODE_FENCE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*(.*?)\s*```$"));

pub fn format_price_movement(change: Option<f64>) -> String {
    match change {
        None => "No recent data available".to_string(),
        Some(c) if c.round() == 0.0 => "unchanged recently".to_string(),
        Some(c) => {
            let direction = if c > 0.0 { "up" } else { "down" };
            format!("{} {} percentage points recently", direction, c.abs().round() as i64)
        }
    }
}

fn close_line(market: &Market, now: DateTime<Utc>) -> (String, String) {
    let readable = market.close_time.format("%B %d, %Y at %I:%M %p UTC").to_string();
    let days = (market.close_time - now).num_days();
    let days = if days < 0 { "already closed".to_string() } else { days.to_string() };
    (readable, days)
}

/// Analysis prompt. Depends only on the market, the band and `now`.
pub fn build_article_prompt(market: &Market, band: WordBand, now: DateTime<Utc>) -> String {
    let (close_readable, days_until_close) = close_line(market, now);

    format!(
        "Write an article about this prediction market. Target length: {min}-{max} words.

Market details:
- Title: {title}
- Current probability: {probability}
- Volume: {volume} contracts traded
- 24h volume: {volume_24h} contracts
- Open interest: {open_interest}
- Recent price movement: {movement}
- Market closes: {close}
- Days until close: {days}
- Description: {subtitle}

Cover, woven into the narrative rather than as a checklist: what the odds signal, whether the price looks
too high or too low and why, upcoming catalysts, underweighted risks, and your own read.
Give it a compelling but credible headline.

Respond with JSON only, in exactly this shape:
{{\"title\": \"...\", \"teaser\": \"one or two sentence hook\", \"content\": \"full article body\"}}",
        min = band.min,
        max = band.max,
        title = market.title,
        probability = probability_line(market),
        volume = market.volume,
        volume_24h = market.volume_24h,
        open_interest = market.open_interest,
        movement = format_price_movement(market.price_change),
        close = close_readable,
        days = days_until_close,
        subtitle = market.subtitle.as_deref().unwrap_or(&market.title),
    )
}

/// Results prompt for a settled market, referencing the earlier analysis if any.
pub fn build_results_prompt(
    market: &Market,
    outcome: MarketResult,
    original: Option<&Article>,
    now: DateTime<Utc>,
) -> String {
    let (close_readable, _) = close_line(market, now);
    let final_probability = probability_line(market);
    let original_probability = original
        .and_then(|a| a.probability_pct)
        .map(|p| format!("{}%", p))
        .unwrap_or_else(|| "not covered before".to_string());

    format!(
        "Write a results article about this prediction market, which has resolved. Target length: {min}-{max} words.

Market details:
- Title: {title}
- Outcome: resolved {outcome}
- Final price before resolution: {final_probability}
- Price when we first covered it: {original_probability}
- Total volume: {volume} contracts
- Market closed: {close}
- Description: {subtitle}

Give it a headline that signals the outcome.

Respond with JSON only, in exactly this shape:
{{\"title\": \"...\", \"teaser\": \"one or two sentence summary of the outcome\", \"content\": \"full article body\"}}",
        min = RESULTS_BAND.min,
        max = RESULTS_BAND.max,
        title = market.title,
        outcome = outcome,
        final_probability = final_probability,
        original_probability = original_probability,
        volume = market.volume,
        close = close_readable,
        subtitle = market.subtitle.as_deref().unwrap_or(&market.title),
    )
}

/// Parse the model reply, tolerating a markdown code fence around the JSON.
/// Empty replies and replies without article text are failures.
pub fn parse_generated(raw: &str) -> Result<GeneratedText, GenerationError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(GenerationError::Empty);
    }

    let fence = (*CODE_FENCE)
        .as_ref()
        .map_err(|e| GenerationError::Malformed(e.to_string()))?;
    let json = match fence.captures(text) {
        Some(cap) => cap.get(1).map(|m| m.as_str()).unwrap_or(""),
        None => text,
    };

    let generated: GeneratedText = serde_json::from_str(json)
        .map_err(|e| GenerationError::Malformed(e.to_string()))?;

    if generated.content.trim().is_empty() {
        return Err(GenerationError::Empty);
    }

    Ok(GeneratedText {
        title: if generated.title.trim().is_empty() {
            "Untitled".to_string()
        } else {
            generated.title.trim().to_string()
        },
        teaser: generated.teaser.trim().to_string(),
        content: generated.content.trim().to_string(),
    })
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

//! Core domain model for the signal mail pipeline: stored records, views and run summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sigmail-core";

/// Offset between a signal's date and its entry date.
pub const ENTRY_DELAY_MS: i64 = 86_400_000;

pub fn entry_date_for(signal_date_ms: i64) -> i64 {
    signal_date_ms.saturating_add(ENTRY_DELAY_MS)
}

pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Minimally processed thread payload written by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLanding {
    pub thread_key: String,
    pub content: String,
    pub landed_at: DateTime<Utc>,
}

/// One normalized row per message, fully overwritten on re-enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullRecord {
    pub message_id: String,
    pub thread_key: String,
    pub subject: String,
    pub from_address: String,
    pub to_address: String,
    pub date_ms: i64,
    pub snippet: String,
    pub body_plain: String,
    pub body_html: String,
    pub labels: Vec<String>,
}

impl FullRecord {
    /// Plain text when the message carried any, otherwise the HTML body.
    pub fn body(&self) -> &str {
        if self.body_plain.trim().is_empty() {
            &self.body_html
        } else {
            &self.body_plain
        }
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.date_ms)
    }

    pub fn is_extraction_candidate(&self) -> bool {
        body_mentions_signal_keywords(self.body())
    }
}

pub const CANDIDATE_KEYWORDS: [&str; 3] = ["buy", "stop", "target"];

pub fn body_mentions_signal_keywords(body: &str) -> bool {
    let lower = body.to_lowercase();
    CANDIDATE_KEYWORDS.iter().all(|kw| lower.contains(kw))
}

/// Read-only projection of a full record selected for extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionCandidate {
    pub message_id: String,
    pub date_ms: i64,
    pub body: String,
}

impl From<&FullRecord> for ExtractionCandidate {
    fn from(record: &FullRecord) -> Self {
        Self {
            message_id: record.message_id.clone(),
            date_ms: record.date_ms,
            body: record.body().to_string(),
        }
    }
}

/// Outcome of one extraction attempt. Failed attempts keep null fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingExtraction {
    pub message_id: String,
    pub ticker: Option<String>,
    pub signal_date: i64,
    pub entry_date: i64,
    pub buy_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub raw_text: String,
    pub cleaned_text: String,
}

impl StagingExtraction {
    pub fn empty(message_id: impl Into<String>, signal_date: i64) -> Self {
        Self {
            message_id: message_id.into(),
            ticker: None,
            signal_date,
            entry_date: entry_date_for(signal_date),
            buy_price: None,
            stop_price: None,
            target_price: None,
            raw_text: String::new(),
            cleaned_text: String::new(),
        }
    }

    /// Passed the extraction gate: a ticker and a buy price.
    pub fn has_signal(&self) -> bool {
        self.ticker.as_deref().is_some_and(|t| !t.is_empty()) && is_positive(self.buy_price)
    }

    pub fn is_clean(&self) -> bool {
        CleanSignal::try_from(self).is_ok()
    }
}

fn is_positive(price: Option<f64>) -> bool {
    price.is_some_and(|p| p.is_finite() && p > 0.0)
}

/// Staging row eligible for promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanSignal {
    pub message_id: String,
    pub ticker: String,
    pub signal_date: i64,
    pub entry_date: i64,
    pub buy_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotClean {
    MissingTicker,
    MissingBuy,
    MissingStop,
    MissingTarget,
}

impl TryFrom<&StagingExtraction> for CleanSignal {
    type Error = NotClean;

    fn try_from(row: &StagingExtraction) -> Result<Self, Self::Error> {
        let ticker = row
            .ticker
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(NotClean::MissingTicker)?;
        let positive = |price: Option<f64>, missing: NotClean| {
            price.filter(|p| p.is_finite() && *p > 0.0).ok_or(missing)
        };
        Ok(Self {
            message_id: row.message_id.clone(),
            ticker: ticker.to_string(),
            signal_date: row.signal_date,
            entry_date: row.entry_date,
            buy_price: positive(row.buy_price, NotClean::MissingBuy)?,
            stop_price: positive(row.stop_price, NotClean::MissingStop)?,
            target_price: positive(row.target_price, NotClean::MissingTarget)?,
        })
    }
}

/// Canonical deduplicated signal consumed by backtesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSignal {
    pub message_id: String,
    pub ticker: String,
    pub signal_date: i64,
    pub entry_date: i64,
    pub buy_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub promoted_at: DateTime<Utc>,
}

impl FinalSignal {
    pub fn from_clean(signal: &CleanSignal, promoted_at: DateTime<Utc>) -> Self {
        Self {
            message_id: signal.message_id.clone(),
            ticker: signal.ticker.clone(),
            signal_date: signal.signal_date,
            entry_date: signal.entry_date,
            buy_price: signal.buy_price,
            stop_price: signal.stop_price,
            target_price: signal.target_price,
            promoted_at,
        }
    }
}

/// Furthest point a message has reached across the stages.
///
/// `Listed` only exists while an ingestion run holds the id in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStage {
    Listed,
    Landed,
    Enriched,
    ExtractedEmpty,
    ExtractedSignal,
    DroppedDuplicateDate,
    Promoted,
}

impl MessageStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Listed => "listed",
            Self::Landed => "landed",
            Self::Enriched => "enriched",
            Self::ExtractedEmpty => "extracted_empty",
            Self::ExtractedSignal => "extracted_signal",
            Self::DroppedDuplicateDate => "dropped_duplicate_date",
            Self::Promoted => "promoted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingestion,
    Enrichment,
    Extraction,
    Promotion,
    DateRepair,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Enrichment => "enrichment",
            Self::Extraction => "extraction",
            Self::Promotion => "promotion",
            Self::DateRepair => "date_repair",
        }
    }
}

/// Aggregate result of one stage run. Per-item failures live here, not in errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Non-error outcome counters such as `signal`, `empty` or `duplicate_date`.
    pub outcomes: BTreeMap<String, usize>,
    pub error_samples: Vec<String>,
}

impl StageSummary {
    pub fn outcome(&self, name: &str) -> usize {
        self.outcomes.get(name).copied().unwrap_or(0)
    }

    pub fn is_clean_run(&self) -> bool {
        self.failed == 0
    }
}

/// Row counts across all four stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub raw_landing: u64,
    pub full_records: u64,
    pub staging_extractions: u64,
    pub clean_signals: u64,
    pub final_signals: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging(ticker: Option<&str>, buy: Option<f64>, stop: Option<f64>, target: Option<f64>) -> StagingExtraction {
        StagingExtraction {
            ticker: ticker.map(str::to_string),
            buy_price: buy,
            stop_price: stop,
            target_price: target,
            ..StagingExtraction::empty("m1", 1_704_844_800_000)
        }
    }

    #[test]
    fn entry_date_is_one_day_after_signal_date() {
        let row = StagingExtraction::empty("m1", 1_704_844_800_000);
        assert_eq!(row.entry_date, 1_704_931_200_000);
    }

    #[test]
    fn clean_requires_ticker_and_all_three_positive_prices() {
        assert!(staging(Some("WDG"), Some(50.0), Some(45.0), Some(65.0)).is_clean());
        assert_eq!(
            CleanSignal::try_from(&staging(Some(""), Some(12.5), Some(11.0), Some(14.0))),
            Err(NotClean::MissingTicker)
        );
        assert_eq!(
            CleanSignal::try_from(&staging(Some("ACME"), Some(0.0), Some(11.0), Some(14.0))),
            Err(NotClean::MissingBuy)
        );
        assert_eq!(
            CleanSignal::try_from(&staging(Some("ACME"), Some(12.5), None, Some(14.0))),
            Err(NotClean::MissingStop)
        );
    }

    #[test]
    fn signal_gate_only_needs_ticker_and_buy() {
        assert!(staging(Some("ACME"), Some(12.5), None, None).has_signal());
        assert!(!staging(Some("ACME"), None, Some(1.0), Some(2.0)).has_signal());
        assert!(!staging(None, Some(12.5), None, None).has_signal());
    }

    #[test]
    fn body_prefers_plain_text() {
        let mut record = FullRecord {
            message_id: "m1".into(),
            thread_key: "t1".into(),
            subject: String::new(),
            from_address: String::new(),
            to_address: String::new(),
            date_ms: 0,
            snippet: String::new(),
            body_plain: "Buy ACME, stop 9, target 12".into(),
            body_html: "<p>other</p>".into(),
            labels: vec![],
        };
        assert_eq!(record.body(), "Buy ACME, stop 9, target 12");
        assert!(record.is_extraction_candidate());

        record.body_plain = "  ".into();
        assert_eq!(record.body(), "<p>other</p>");
        assert!(!record.is_extraction_candidate());
    }

    #[test]
    fn message_stage_serializes_snake_case() {
        let json = serde_json::to_string(&MessageStage::DroppedDuplicateDate).expect("serialize");
        assert_eq!(json, "\"dropped_duplicate_date\"");
        assert!(MessageStage::Landed < MessageStage::Promoted);
    }
}

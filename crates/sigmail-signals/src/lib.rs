//! Rule-based signal extraction: pre-clean a message body, then run the ticker and price
//! cascades over it. Extraction is a pure function of the body and the compiled rules.

pub mod clean;
pub mod rules;

use serde::Serialize;
use sigmail_core::{ExtractionCandidate, StagingExtraction};
use tracing::debug;

pub use rules::{first_match, CompiledRules, PriceRules, RuleError, RuleSet, TickerRules};

pub const CRATE_NAME: &str = "sigmail-signals";

pub const DEFAULT_HEAD_CHARS: usize = 1000;
pub const DEFAULT_KEYWORD_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Only this many leading characters of the body are examined. `None` reads it all.
    pub head_chars: Option<usize>,
    /// Maximum distance between a price keyword and its number. `None` is unbounded.
    pub keyword_window: Option<usize>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            head_chars: Some(DEFAULT_HEAD_CHARS),
            keyword_window: Some(DEFAULT_KEYWORD_WINDOW),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickerTier {
    Exchange,
    Proximity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickerMatch {
    pub symbol: String,
    pub tier: TickerTier,
    pub rule_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub raw_text: String,
    pub cleaned_text: String,
    pub ticker: Option<TickerMatch>,
    pub buy: Option<f64>,
    pub stop: Option<f64>,
    pub target: Option<f64>,
}

impl Extraction {
    pub fn is_signal(&self) -> bool {
        self.ticker.is_some() && self.buy.is_some()
    }

    /// Staging row for this attempt. A miss keeps the texts and nulls every field.
    pub fn into_staging(self, message_id: impl Into<String>, signal_date: i64) -> StagingExtraction {
        let is_signal = self.is_signal();
        let mut row = StagingExtraction::empty(message_id, signal_date);
        row.raw_text = self.raw_text;
        row.cleaned_text = self.cleaned_text;
        if is_signal {
            row.ticker = self.ticker.map(|t| t.symbol);
            row.buy_price = self.buy;
            row.stop_price = self.stop;
            row.target_price = self.target;
        }
        row
    }
}

#[derive(Debug, Clone)]
pub struct SignalExtractor {
    rules: CompiledRules,
    config: ExtractorConfig,
}

impl SignalExtractor {
    pub fn new(rules: &RuleSet, config: ExtractorConfig) -> Result<Self, RuleError> {
        Ok(Self {
            rules: rules.compile(config.keyword_window)?,
            config,
        })
    }

    pub fn with_defaults() -> Result<Self, RuleError> {
        Self::new(&RuleSet::default(), ExtractorConfig::default())
    }

    pub fn config(&self) -> ExtractorConfig {
        self.config
    }

    pub fn extract(&self, body: &str) -> Extraction {
        let (raw_text, cleaned_text) = clean::pre_clean(body, self.config.head_chars);
        let ticker = self.ticker(&cleaned_text);

        let lower = cleaned_text.to_lowercase();
        let buy = price(&self.rules.buy, &lower, "buy");
        let stop = price(&self.rules.stop, &lower, "stop");
        let target = price(&self.rules.target, &lower, "target");

        Extraction {
            raw_text,
            cleaned_text,
            ticker,
            buy,
            stop,
            target,
        }
    }

    pub fn extract_candidate(&self, candidate: &ExtractionCandidate) -> StagingExtraction {
        let extraction = self.extract(&candidate.body);
        if !extraction.is_signal() {
            debug!(
                message_id = %candidate.message_id,
                ticker = extraction.ticker.is_some(),
                buy = extraction.buy.is_some(),
                "no signal in candidate"
            );
        }
        extraction.into_staging(candidate.message_id.clone(), candidate.date_ms)
    }

    fn ticker(&self, text: &str) -> Option<TickerMatch> {
        let tiers = [
            (TickerTier::Exchange, &self.rules.exchange),
            (TickerTier::Proximity, &self.rules.proximity),
        ];
        tiers.into_iter().find_map(|(tier, patterns)| {
            let (rule_index, symbol) = first_match(patterns, text, |c| self.rules.accept_ticker(c))?;
            debug!(%symbol, ?tier, rule_index, "ticker matched");
            Some(TickerMatch { symbol, tier, rule_index })
        })
    }
}

fn price(patterns: &[regex::Regex], text: &str, kind: &'static str) -> Option<f64> {
    let (rule_index, value) = first_match(patterns, text, |c| {
        c.parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0)
    })?;
    debug!(kind, rule_index, value, "price matched");
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn extractor() -> SignalExtractor {
        SignalExtractor::with_defaults().expect("default rules compile")
    }

    #[test]
    fn exchange_ticker_beats_proximity_ticker() {
        let got = extractor().extract("Acme Corp (NASDAQ: ACME) — buy XYZ at 10");
        let ticker = got.ticker.expect("ticker");
        assert_eq!(ticker.symbol, "ACME");
        assert_eq!(ticker.tier, TickerTier::Exchange);
        assert_eq!(got.buy, Some(10.0));
    }

    #[test]
    fn proximity_rules_skip_excluded_words() {
        let got = extractor().extract("THE BUY XYZ now");
        let ticker = got.ticker.expect("ticker");
        assert_eq!(ticker.symbol, "XYZ");
        assert_eq!(ticker.tier, TickerTier::Proximity);
        assert_eq!(ticker.rule_index, 1);
    }

    #[test]
    fn dollar_prices_parse_as_decimals() {
        let got = extractor().extract("Buy at $12.50, stop-loss: $11.75 and take profit @ 15");
        assert_eq!(got.buy, Some(12.5));
        assert_eq!(got.stop, Some(11.75));
        assert_eq!(got.target, Some(15.0));
    }

    #[test]
    fn buy_under_depends_on_the_rule_set() {
        assert_eq!(extractor().extract("ACME: buy under 8").buy, Some(8.0));

        // Strict rules only know "buy [at] N"; the "under" phrasing is a known miss.
        let strict = RuleSet::from_yaml_str(
            r#"
prices:
  buy:
    - 'buy\s+(?:at\s+)?\$?(\d+\.?\d*)'
"#,
        )
        .expect("yaml");
        let strict = SignalExtractor::new(&strict, ExtractorConfig::default()).expect("compile");
        assert_eq!(strict.extract("ACME: buy under 8").buy, None);
        assert_eq!(strict.extract("ACME: buy at 8").buy, Some(8.0));
    }

    #[test]
    fn validation_requires_ticker_and_buy_price() {
        let no_buy = extractor().extract("(NASDAQ: ACME) stop 9 target 12");
        assert!(!no_buy.is_signal());
        let row = no_buy.into_staging("m1", 1_000);
        assert_eq!(row.ticker, None);
        assert_eq!(row.stop_price, None);
        assert!(!row.has_signal());
        assert!(row.cleaned_text.contains("ACME"));

        let no_ticker = extractor().extract("please buy at $12.50 stop 11 target 14");
        assert_eq!(no_ticker.buy, Some(12.5));
        assert!(no_ticker.ticker.is_none());
        assert!(!no_ticker.into_staging("m2", 1_000).is_clean());
    }

    #[test]
    fn widget_signal_end_to_end() {
        let signal_date = 1_704_844_800_000; // 2024-01-10T00:00:00Z
        let candidate = ExtractionCandidate {
            message_id: "wdg-1".into(),
            date_ms: signal_date,
            body: "<p>Widget Inc (NYSE: WDG)</p><p>Buy at 50 Stop 45 Target 65</p>".into(),
        };
        let row = extractor().extract_candidate(&candidate);
        assert_eq!(row.ticker.as_deref(), Some("WDG"));
        assert_eq!(row.buy_price, Some(50.0));
        assert_eq!(row.stop_price, Some(45.0));
        assert_eq!(row.target_price, Some(65.0));
        assert_eq!(row.signal_date, signal_date);
        assert_eq!(row.entry_date, 1_704_931_200_000);
        assert_eq!(row.cleaned_text, "Widget Inc (NYSE: WDG) Buy at 50 Stop 45 Target 65");
        assert!(row.is_clean());
    }

    #[test]
    fn keyword_window_bounds_the_price_gap() {
        let body = format!("(NYSE: WDG) buy {}at 50", "x ".repeat(80));
        assert_eq!(extractor().extract(&body).buy, None);

        let config = ExtractorConfig { keyword_window: None, ..ExtractorConfig::default() };
        let unbounded = SignalExtractor::new(&RuleSet::default(), config).expect("compile");
        assert_eq!(unbounded.extract(&body).buy, Some(50.0));
    }

    #[test]
    fn only_the_head_of_the_body_is_examined() {
        let body = format!("(NYSE: WDG) {} buy at 50", "filler ".repeat(200));
        let got = extractor().extract(&body);
        assert_eq!(got.raw_text.chars().count(), DEFAULT_HEAD_CHARS);
        assert_eq!(got.buy, None);

        let config = ExtractorConfig { head_chars: None, ..ExtractorConfig::default() };
        let whole = SignalExtractor::new(&RuleSet::default(), config).expect("compile");
        assert_eq!(whole.extract(&body).buy, Some(50.0));
    }

    #[test]
    fn bundled_rules_file_compiles() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/signals.yaml");
        let rules = RuleSet::load(path).expect("bundled rules");
        let extractor = SignalExtractor::new(&rules, ExtractorConfig::default()).expect("compile");
        let got = extractor.extract("Omega Fund (AMEX: OMG) buy under 7.5 stop 7 target 9");
        assert_eq!(got.ticker.map(|t| t.symbol).as_deref(), Some("OMG"));
        assert_eq!(got.buy, Some(7.5));
        assert_eq!(got.stop, Some(7.0));
    }

    #[test]
    fn rules_load_from_yaml_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "ticker:\n  exclusions: [WDG]\n").expect("write rules");

        let rules = RuleSet::load(&path).expect("load");
        let custom = SignalExtractor::new(&rules, ExtractorConfig::default()).expect("compile");
        let got = custom.extract("Widget Inc (NYSE: WDG) Buy at 50");
        assert!(got.ticker.is_none());

        assert!(matches!(RuleSet::load(dir.path().join("missing.yaml")), Err(RuleError::Io { .. })));
    }
}

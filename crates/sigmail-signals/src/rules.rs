//! Extraction rules as data. Every cascade is an ordered pattern list evaluated first-match-wins.
//!
//! Price patterns may contain `{gap}`, the stretch of text allowed between a keyword and
//! its number. It compiles to `.{0,N}?` for a keyword window of `N`, or `.*?` when unbounded.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const GAP_PLACEHOLDER: &str = "{gap}";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading rules file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rules: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid {cascade} pattern {pattern:?}: {source}")]
    Pattern {
        cascade: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{cascade} pattern {pattern:?} has no capture group")]
    MissingCapture { cascade: &'static str, pattern: String },
    #[error("ticker length bounds {min}..={max} are invalid")]
    TickerBounds { min: usize, max: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub ticker: TickerRules,
    #[serde(default)]
    pub prices: PriceRules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerRules {
    /// Exchange-qualified forms, run before any proximity rule.
    #[serde(default = "default_exchange")]
    pub exchange: Vec<String>,
    #[serde(default = "default_proximity")]
    pub proximity: Vec<String>,
    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<String>,
    #[serde(default = "default_min_len")]
    pub min_len: usize,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

impl Default for TickerRules {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            proximity: default_proximity(),
            exclusions: default_exclusions(),
            min_len: default_min_len(),
            max_len: default_max_len(),
        }
    }
}

/// Run over lowercased text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRules {
    #[serde(default = "default_buy")]
    pub buy: Vec<String>,
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,
    #[serde(default = "default_target")]
    pub target: Vec<String>,
}

impl Default for PriceRules {
    fn default() -> Self {
        Self {
            buy: default_buy(),
            stop: default_stop(),
            target: default_target(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_exchange() -> Vec<String> {
    strings(&[
        r"\(\s*NASDAQ:\s*([A-Z]{2,5})\s*\)",
        r"\(\s*NYSE:\s*([A-Z]{2,5})\s*\)",
        r"NASDAQ:\s*([A-Z]{2,5})\b",
        r"NYSE:\s*([A-Z]{2,5})\b",
    ])
}

fn default_proximity() -> Vec<String> {
    strings(&[
        r"\b([A-Z]{2,5})\s*(?:buy|BUY)",
        r"(?:buy|BUY)\s*([A-Z]{2,5})\b",
        r"(?:symbol|ticker|stock)[:=]?\s*([A-Z]{2,5})\b",
        r"\b([A-Z]{2,5})\s+at\s+\$?\d+",
        r"\b([A-Z]{2,5})\s*[-:]\s*\$?\d+",
    ])
}

fn default_exclusions() -> Vec<String> {
    strings(&[
        "BUY", "SELL", "STOP", "TARGET", "PRICE", "ENTRY", "EXIT", "LOSS", "PROFIT", "TAKE", "AT",
        "TO", "FROM", "AND", "OR", "THE",
    ])
}

fn default_min_len() -> usize {
    2
}

fn default_max_len() -> usize {
    5
}

fn default_buy() -> Vec<String> {
    strings(&[
        r"buy{gap}(?:at|@|price|:)?\s*\$?(\d+\.?\d*)",
        r"entry{gap}(?:at|@|price|:)?\s*\$?(\d+\.?\d*)",
        r"buy\s+(?:at\s+)?\$?(\d+\.?\d*)",
    ])
}

fn default_stop() -> Vec<String> {
    strings(&[
        r"(?:stop|stop[-\s]?loss){gap}(?:at|@|price|:)?\s*\$?(\d+\.?\d*)",
        r"(?:sl|s\.l\.){gap}(?:at|@|price|:)?\s*\$?(\d+\.?\d*)",
        r"stop\s+(?:at\s+)?\$?(\d+\.?\d*)",
    ])
}

fn default_target() -> Vec<String> {
    strings(&[
        r"(?:target|take[-\s]?profit){gap}(?:at|@|price|:)?\s*\$?(\d+\.?\d*)",
        r"(?:tp|t\.p\.){gap}(?:at|@|price|:)?\s*\$?(\d+\.?\d*)",
        r"target\s+(?:at\s+)?\$?(\d+\.?\d*)",
    ])
}

impl RuleSet {
    /// Sections missing from the document keep their built-in patterns.
    pub fn from_yaml_str(text: &str) -> Result<Self, RuleError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn compile(&self, keyword_window: Option<usize>) -> Result<CompiledRules, RuleError> {
        let t = &self.ticker;
        if t.min_len == 0 || t.min_len > t.max_len {
            return Err(RuleError::TickerBounds { min: t.min_len, max: t.max_len });
        }
        let gap = match keyword_window {
            Some(n) => format!(".{{0,{n}}}?"),
            None => ".*?".to_string(),
        };

        Ok(CompiledRules {
            exchange: compile_cascade("exchange", &t.exchange, &gap)?,
            proximity: compile_cascade("proximity", &t.proximity, &gap)?,
            exclusions: t.exclusions.iter().map(|w| w.trim().to_uppercase()).collect(),
            min_len: t.min_len,
            max_len: t.max_len,
            buy: compile_cascade("buy", &self.prices.buy, &gap)?,
            stop: compile_cascade("stop", &self.prices.stop, &gap)?,
            target: compile_cascade("target", &self.prices.target, &gap)?,
        })
    }
}

fn compile_cascade(cascade: &'static str, patterns: &[String], gap: &str) -> Result<Vec<Regex>, RuleError> {
    patterns
        .iter()
        .map(|pattern| {
            let expanded = pattern.replace(GAP_PLACEHOLDER, gap);
            let regex = Regex::new(&expanded).map_err(|source| RuleError::Pattern {
                cascade,
                pattern: pattern.clone(),
                source,
            })?;
            if regex.captures_len() < 2 {
                return Err(RuleError::MissingCapture { cascade, pattern: pattern.clone() });
            }
            Ok(regex)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CompiledRules {
    pub(crate) exchange: Vec<Regex>,
    pub(crate) proximity: Vec<Regex>,
    pub(crate) exclusions: HashSet<String>,
    pub(crate) min_len: usize,
    pub(crate) max_len: usize,
    pub(crate) buy: Vec<Regex>,
    pub(crate) stop: Vec<Regex>,
    pub(crate) target: Vec<Regex>,
}

impl CompiledRules {
    /// Uppercased candidate if it is a plausible ticker.
    pub fn accept_ticker(&self, candidate: &str) -> Option<String> {
        let symbol = candidate.trim().to_uppercase();
        let len = symbol.chars().count();
        if len < self.min_len || len > self.max_len || self.exclusions.contains(&symbol) {
            return None;
        }
        Some(symbol)
    }
}

/// Ordered first-match-wins evaluation: each pattern's first match goes to `handler`;
/// a `None` from the handler moves on to the next pattern.
pub fn first_match<T>(
    patterns: &[Regex],
    text: &str,
    mut handler: impl FnMut(&str) -> Option<T>,
) -> Option<(usize, T)> {
    patterns.iter().enumerate().find_map(|(idx, regex)| {
        let capture = regex.captures(text)?.get(1)?;
        handler(capture.as_str()).map(|value| (idx, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_builtin_sections() {
        let rules = RuleSet::from_yaml_str(
            r#"
prices:
  buy:
    - 'buy\s+under\s+\$?(\d+\.?\d*)'
"#,
        )
        .expect("yaml");
        assert_eq!(rules.prices.buy.len(), 1);
        assert_eq!(rules.prices.stop, default_stop());
        assert_eq!(rules.ticker, TickerRules::default());
    }

    #[test]
    fn gap_placeholder_follows_the_window() {
        let rules = RuleSet::default();
        let bounded = rules.compile(Some(10)).expect("compile");
        assert!(bounded.buy[0].as_str().contains(".{0,10}?"));
        let unbounded = rules.compile(None).expect("compile");
        assert!(unbounded.buy[0].as_str().contains(".*?"));
    }

    #[test]
    fn invalid_patterns_are_reported_with_their_cascade() {
        let mut rules = RuleSet::default();
        rules.prices.stop.push("stop (".into());
        assert!(matches!(
            rules.compile(None),
            Err(RuleError::Pattern { cascade: "stop", .. })
        ));

        let mut rules = RuleSet::default();
        rules.ticker.exchange = vec![r"NYSE:\s*[A-Z]+".into()];
        assert!(matches!(rules.compile(None), Err(RuleError::MissingCapture { .. })));
    }

    #[test]
    fn first_match_skips_rejected_captures() {
        let patterns = vec![
            Regex::new(r"a(\d)").expect("re"),
            Regex::new(r"b(\d)").expect("re"),
        ];
        let hit = first_match(&patterns, "a0 b7", |c| c.parse::<u32>().ok().filter(|n| *n > 0));
        assert_eq!(hit, Some((1, 7)));
    }

    #[test]
    fn ticker_acceptance_applies_length_and_exclusions() {
        let compiled = RuleSet::default().compile(Some(100)).expect("compile");
        assert_eq!(compiled.accept_ticker("acme"), Some("ACME".to_string()));
        assert_eq!(compiled.accept_ticker("THE"), None);
        assert_eq!(compiled.accept_ticker("A"), None);
        assert_eq!(compiled.accept_ticker("TOOLONG"), None);
    }
}

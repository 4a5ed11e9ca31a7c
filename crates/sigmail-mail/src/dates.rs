//! Message date resolution: provider timestamp, then `Date` header, then dates found in the HTML.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use scraper::Html;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateSource {
    Internal,
    Header,
    HtmlScan,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    pub at: DateTime<Utc>,
    pub source: DateSource,
}

impl ResolvedDate {
    pub fn millis(&self) -> i64 {
        self.at.timestamp_millis()
    }
}

pub fn resolve_message_date(
    internal_ms: Option<i64>,
    date_header: Option<&str>,
    html: Option<&str>,
    now: DateTime<Utc>,
) -> ResolvedDate {
    if let Some(at) = internal_ms
        .filter(|ms| *ms > 0)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    {
        return ResolvedDate { at, source: DateSource::Internal };
    }
    if let Some(at) = date_header.and_then(parse_date_header) {
        return ResolvedDate { at, source: DateSource::Header };
    }
    if let Some(at) = html.and_then(scan_html_for_date) {
        return ResolvedDate { at, source: DateSource::HtmlScan };
    }
    ResolvedDate { at: now, source: DateSource::Fallback }
}

#[derive(Debug, Clone, Copy)]
enum HeaderFormat {
    Rfc2822,
    WithOffset(&'static str),
    WithZoneName(&'static str),
    Rfc3339,
    NaiveUtc(&'static str),
}

/// Tried in order; the first successful parse wins.
const HEADER_FORMATS: &[HeaderFormat] = &[
    HeaderFormat::Rfc2822,
    HeaderFormat::WithOffset("%a, %d %b %Y %H:%M:%S %z"),
    HeaderFormat::WithOffset("%d %b %Y %H:%M:%S %z"),
    HeaderFormat::WithZoneName("%a, %d %b %Y %H:%M:%S"),
    HeaderFormat::WithZoneName("%d %b %Y %H:%M:%S"),
    HeaderFormat::WithOffset("%d %b %y %H:%M %z"),
    HeaderFormat::Rfc3339,
    HeaderFormat::NaiveUtc("%Y-%m-%dT%H:%M:%SZ"),
    HeaderFormat::NaiveUtc("%Y-%m-%d %H:%M:%S"),
];

pub fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    let value = strip_comment(value);
    if value.is_empty() {
        return None;
    }
    HEADER_FORMATS.iter().find_map(|format| parse_with(*format, value))
}

fn parse_with(format: HeaderFormat, value: &str) -> Option<DateTime<Utc>> {
    match format {
        HeaderFormat::Rfc2822 => DateTime::parse_from_rfc2822(value).ok().map(|d| d.with_timezone(&Utc)),
        HeaderFormat::Rfc3339 => DateTime::parse_from_rfc3339(value).ok().map(|d| d.with_timezone(&Utc)),
        HeaderFormat::WithOffset(fmt) => DateTime::parse_from_str(value, fmt)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        HeaderFormat::WithZoneName(fmt) => {
            let (rest, zone) = value.rsplit_once(' ')?;
            let offset = zone_offset(zone)?;
            let naive = NaiveDateTime::parse_from_str(rest.trim(), fmt).ok()?;
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|d| d.with_timezone(&Utc))
        }
        HeaderFormat::NaiveUtc(fmt) => NaiveDateTime::parse_from_str(value, fmt)
            .ok()
            .map(|n| n.and_utc()),
    }
}

/// Drops a trailing `(UTC)`-style comment.
fn strip_comment(value: &str) -> &str {
    let trimmed = value.trim();
    match trimmed.rfind('(') {
        Some(idx) if trimmed.ends_with(')') => trimmed[..idx].trim_end(),
        _ => trimmed,
    }
}

/// Named zones seen in mail headers. Unknown alphabetic abbreviations read as UTC.
fn zone_offset(zone: &str) -> Option<FixedOffset> {
    if zone.is_empty() || zone.len() > 5 || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let hours = match zone.to_ascii_uppercase().as_str() {
        "EST" | "CDT" => -5,
        "EDT" => -4,
        "CST" => -6,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        _ => 0,
    };
    FixedOffset::east_opt(hours * 3600)
}

struct HtmlDatePatterns {
    textual: Regex,
    iso: Regex,
    slash: Regex,
}

fn html_date_patterns() -> Option<&'static HtmlDatePatterns> {
    static PATTERNS: OnceLock<Option<HtmlDatePatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(HtmlDatePatterns {
                textual: Regex::new(
                    r"\d{1,2}\s+(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\s+\d{4}(?:\s+\d{1,2}:\d{2}(?::\d{2})?)?(?:\s+[+-]\d{4})?",
                )
                .ok()?,
                iso: Regex::new(
                    r"\d{4}-\d{2}-\d{2}(?:T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)?",
                )
                .ok()?,
                slash: Regex::new(r"\d{1,2}/\d{1,2}/\d{4}").ok()?,
            })
        })
        .as_ref()
}

/// First parseable date-shaped substring among the document's text nodes.
pub fn scan_html_for_date(html: &str) -> Option<DateTime<Utc>> {
    let patterns = html_date_patterns()?;
    let document = Html::parse_document(html);

    let mut matches = Vec::new();
    for node in document.root_element().text() {
        let text = node.trim();
        if text.is_empty() {
            continue;
        }
        if let Some(m) = patterns.textual.find(text) {
            matches.push(DateMatch::Textual(m.as_str().to_string()));
        }
        if let Some(m) = patterns.iso.find(text) {
            matches.push(DateMatch::Iso(m.as_str().to_string()));
        }
        if let Some(m) = patterns.slash.find(text) {
            matches.push(DateMatch::Slash(m.as_str().to_string()));
        }
    }

    matches.iter().find_map(DateMatch::parse)
}

enum DateMatch {
    Textual(String),
    Iso(String),
    Slash(String),
}

impl DateMatch {
    fn parse(&self) -> Option<DateTime<Utc>> {
        match self {
            // %B also accepts abbreviated month names when parsing.
            Self::Textual(raw) => {
                let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
                parse_date_header(&text)
                    .or_else(|| parse_offset_formats(&text, &["%d %B %Y %H:%M:%S %z", "%d %B %Y %H:%M %z"]))
                    .or_else(|| parse_naive_formats(&text, &["%d %B %Y %H:%M:%S", "%d %B %Y %H:%M"]))
                    .or_else(|| parse_date_only(&text, &["%d %B %Y"]))
            }
            Self::Iso(raw) => parse_date_header(raw)
                .or_else(|| parse_offset_formats(raw, &["%Y-%m-%dT%H:%M:%S%.f%z"]))
                .or_else(|| parse_naive_formats(raw, &["%Y-%m-%dT%H:%M:%S%.f"]))
                .or_else(|| parse_date_only(raw, &["%Y-%m-%d"])),
            Self::Slash(raw) => parse_date_only(raw, &["%m/%d/%Y", "%d/%m/%Y"]),
        }
    }
}

fn parse_offset_formats(text: &str, formats: &[&str]) -> Option<DateTime<Utc>> {
    formats
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(text, fmt).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn parse_naive_formats(text: &str, formats: &[&str]) -> Option<DateTime<Utc>> {
    formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|n| n.and_utc())
}

fn parse_date_only(text: &str, formats: &[&str]) -> Option<DateTime<Utc>> {
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).single().expect("valid date")
    }

    #[test]
    fn internal_timestamp_wins() {
        let now = utc(2030, 1, 1, 0, 0, 0);
        let resolved = resolve_message_date(
            Some(1_704_844_800_000),
            Some("Fri, 01 Mar 2024 10:00:00 +0000"),
            None,
            now,
        );
        assert_eq!(resolved.source, DateSource::Internal);
        assert_eq!(resolved.at, utc(2024, 1, 10, 0, 0, 0));
    }

    #[test]
    fn header_formats_are_tried_in_order() {
        assert_eq!(
            parse_date_header("Wed, 10 Jan 2024 14:30:00 -0500"),
            Some(utc(2024, 1, 10, 19, 30, 0))
        );
        assert_eq!(
            parse_date_header("Wed, 3 Jan 2024 08:00:00 +0100 (CET)"),
            Some(utc(2024, 1, 3, 7, 0, 0))
        );
        assert_eq!(parse_date_header("10 Jan 2024 09:00:00 GMT"), Some(utc(2024, 1, 10, 9, 0, 0)));
        assert_eq!(
            parse_date_header("Wed, 10 Jan 2024 09:00:00 PST"),
            Some(utc(2024, 1, 10, 17, 0, 0))
        );
        assert_eq!(parse_date_header("10 Jan 24 09:15 +0000"), Some(utc(2024, 1, 10, 9, 15, 0)));
        assert_eq!(parse_date_header("2024-01-10T09:00:00+02:00"), Some(utc(2024, 1, 10, 7, 0, 0)));
        assert_eq!(parse_date_header("2024-01-10 09:00:00"), Some(utc(2024, 1, 10, 9, 0, 0)));
        assert_eq!(parse_date_header("next tuesday"), None);
    }

    #[test]
    fn html_scan_finds_each_pattern_class() {
        assert_eq!(
            scan_html_for_date("<div><p>Issued 12 February 2024 08:30</p></div>"),
            Some(utc(2024, 2, 12, 8, 30, 0))
        );
        assert_eq!(
            scan_html_for_date("<span>as of 2024-03-05T10:00:00Z</span>"),
            Some(utc(2024, 3, 5, 10, 0, 0))
        );
        assert_eq!(scan_html_for_date("<td>Date: 04/15/2024</td>"), Some(utc(2024, 4, 15, 0, 0, 0)));
        assert_eq!(scan_html_for_date("<p>no dates here</p>"), None);
    }

    #[test]
    fn header_then_html_then_fallback() {
        let now = utc(2030, 6, 1, 12, 0, 0);
        let from_html = resolve_message_date(None, Some("garbage"), Some("<p>1 Feb 2024</p>"), now);
        assert_eq!(from_html.source, DateSource::HtmlScan);
        assert_eq!(from_html.at, utc(2024, 2, 1, 0, 0, 0));

        let fallback = resolve_message_date(Some(0), None, Some("<p>nothing</p>"), now);
        assert_eq!(fallback.source, DateSource::Fallback);
        assert_eq!(fallback.millis(), now.timestamp_millis());
    }
}

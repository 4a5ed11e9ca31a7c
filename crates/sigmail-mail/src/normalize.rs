use chrono::{DateTime, Utc};
use scraper::Html;
use sigmail_core::FullRecord;
use tracing::warn;

use crate::dates::{resolve_message_date, DateSource};
use crate::message::Message;
use crate::mime::{concat_text_parts, decode_body};
use crate::MailError;

const SNIPPET_CHARS: usize = 200;
const EMPTY_LANDING: &str = "No content";

/// Landing payload: decoded text parts, else the provider snippet, else a marker.
pub fn landing_content(message: &Message) -> Result<String, MailError> {
    let payload = message
        .payload
        .as_ref()
        .ok_or_else(|| MailError::MissingPayload(message.id.clone()))?;
    let text = concat_text_parts(&message.id, payload)?;
    if !text.trim().is_empty() {
        return Ok(text);
    }
    if !message.snippet.trim().is_empty() {
        return Ok(message.snippet.clone());
    }
    Ok(EMPTY_LANDING.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub record: FullRecord,
    pub date_source: DateSource,
}

pub fn full_record_from_message(message: &Message, thread_key: &str, now: DateTime<Utc>) -> NormalizedMessage {
    let header = |name: &str| message.header(name).unwrap_or_default().to_string();
    let body = message
        .payload
        .as_ref()
        .map(|p| decode_body(&message.id, p))
        .unwrap_or_default();

    let date = resolve_message_date(
        message.internal_date,
        message.header("Date"),
        body.html.as_deref(),
        now,
    );
    if date.source == DateSource::Fallback {
        warn!(message_id = %message.id, "no usable date; using current time");
    }

    let snippet = if message.snippet.trim().is_empty() {
        derive_snippet(body.plain.as_deref(), body.html.as_deref())
    } else {
        message.snippet.clone()
    };

    NormalizedMessage {
        record: FullRecord {
            message_id: message.id.clone(),
            thread_key: thread_key.to_string(),
            subject: header("Subject"),
            from_address: header("From"),
            to_address: header("To"),
            date_ms: date.millis(),
            snippet,
            body_plain: body.plain.unwrap_or_default(),
            body_html: body.html.unwrap_or_default(),
            labels: message.label_ids.clone(),
        },
        date_source: date.source,
    }
}

fn derive_snippet(plain: Option<&str>, html: Option<&str>) -> String {
    let text = match (plain, html) {
        (Some(p), _) if !p.trim().is_empty() => collapse_whitespace(p),
        (_, Some(h)) => collapse_whitespace(&html_text(h)),
        _ => return String::new(),
    };
    if text.chars().count() <= SNIPPET_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(SNIPPET_CHARS).collect();
    cut.push_str("...");
    cut
}

fn html_text(html: &str) -> String {
    Html::parse_fragment(html).root_element().text().collect::<Vec<_>>().join(" ")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::MessageSeed;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().expect("now")
    }

    #[test]
    fn record_carries_headers_bodies_and_labels() {
        let message = MessageSeed {
            id: "m1".into(),
            thread_id: "t1".into(),
            from: "Alerts <alerts@example.com>".into(),
            to: "me@example.com".into(),
            subject: "Trade idea".into(),
            date_header: Some("Wed, 10 Jan 2024 09:00:00 +0000".into()),
            plain: Some("Buy WDG at 50".into()),
            html: Some("<p>Buy <b>WDG</b> at 50</p>".into()),
            labels: vec!["INBOX".into(), "Signals".into()],
            ..MessageSeed::default()
        }
        .build();

        let normalized = full_record_from_message(&message, "t1", now());
        let record = normalized.record;
        assert_eq!(normalized.date_source, DateSource::Header);
        assert_eq!(record.subject, "Trade idea");
        assert_eq!(record.from_address, "Alerts <alerts@example.com>");
        assert_eq!(record.to_address, "me@example.com");
        assert_eq!(record.body_plain, "Buy WDG at 50");
        assert_eq!(record.body_html, "<p>Buy <b>WDG</b> at 50</p>");
        assert_eq!(record.labels, vec!["INBOX".to_string(), "Signals".to_string()]);
        assert_eq!(record.snippet, "Buy WDG at 50");
        assert_eq!(record.date_ms, 1_704_877_200_000);
    }

    #[test]
    fn long_bodies_get_a_truncated_snippet() {
        let long = "word ".repeat(100);
        let snippet = derive_snippet(None, Some(&format!("<div>{long}</div>")));
        assert_eq!(snippet.chars().count(), SNIPPET_CHARS + 3);
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn landing_falls_back_to_snippet_then_marker() {
        let mut message = MessageSeed {
            id: "m1".into(),
            snippet: "provider snippet".into(),
            ..MessageSeed::default()
        }
        .build();
        assert_eq!(landing_content(&message).expect("landing"), "provider snippet");

        message.snippet.clear();
        assert_eq!(landing_content(&message).expect("landing"), "No content");

        message.payload = None;
        assert!(matches!(landing_content(&message), Err(MailError::MissingPayload(_))));
    }
}

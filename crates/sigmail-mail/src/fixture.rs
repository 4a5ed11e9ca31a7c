//! Fixture-first mailbox: serves a recorded mailbox from disk with injectable failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::message::{Header, Message, MessagePage, MessagePart, MessagePartBody, MessageRef, Thread};
use crate::{MailError, MailSource};

/// On-disk mailbox. `messages` are provider-shaped; `seeds` are expanded into messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxFixture {
    #[serde(default)]
    pub fixture_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub seeds: Vec<MessageSeed>,
    #[serde(default)]
    pub failing_message_ids: Vec<String>,
    #[serde(default)]
    pub failing_thread_ids: Vec<String>,
}

/// Compact description of a message, encoded the way the provider would send it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSeed {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date_header: Option<String>,
    pub internal_date: Option<i64>,
    pub snippet: String,
    pub plain: Option<String>,
    pub html: Option<String>,
    pub labels: Vec<String>,
}

impl MessageSeed {
    pub fn build(&self) -> Message {
        let mut headers = vec![
            Header { name: "From".into(), value: self.from.clone() },
            Header { name: "To".into(), value: self.to.clone() },
            Header { name: "Subject".into(), value: self.subject.clone() },
        ];
        if let Some(date) = &self.date_header {
            headers.push(Header { name: "Date".into(), value: date.clone() });
        }

        let leaf = |part_id: &str, mime: &str, text: &str| MessagePart {
            part_id: part_id.to_string(),
            mime_type: mime.to_string(),
            body: Some(MessagePartBody {
                size: text.len() as u64,
                data: Some(URL_SAFE_NO_PAD.encode(text)),
                attachment_id: None,
            }),
            ..MessagePart::default()
        };
        let mut parts = Vec::new();
        if let Some(plain) = &self.plain {
            parts.push(leaf("0", "text/plain", plain));
        }
        if let Some(html) = &self.html {
            parts.push(leaf(&parts.len().to_string(), "text/html", html));
        }

        Message {
            id: self.id.clone(),
            thread_id: if self.thread_id.is_empty() { self.id.clone() } else { self.thread_id.clone() },
            label_ids: self.labels.clone(),
            snippet: self.snippet.clone(),
            internal_date: self.internal_date,
            payload: Some(MessagePart {
                mime_type: "multipart/alternative".into(),
                headers,
                parts,
                ..MessagePart::default()
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct FixtureMailbox {
    order: Vec<String>,
    messages: HashMap<String, Message>,
    failing_messages: HashSet<String>,
    failing_threads: HashSet<String>,
    list_calls: AtomicUsize,
}

impl FixtureMailbox {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let fixture: MailboxFixture =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn from_fixture(fixture: MailboxFixture) -> Self {
        let built = fixture.seeds.iter().map(MessageSeed::build);
        let mut mailbox = Self::from_messages(fixture.messages.into_iter().chain(built));
        mailbox.failing_messages.extend(fixture.failing_message_ids);
        mailbox.failing_threads.extend(fixture.failing_thread_ids);
        mailbox
    }

    pub fn from_seeds(seeds: &[MessageSeed]) -> Self {
        Self::from_messages(seeds.iter().map(MessageSeed::build))
    }

    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut mailbox = Self::default();
        for message in messages {
            if !mailbox.messages.contains_key(&message.id) {
                mailbox.order.push(message.id.clone());
            }
            mailbox.messages.insert(message.id.clone(), message);
        }
        mailbox
    }

    pub fn with_failing_message(mut self, id: impl Into<String>) -> Self {
        self.failing_messages.insert(id.into());
        self
    }

    pub fn with_failing_thread(mut self, id: impl Into<String>) -> Self {
        self.failing_threads.insert(id.into());
        self
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn matches(message: &Message, query: &str) -> bool {
        query.split_whitespace().all(|term| match term.split_once(':') {
            Some(("from", sender)) => message
                .header("From")
                .is_some_and(|from| from.to_ascii_lowercase().contains(&sender.to_ascii_lowercase())),
            Some(("label", label)) => message.label_ids.iter().any(|l| l.eq_ignore_ascii_case(label)),
            _ => {
                let needle = term.to_ascii_lowercase();
                message.snippet.to_ascii_lowercase().contains(&needle)
                    || message
                        .header("Subject")
                        .is_some_and(|s| s.to_ascii_lowercase().contains(&needle))
            }
        })
    }
}

#[async_trait]
impl MailSource for FixtureMailbox {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn ping(&self) -> Result<(), MailError> {
        Ok(())
    }

    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<MessagePage, MailError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| MailError::Unavailable(format!("invalid page token {token}")))?,
            None => 0,
        };
        let page_size = usize::try_from(max_results.max(1)).unwrap_or(usize::MAX);

        let matching: Vec<&Message> = self
            .order
            .iter()
            .filter_map(|id| self.messages.get(id))
            .filter(|m| Self::matches(m, query))
            .collect();
        let end = offset.saturating_add(page_size).min(matching.len());
        let messages = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|m| MessageRef { id: m.id.clone(), thread_id: m.thread_key().to_string() })
            .collect();

        Ok(MessagePage {
            messages,
            next_page_token: (end < matching.len()).then(|| end.to_string()),
            result_size_estimate: Some(matching.len() as u64),
        })
    }

    async fn get_message(&self, id: &str) -> Result<Message, MailError> {
        if self.failing_messages.contains(id) {
            return Err(MailError::Unavailable(format!("injected failure for message {id}")));
        }
        self.messages
            .get(id)
            .cloned()
            .ok_or_else(|| MailError::MessageNotFound(id.to_string()))
    }

    async fn get_thread(&self, id: &str) -> Result<Thread, MailError> {
        if self.failing_threads.contains(id) {
            return Err(MailError::Unavailable(format!("injected failure for thread {id}")));
        }
        // Thread listings are ordered by message date like the provider's.
        let mut by_date: BTreeMap<(i64, usize), Message> = BTreeMap::new();
        for (idx, message_id) in self.order.iter().enumerate() {
            if let Some(message) = self.messages.get(message_id).filter(|m| m.thread_key() == id) {
                by_date.insert((message.internal_date.unwrap_or(0), idx), message.clone());
            }
        }
        if by_date.is_empty() {
            return Err(MailError::ThreadNotFound(id.to_string()));
        }
        Ok(Thread { id: id.to_string(), messages: by_date.into_values().collect() })
    }
}

//! Mail source contract, provider clients and message normalization.

use std::collections::HashSet;

use async_trait::async_trait;
use sigmail_storage::FetchError;
use thiserror::Error;
use tracing::debug;

pub mod dates;
pub mod fixture;
pub mod gmail;
pub mod message;
pub mod mime;
pub mod normalize;

pub use dates::{resolve_message_date, DateSource, ResolvedDate};
pub use fixture::{FixtureMailbox, MessageSeed};
pub use gmail::{GmailClient, GmailConfig, DEFAULT_API_BASE};
pub use message::{Header, Message, MessagePage, MessagePart, MessagePartBody, MessageRef, Thread};
pub use mime::{decode_body, decode_part_data, DecodedBody};
pub use normalize::{full_record_from_message, landing_content, NormalizedMessage};

pub const CRATE_NAME: &str = "sigmail-mail";

#[derive(Debug, Error)]
pub enum MailError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("message {0} not found")]
    MessageNotFound(String),
    #[error("thread {0} not found")]
    ThreadNotFound(String),
    #[error("mail credentials unavailable: {0}")]
    Unauthorized(String),
    #[error("message {0} has no payload")]
    MissingPayload(String),
    #[error("decoding part {part} of message {message_id}: {source}")]
    Decode {
        message_id: String,
        part: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("{0}")]
    Unavailable(String),
}

/// Remote mailbox operations consumed by the pipeline. Calls are fallible and may be slow.
#[async_trait]
pub trait MailSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fails when the source cannot be used at all (credentials, reachability).
    async fn ping(&self) -> Result<(), MailError>;

    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<MessagePage, MailError>;

    async fn get_message(&self, id: &str) -> Result<Message, MailError>;

    async fn get_thread(&self, id: &str) -> Result<Thread, MailError>;
}

/// Walk every listing page for `query`, keeping the first occurrence of each message id.
pub async fn list_all_messages(
    source: &dyn MailSource,
    query: &str,
    page_size: u32,
) -> Result<Vec<MessageRef>, MailError> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = source
            .list_messages(query, page_token.as_deref(), page_size)
            .await?;
        pages += 1;
        for msg in page.messages {
            if seen.insert(msg.id.clone()) {
                refs.push(msg);
            }
        }
        debug!(pages, listed = refs.len(), "listing page received");

        match page.next_page_token {
            Some(token) if !token.is_empty() => page_token = Some(token),
            _ => break,
        }
    }

    Ok(refs)
}

/// Provider search query for a sender address or label.
pub fn target_query(sender: Option<&str>, label: Option<&str>) -> String {
    match (sender, label) {
        (Some(sender), _) if !sender.trim().is_empty() => format!("from:{}", sender.trim()),
        (_, Some(label)) if !label.trim().is_empty() => format!("label:{}", label.trim()),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_follows_page_tokens_and_dedupes() {
        let mut seeds: Vec<MessageSeed> = (0..7)
            .map(|i| MessageSeed {
                id: format!("m{i}"),
                from: "alerts@example.com".into(),
                plain: Some("hello".into()),
                ..MessageSeed::default()
            })
            .collect();
        seeds.push(MessageSeed {
            id: "other".into(),
            from: "someone@else.test".into(),
            ..MessageSeed::default()
        });
        let mailbox = FixtureMailbox::from_seeds(&seeds);

        let refs = list_all_messages(&mailbox, "from:alerts@example.com", 3)
            .await
            .expect("list");
        assert_eq!(refs.len(), 7);
        assert_eq!(mailbox.list_calls(), 3);
        assert!(refs.iter().all(|r| r.id.starts_with('m')));
    }

    #[test]
    fn target_query_prefers_sender() {
        assert_eq!(target_query(Some("a@b.c"), Some("Signals")), "from:a@b.c");
        assert_eq!(target_query(None, Some("Signals")), "label:Signals");
        assert_eq!(target_query(Some(" "), None), "");
    }
}

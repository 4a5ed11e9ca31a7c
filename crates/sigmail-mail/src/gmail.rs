use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sigmail_storage::{FetchError, HttpFetcher};

use crate::message::{Message, MessagePage, Thread};
use crate::{MailError, MailSource};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub api_base: String,
    pub user_id: String,
    /// Bearer token obtained out of band; refreshing it is the caller's job.
    pub access_token: Option<String>,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            user_id: "me".to_string(),
            access_token: None,
        }
    }
}

/// Gmail REST v1 over the shared rate-limited fetcher.
#[derive(Debug, Clone)]
pub struct GmailClient {
    http: Arc<HttpFetcher>,
    config: GmailConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    #[serde(default)]
    email_address: String,
}

impl GmailClient {
    pub fn new(http: Arc<HttpFetcher>, config: GmailConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/users/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.user_id,
            path
        )
    }

    fn token(&self) -> Result<&str, MailError> {
        self.config
            .access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| MailError::Unauthorized("no access token configured".into()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, FetchError> {
        let token = self.config.access_token.as_deref();
        self.http.get_json(&self.url(path), query, token).await
    }
}

fn map_status(err: FetchError, not_found: impl FnOnce() -> MailError) -> MailError {
    match err.status() {
        Some(404) => not_found(),
        Some(401) | Some(403) => MailError::Unauthorized(err.to_string()),
        _ => MailError::Fetch(err),
    }
}

#[async_trait]
impl MailSource for GmailClient {
    fn source_id(&self) -> &'static str {
        "gmail"
    }

    async fn ping(&self) -> Result<(), MailError> {
        self.token()?;
        let profile: Profile = self
            .get("profile", &[])
            .await
            .map_err(|e| map_status(e, || MailError::Unauthorized("profile not found".into())))?;
        tracing::debug!(account = %profile.email_address, "gmail credentials accepted");
        Ok(())
    }

    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<MessagePage, MailError> {
        self.token()?;
        let mut params = vec![("maxResults", max_results.to_string())];
        if !query.is_empty() {
            params.push(("q", query.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        self.get("messages", &params)
            .await
            .map_err(|e| map_status(e, || MailError::Unavailable("message listing not found".into())))
    }

    async fn get_message(&self, id: &str) -> Result<Message, MailError> {
        self.token()?;
        self.get(&format!("messages/{id}"), &[("format", "full".to_string())])
            .await
            .map_err(|e| map_status(e, || MailError::MessageNotFound(id.to_string())))
    }

    async fn get_thread(&self, id: &str) -> Result<Thread, MailError> {
        self.token()?;
        self.get(&format!("threads/{id}"), &[("format", "full".to_string())])
            .await
            .map_err(|e| map_status(e, || MailError::ThreadNotFound(id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigmail_storage::HttpClientConfig;

    fn client(token: Option<&str>) -> GmailClient {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
        GmailClient::new(
            Arc::new(http),
            GmailConfig {
                api_base: "http://127.0.0.1:9/gmail/v1/".into(),
                access_token: token.map(str::to_string),
                ..GmailConfig::default()
            },
        )
    }

    #[test]
    fn urls_are_scoped_to_the_user() {
        assert_eq!(
            client(Some("t")).url("messages/abc"),
            "http://127.0.0.1:9/gmail/v1/users/me/messages/abc"
        );
    }

    #[tokio::test]
    async fn missing_token_is_a_credentials_error() {
        let gmail = client(None);
        assert!(matches!(gmail.ping().await, Err(MailError::Unauthorized(_))));
        assert!(matches!(gmail.get_message("m1").await, Err(MailError::Unauthorized(_))));
    }
}

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sigmail_mail::{target_query, DEFAULT_API_BASE};
use sigmail_signals::{ExtractorConfig, DEFAULT_HEAD_CHARS, DEFAULT_KEYWORD_WINDOW};
use sigmail_storage::StoreConfig;

/// Pool shape for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePool {
    pub workers: usize,
    /// Log a progress line after this many finished jobs.
    pub progress_every: usize,
}

impl StagePool {
    pub const fn new(workers: usize, progress_every: usize) -> Self {
        Self { workers, progress_every }
    }
}

/// Everything the pipeline needs, built once and handed to every stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_busy_timeout: Duration,
    pub mail_query: String,
    pub page_size: u32,
    pub ingestion: StagePool,
    pub enrichment: StagePool,
    pub extraction: StagePool,
    pub promotion: StagePool,
    pub date_repair: StagePool,
    pub error_sample: usize,
    pub head_chars: Option<usize>,
    pub keyword_window: Option<usize>,
    pub rules_path: Option<PathBuf>,
    pub gmail_access_token: Option<String>,
    pub gmail_api_base: String,
    pub http_timeout_secs: u64,
    pub requests_per_second: Option<u32>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://sigmail.db".to_string(),
            db_max_connections: 8,
            db_busy_timeout: Duration::from_millis(30_000),
            mail_query: String::new(),
            page_size: 500,
            ingestion: StagePool::new(50, 100),
            enrichment: StagePool::new(25, 10),
            extraction: StagePool::new(10, 25),
            promotion: StagePool::new(5, 20),
            date_repair: StagePool::new(10, 100),
            error_sample: 5,
            head_chars: Some(DEFAULT_HEAD_CHARS),
            keyword_window: Some(DEFAULT_KEYWORD_WINDOW),
            rules_path: None,
            gmail_access_token: None,
            gmail_api_base: DEFAULT_API_BASE.to_string(),
            http_timeout_secs: 20,
            requests_per_second: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let query = env::var("SIGMAIL_MAIL_QUERY").ok().filter(|q| !q.trim().is_empty());
        let mail_query = query.unwrap_or_else(|| {
            target_query(
                env::var("SIGMAIL_TARGET_SENDER").ok().as_deref(),
                env::var("SIGMAIL_TARGET_LABEL").ok().as_deref(),
            )
        });

        Self {
            database_url: env::var("DATABASE_URL").unwrap_or(d.database_url),
            db_max_connections: parsed("SIGMAIL_DB_MAX_CONNECTIONS").unwrap_or(d.db_max_connections),
            db_busy_timeout: parsed("SIGMAIL_DB_BUSY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.db_busy_timeout),
            mail_query,
            page_size: parsed("SIGMAIL_PAGE_SIZE").unwrap_or(d.page_size),
            ingestion: pool_from_env("INGEST", d.ingestion),
            enrichment: pool_from_env("ENRICH", d.enrichment),
            extraction: pool_from_env("EXTRACT", d.extraction),
            promotion: pool_from_env("PROMOTE", d.promotion),
            date_repair: pool_from_env("REPAIR", d.date_repair),
            error_sample: parsed("SIGMAIL_ERROR_SAMPLE").unwrap_or(d.error_sample),
            head_chars: limit_from_env("SIGMAIL_HEAD_CHARS", d.head_chars),
            keyword_window: limit_from_env("SIGMAIL_KEYWORD_WINDOW", d.keyword_window),
            rules_path: env::var("SIGMAIL_RULES_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            gmail_access_token: env::var("GMAIL_ACCESS_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            gmail_api_base: env::var("GMAIL_API_BASE").unwrap_or(d.gmail_api_base),
            http_timeout_secs: parsed("SIGMAIL_HTTP_TIMEOUT_SECS").unwrap_or(d.http_timeout_secs),
            requests_per_second: parsed("SIGMAIL_REQUESTS_PER_SECOND").filter(|r| *r > 0),
            scheduler_enabled: env::var("SIGMAIL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env::var("SIGMAIL_SYNC_CRON").unwrap_or(d.sync_cron),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_connections: self.db_max_connections,
            busy_timeout: self.db_busy_timeout,
            ..StoreConfig::new(self.database_url.clone())
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            head_chars: self.head_chars,
            keyword_window: self.keyword_window,
        }
    }
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `0` switches the limit off.
fn limit_from_env(key: &str, default: Option<usize>) -> Option<usize> {
    match parsed::<usize>(key) {
        Some(0) => None,
        Some(n) => Some(n),
        None => default,
    }
}

fn pool_from_env(stage: &str, default: StagePool) -> StagePool {
    StagePool {
        workers: parsed(&format!("SIGMAIL_{stage}_WORKERS"))
            .filter(|w| *w > 0)
            .unwrap_or(default.workers),
        progress_every: parsed(&format!("SIGMAIL_{stage}_PROGRESS_EVERY"))
            .filter(|n| *n > 0)
            .unwrap_or(default.progress_every),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn from_vars(vars: &[(&str, &str)]) -> PipelineConfig {
        for (key, value) in vars {
            env::set_var(key, value);
        }
        let config = PipelineConfig::from_env();
        for (key, _) in vars {
            env::remove_var(key);
        }
        config
    }

    #[test]
    fn defaults_match_the_documented_pool_shapes() {
        let config = PipelineConfig::default();
        assert_eq!(config.ingestion, StagePool::new(50, 100));
        assert_eq!(config.enrichment, StagePool::new(25, 10));
        assert_eq!(config.extraction, StagePool::new(10, 25));
        assert_eq!(config.promotion, StagePool::new(5, 20));
        assert_eq!(config.extractor_config(), ExtractorConfig::default());
        assert_eq!(config.store_config().max_connections, 8);
    }

    #[test]
    fn zero_disables_text_limits() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = from_vars(&[("SIGMAIL_HEAD_CHARS", "0"), ("SIGMAIL_KEYWORD_WINDOW", "40")]);
        assert_eq!(config.head_chars, None);
        assert_eq!(config.keyword_window, Some(40));
    }

    #[test]
    fn stage_pool_overrides_apply_per_stage() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = from_vars(&[
            ("SIGMAIL_PROMOTE_WORKERS", "1"),
            ("SIGMAIL_PROMOTE_PROGRESS_EVERY", "3"),
            ("SIGMAIL_EXTRACT_WORKERS", "0"),
        ]);
        assert_eq!(config.promotion, StagePool::new(1, 3));
        assert_eq!(config.extraction, StagePool::new(10, 25));
        assert_eq!(config.ingestion, StagePool::new(50, 100));
    }

    #[test]
    fn sender_wins_over_label() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = from_vars(&[
            ("SIGMAIL_TARGET_SENDER", "alerts@signals.example"),
            ("SIGMAIL_TARGET_LABEL", "Signals"),
        ]);
        assert_eq!(config.mail_query, "from:alerts@signals.example");

        let config = from_vars(&[("SIGMAIL_TARGET_LABEL", "Signals")]);
        assert_eq!(config.mail_query, "label:Signals");
    }

    #[test]
    fn explicit_query_beats_target_fields() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = from_vars(&[
            ("SIGMAIL_MAIL_QUERY", "from:desk@example.com newer_than:7d"),
            ("SIGMAIL_TARGET_SENDER", "alerts@signals.example"),
        ]);
        assert_eq!(config.mail_query, "from:desk@example.com newer_than:7d");
    }
}

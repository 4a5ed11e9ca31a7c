//! Pipeline orchestration: one bounded worker pool per stage, run to completion in order.

pub mod config;
pub mod export;
pub mod pool;
mod stages;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sigmail_core::{MessageStage, StageSummary, TableCounts};
use sigmail_mail::{GmailClient, GmailConfig, MailError, MailSource};
use sigmail_signals::{RuleError, RuleSet, SignalExtractor};
use sigmail_storage::{FetchError, HttpClientConfig, HttpFetcher, SignalStore, StoreError};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub use config::{PipelineConfig, StagePool};
pub use export::{export_final_signals, ExportManifest, ExportManifestFile};
pub use pool::{run_pool, PoolOptions, PoolResults};

pub const CRATE_NAME: &str = "sigmail-sync";

/// Failures that stop a stage before any job runs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("signal store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("mail source {source_id} unavailable: {source}")]
    Mail {
        source_id: &'static str,
        #[source]
        source: MailError,
    },
    #[error("no target filter; set SIGMAIL_MAIL_QUERY, SIGMAIL_TARGET_SENDER or SIGMAIL_TARGET_LABEL")]
    MissingTarget,
    #[error("loading extraction rules: {0}")]
    Rules(#[from] RuleError),
    #[error("building http client: {0}")]
    Http(#[from] FetchError),
}

pub struct SignalPipeline {
    config: Arc<PipelineConfig>,
    store: SignalStore,
    mail: Arc<dyn MailSource>,
    extractor: Arc<SignalExtractor>,
}

impl SignalPipeline {
    pub fn new(config: PipelineConfig, store: SignalStore, mail: Arc<dyn MailSource>) -> Result<Self, PipelineError> {
        let rules = match &config.rules_path {
            Some(path) => RuleSet::load(path)?,
            None => RuleSet::default(),
        };
        let extractor = SignalExtractor::new(&rules, config.extractor_config())?;
        Ok(Self {
            config: Arc::new(config),
            store,
            mail,
            extractor: Arc::new(extractor),
        })
    }

    /// Opens the configured store, applies migrations and wires the given mail source.
    pub async fn connect(config: PipelineConfig, mail: Arc<dyn MailSource>) -> Result<Self, PipelineError> {
        let store = SignalStore::connect(&config.store_config()).await?;
        store.migrate().await?;
        Self::new(config, store, mail)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    pub async fn run_ingestion(&self) -> Result<StageSummary, PipelineError> {
        stages::ingest(self).await
    }

    pub async fn run_enrichment(&self) -> Result<StageSummary, PipelineError> {
        stages::enrich(self).await
    }

    pub async fn run_extraction(&self) -> Result<StageSummary, PipelineError> {
        stages::extract(self).await
    }

    pub async fn run_promotion(&self) -> Result<StageSummary, PipelineError> {
        stages::promote(self).await
    }

    /// Re-reads provider timestamps for stored records and rewrites changed dates.
    pub async fn run_date_repair(&self) -> Result<StageSummary, PipelineError> {
        stages::repair_dates(self).await
    }

    /// Every stage in order. Stops at the first fatal error.
    pub async fn run_all(&self) -> Result<Vec<StageSummary>, PipelineError> {
        Ok(vec![
            self.run_ingestion().await?,
            self.run_enrichment().await?,
            self.run_extraction().await?,
            self.run_promotion().await?,
        ])
    }

    pub async fn counts(&self) -> Result<TableCounts, PipelineError> {
        Ok(self.store.counts().await?)
    }

    pub async fn message_stage(&self, message_id: &str) -> Result<Option<MessageStage>, PipelineError> {
        Ok(self.store.message_stage(message_id).await?)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_all().await {
                    Ok(summaries) => {
                        for s in &summaries {
                            info!(stage = s.stage.as_str(), total = s.total, failed = s.failed, "scheduled stage finished");
                        }
                    }
                    Err(err) => error!(error = %err, "scheduled pipeline run aborted"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Gmail client over a shared fetcher built from the pipeline config.
pub fn gmail_source(config: &PipelineConfig) -> Result<Arc<dyn MailSource>, PipelineError> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(format!("sigmail/{}", env!("CARGO_PKG_VERSION"))),
        requests_per_second: config.requests_per_second,
        ..Default::default()
    })?;
    let gmail = GmailClient::new(
        Arc::new(http),
        GmailConfig {
            api_base: config.gmail_api_base.clone(),
            access_token: config.gmail_access_token.clone(),
            ..GmailConfig::default()
        },
    );
    Ok(Arc::new(gmail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigmail_mail::FixtureMailbox;
    use tempfile::tempdir;

    #[tokio::test]
    async fn scheduler_is_only_built_when_enabled() {
        let dir = tempdir().expect("tempdir");
        let config = PipelineConfig {
            database_url: format!("sqlite://{}", dir.path().join("sched.db").display()),
            ..PipelineConfig::default()
        };
        let mail: Arc<dyn MailSource> = Arc::new(FixtureMailbox::default());
        let pipeline = Arc::new(SignalPipeline::connect(config, mail).await.expect("pipeline"));
        assert!(pipeline.maybe_build_scheduler().await.expect("scheduler").is_none());
    }

    #[tokio::test]
    async fn missing_rules_file_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let config = PipelineConfig {
            database_url: format!("sqlite://{}", dir.path().join("rules.db").display()),
            rules_path: Some(dir.path().join("absent.yaml")),
            ..PipelineConfig::default()
        };
        let mail: Arc<dyn MailSource> = Arc::new(FixtureMailbox::default());
        let err = SignalPipeline::connect(config, mail).await.err().expect("fatal");
        assert!(matches!(err, PipelineError::Rules(RuleError::Io { .. })));
    }

    #[test]
    fn gmail_source_uses_configured_base() {
        let source = gmail_source(&PipelineConfig::default()).expect("gmail");
        assert_eq!(source.source_id(), "gmail");
    }
}

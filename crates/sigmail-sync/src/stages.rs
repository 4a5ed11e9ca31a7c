use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sigmail_core::{CleanSignal, ExtractionCandidate, Stage, StageSummary};
use sigmail_mail::{full_record_from_message, landing_content, list_all_messages, MailError, MailSource, MessageRef};
use sigmail_signals::SignalExtractor;
use sigmail_storage::{SignalStore, StoreError};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::StagePool;
use crate::pool::{run_pool, PoolOptions, PoolResults};
use crate::{PipelineError, SignalPipeline};

/// Failure of one job. Rendered into the stage summary, never propagated.
#[derive(Debug, Error)]
enum ItemError {
    #[error("{item}: {source}")]
    Mail {
        item: String,
        #[source]
        source: MailError,
    },
    #[error("{item}: {source}")]
    Store {
        item: String,
        #[source]
        source: StoreError,
    },
}

impl ItemError {
    fn mail(item: impl Into<String>) -> impl FnOnce(MailError) -> Self {
        let item = item.into();
        move |source| Self::Mail { item, source }
    }

    fn store(item: impl Into<String>) -> impl FnOnce(StoreError) -> Self {
        let item = item.into();
        move |source| Self::Store { item, source }
    }
}

struct StageRun {
    stage: Stage,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl StageRun {
    fn start(stage: Stage) -> Self {
        Self {
            stage,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    fn span(&self) -> Span {
        info_span!("stage", stage = self.stage.as_str(), run_id = %self.run_id)
    }

    fn options(&self, pool: StagePool, error_sample: usize) -> PoolOptions {
        PoolOptions::new(self.stage.as_str(), pool, error_sample)
    }

    fn finish<T>(self, results: PoolResults<T>, tally: impl Fn(&T, &mut BTreeMap<String, usize>)) -> StageSummary {
        let mut outcomes = BTreeMap::new();
        for value in &results.succeeded {
            tally(value, &mut outcomes);
        }
        let summary = StageSummary {
            stage: self.stage,
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            total: results.total,
            succeeded: results.succeeded.len(),
            failed: results.failed,
            outcomes,
            error_samples: results.error_samples,
        };
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            outcomes = ?summary.outcomes,
            "stage finished"
        );
        summary
    }
}

fn count_label(label: &&'static str, outcomes: &mut BTreeMap<String, usize>) {
    *outcomes.entry((*label).to_string()).or_default() += 1;
}

async fn ensure_mail(mail: &dyn MailSource) -> Result<(), PipelineError> {
    mail.ping().await.map_err(|source| PipelineError::Mail {
        source_id: mail.source_id(),
        source,
    })
}

pub(crate) async fn ingest(pipeline: &SignalPipeline) -> Result<StageSummary, PipelineError> {
    let run = StageRun::start(Stage::Ingestion);
    let span = run.span();
    async move {
        // An empty query lists the whole mailbox.
        if pipeline.config.mail_query.trim().is_empty() {
            return Err(PipelineError::MissingTarget);
        }
        pipeline.store.ping().await?;
        ensure_mail(pipeline.mail.as_ref()).await?;

        let config = &pipeline.config;
        info!(query = %config.mail_query, page_size = config.page_size, "listing messages");
        let refs = list_all_messages(pipeline.mail.as_ref(), &config.mail_query, config.page_size)
            .await
            .map_err(|source| PipelineError::Mail {
                source_id: pipeline.mail.source_id(),
                source,
            })?;
        info!(listed = refs.len(), "listing complete");

        let store = pipeline.store.clone();
        let mail = Arc::clone(&pipeline.mail);
        let results = run_pool(refs, run.options(config.ingestion, config.error_sample), move |msg: MessageRef| {
            let store = store.clone();
            let mail = Arc::clone(&mail);
            async move { land_message(mail.as_ref(), &store, &msg.id).await }
        })
        .await;
        Ok(run.finish(results, count_label))
    }
    .instrument(span)
    .await
}

async fn land_message(mail: &dyn MailSource, store: &SignalStore, id: &str) -> Result<&'static str, ItemError> {
    let message = mail
        .get_message(id)
        .await
        .map_err(ItemError::mail(format!("message {id}")))?;
    let content = landing_content(&message).map_err(ItemError::mail(format!("message {id}")))?;
    let inserted = store
        .insert_landing(message.thread_key(), &content)
        .await
        .map_err(ItemError::store(format!("landing thread {}", message.thread_key())))?;
    Ok(if inserted { "landed" } else { "already_landed" })
}

#[derive(Debug, Default, Clone, Copy)]
struct ThreadOutcome {
    upserted: usize,
    skipped: usize,
}

pub(crate) async fn enrich(pipeline: &SignalPipeline) -> Result<StageSummary, PipelineError> {
    let run = StageRun::start(Stage::Enrichment);
    let span = run.span();
    async move {
        pipeline.store.ping().await?;
        ensure_mail(pipeline.mail.as_ref()).await?;

        let keys = pipeline.store.landing_thread_keys().await?;
        info!(threads = keys.len(), "enriching landed threads");

        let config = &pipeline.config;
        let store = pipeline.store.clone();
        let mail = Arc::clone(&pipeline.mail);
        let results = run_pool(keys, run.options(config.enrichment, config.error_sample), move |key: String| {
            let store = store.clone();
            let mail = Arc::clone(&mail);
            async move { enrich_thread(mail.as_ref(), &store, &key).await }
        })
        .await;

        Ok(run.finish(results, |outcome, outcomes| {
            *outcomes.entry("threads_enriched".to_string()).or_default() += 1;
            *outcomes.entry("messages_upserted".to_string()).or_default() += outcome.upserted;
            *outcomes.entry("messages_skipped".to_string()).or_default() += outcome.skipped;
        }))
    }
    .instrument(span)
    .await
}

/// A failed thread fetch fails the job; a failed message inside it is logged and skipped.
async fn enrich_thread(mail: &dyn MailSource, store: &SignalStore, key: &str) -> Result<ThreadOutcome, ItemError> {
    let thread = mail
        .get_thread(key)
        .await
        .map_err(ItemError::mail(format!("thread {key}")))?;

    let mut outcome = ThreadOutcome::default();
    for listed in &thread.messages {
        let message = match mail.get_message(&listed.id).await {
            Ok(message) => message,
            Err(err) => {
                warn!(thread = key, message_id = %listed.id, error = %err, "skipping message");
                outcome.skipped += 1;
                continue;
            }
        };
        let normalized = full_record_from_message(&message, key, Utc::now());
        match store.upsert_full_record(&normalized.record).await {
            Ok(()) => outcome.upserted += 1,
            Err(err) => {
                warn!(thread = key, message_id = %listed.id, error = %err, "full record write failed");
                outcome.skipped += 1;
            }
        }
    }
    Ok(outcome)
}

pub(crate) async fn extract(pipeline: &SignalPipeline) -> Result<StageSummary, PipelineError> {
    let run = StageRun::start(Stage::Extraction);
    let span = run.span();
    async move {
        pipeline.store.ping().await?;
        let candidates = pipeline.store.extraction_candidates().await?;
        info!(candidates = candidates.len(), "extracting signals");

        let config = &pipeline.config;
        let store = pipeline.store.clone();
        let extractor = Arc::clone(&pipeline.extractor);
        let results = run_pool(
            candidates,
            run.options(config.extraction, config.error_sample),
            move |candidate: ExtractionCandidate| {
                let store = store.clone();
                let extractor = Arc::clone(&extractor);
                async move { extract_one(&extractor, &store, &candidate).await }
            },
        )
        .await;
        Ok(run.finish(results, count_label))
    }
    .instrument(span)
    .await
}

async fn extract_one(
    extractor: &SignalExtractor,
    store: &SignalStore,
    candidate: &ExtractionCandidate,
) -> Result<&'static str, ItemError> {
    let row = extractor.extract_candidate(candidate);
    store
        .upsert_staging(&row)
        .await
        .map_err(ItemError::store(format!("staging {}", candidate.message_id)))?;
    Ok(if row.has_signal() { "signal" } else { "empty" })
}

pub(crate) async fn promote(pipeline: &SignalPipeline) -> Result<StageSummary, PipelineError> {
    let run = StageRun::start(Stage::Promotion);
    let span = run.span();
    async move {
        pipeline.store.ping().await?;
        let clean = pipeline.store.clean_signals().await?;
        info!(clean = clean.len(), "promoting clean signals");

        let config = &pipeline.config;
        let store = pipeline.store.clone();
        let results = run_pool(clean, run.options(config.promotion, config.error_sample), move |signal: CleanSignal| {
            let store = store.clone();
            async move { promote_one(&store, &signal).await }
        })
        .await;
        Ok(run.finish(results, count_label))
    }
    .instrument(span)
    .await
}

/// First writer for a signal date wins; later ones are dropped, not merged.
async fn promote_one(store: &SignalStore, signal: &CleanSignal) -> Result<&'static str, ItemError> {
    let item = || format!("promote {}", signal.message_id);

    if store
        .get_final_signal(&signal.message_id)
        .await
        .map_err(ItemError::store(item()))?
        .is_some()
    {
        return Ok("already_promoted");
    }

    if let Some(holder) = store
        .final_signal_for_date(signal.signal_date)
        .await
        .map_err(ItemError::store(item()))?
    {
        info!(
            message_id = %signal.message_id,
            holder = %holder.message_id,
            signal_date = signal.signal_date,
            "signal date already taken; dropping"
        );
        return Ok("duplicate_date");
    }

    if store
        .insert_final_signal(signal)
        .await
        .map_err(ItemError::store(item()))?
    {
        return Ok("promoted");
    }

    // Lost a race between the check and the insert.
    let promoted = store
        .get_final_signal(&signal.message_id)
        .await
        .map_err(ItemError::store(item()))?
        .is_some();
    if !promoted {
        info!(message_id = %signal.message_id, signal_date = signal.signal_date, "signal date taken concurrently; dropping");
    }
    Ok(if promoted { "already_promoted" } else { "duplicate_date" })
}

pub(crate) async fn repair_dates(pipeline: &SignalPipeline) -> Result<StageSummary, PipelineError> {
    let run = StageRun::start(Stage::DateRepair);
    let span = run.span();
    async move {
        pipeline.store.ping().await?;
        ensure_mail(pipeline.mail.as_ref()).await?;
        let ids = pipeline.store.full_record_ids().await?;
        info!(records = ids.len(), "re-reading provider timestamps");

        let config = &pipeline.config;
        let store = pipeline.store.clone();
        let mail = Arc::clone(&pipeline.mail);
        let results = run_pool(ids, run.options(config.date_repair, config.error_sample), move |id: String| {
            let store = store.clone();
            let mail = Arc::clone(&mail);
            async move { repair_one(mail.as_ref(), &store, &id).await }
        })
        .await;
        Ok(run.finish(results, count_label))
    }
    .instrument(span)
    .await
}

async fn repair_one(mail: &dyn MailSource, store: &SignalStore, id: &str) -> Result<&'static str, ItemError> {
    let message = mail
        .get_message(id)
        .await
        .map_err(ItemError::mail(format!("message {id}")))?;
    let Some(internal) = message.internal_date else {
        return Ok("no_internal_date");
    };
    let changed = store
        .update_record_date(id, internal)
        .await
        .map_err(ItemError::store(format!("record {id}")))?;
    Ok(if changed { "updated" } else { "unchanged" })
}

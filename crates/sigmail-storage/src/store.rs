//! The four pipeline stores on one SQLite database.
//!
//! Every write is a single statement so concurrent workers never hold a transaction
//! open across a network call; WAL plus a busy timeout absorbs writer contention.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sigmail_core::{
    CleanSignal, ExtractionCandidate, FinalSignal, FullRecord, MessageStage, RawLanding,
    StagingExtraction, TableCounts,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid database url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database unreachable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("applying migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct SignalStore {
    pool: SqlitePool,
}

const FULL_RECORD_COLUMNS: &str = "message_id, thread_key, subject, from_address, to_address, \
     date_ms, snippet, body_plain, body_html, labels";

const STAGING_COLUMNS: &str = "message_id, ticker, signal_date, entry_date, buy_price, \
     stop_price, target_price, raw_text, cleaned_text";

const FINAL_COLUMNS: &str = "message_id, ticker, signal_date, entry_date, buy_price, \
     stop_price, target_price, promoted_at";

const CLEAN_FILTER: &str = "ticker IS NOT NULL AND ticker <> '' \
     AND buy_price > 0 AND stop_price > 0 AND target_price > 0";

/// Body expression shared by candidate selection and its keyword filter.
/// The trim set is Unicode `White_Space`, the same set `str::trim` strips in `FullRecord::body`.
const CANDIDATE_BODY: &str = "COALESCE(NULLIF(TRIM(body_plain, char(\
     9, 10, 11, 12, 13, 32, 133, 160, 5760, 8192, 8193, 8194, 8195, 8196, 8197, 8198, 8199, 8200, \
     8201, 8202, 8232, 8233, 8239, 8287, 12288)), ''), body_html)";

impl SignalStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|source| StoreError::InvalidUrl {
                url: config.database_url.clone(),
                source,
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StoreError::Unavailable)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("signal store migrations applied");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Unavailable)?;
        Ok(())
    }

    /// Returns false when the thread was already landed.
    pub async fn insert_landing(&self, thread_key: &str, content: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO raw_landing (thread_key, content, landed_at) VALUES (?, ?, ?)",
        )
        .bind(thread_key)
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn landing_thread_keys(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT thread_key FROM raw_landing ORDER BY thread_key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("thread_key").map_err(StoreError::from))
            .collect()
    }

    pub async fn get_landing(&self, thread_key: &str) -> Result<Option<RawLanding>, StoreError> {
        let row = sqlx::query(
            "SELECT thread_key, content, landed_at FROM raw_landing WHERE thread_key = ?",
        )
        .bind(thread_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok::<_, StoreError>(RawLanding {
                thread_key: row.try_get("thread_key")?,
                content: row.try_get("content")?,
                landed_at: row.try_get::<DateTime<Utc>, _>("landed_at")?,
            })
        })
        .transpose()
    }

    /// Insert or fully overwrite the record for `record.message_id`.
    pub async fn upsert_full_record(&self, record: &FullRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO full_records (
                message_id, thread_key, subject, from_address, to_address,
                date_ms, snippet, body_plain, body_html, labels, enriched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                thread_key = excluded.thread_key,
                subject = excluded.subject,
                from_address = excluded.from_address,
                to_address = excluded.to_address,
                date_ms = excluded.date_ms,
                snippet = excluded.snippet,
                body_plain = excluded.body_plain,
                body_html = excluded.body_html,
                labels = excluded.labels,
                enriched_at = excluded.enriched_at
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.thread_key)
        .bind(&record.subject)
        .bind(&record.from_address)
        .bind(&record.to_address)
        .bind(record.date_ms)
        .bind(&record.snippet)
        .bind(&record.body_plain)
        .bind(&record.body_html)
        .bind(record.labels.join(","))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_full_record(&self, message_id: &str) -> Result<Option<FullRecord>, StoreError> {
        let sql = format!("SELECT {FULL_RECORD_COLUMNS} FROM full_records WHERE message_id = ?");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(full_record_from_row).transpose()
    }

    pub async fn full_record_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT message_id FROM full_records ORDER BY message_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("message_id").map_err(StoreError::from))
            .collect()
    }

    /// Returns false when the record is missing or already carries this date.
    pub async fn update_record_date(&self, message_id: &str, date_ms: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE full_records SET date_ms = ? WHERE message_id = ? AND date_ms <> ?")
            .bind(date_ms)
            .bind(message_id)
            .bind(date_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records whose body mentions buy, stop and target, newest first.
    pub async fn extraction_candidates(&self) -> Result<Vec<ExtractionCandidate>, StoreError> {
        let sql = format!(
            r#"
            SELECT message_id, date_ms, {CANDIDATE_BODY} AS body
            FROM full_records
            WHERE LOWER({CANDIDATE_BODY}) LIKE '%buy%'
              AND LOWER({CANDIDATE_BODY}) LIKE '%stop%'
              AND LOWER({CANDIDATE_BODY}) LIKE '%target%'
            ORDER BY date_ms DESC, message_id ASC
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(ExtractionCandidate {
                    message_id: row.try_get("message_id")?,
                    date_ms: row.try_get("date_ms")?,
                    body: row.try_get("body")?,
                })
            })
            .collect()
    }

    pub async fn upsert_staging(&self, row: &StagingExtraction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO staging_extractions (
                message_id, ticker, signal_date, entry_date, buy_price,
                stop_price, target_price, raw_text, cleaned_text, extracted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                ticker = excluded.ticker,
                signal_date = excluded.signal_date,
                entry_date = excluded.entry_date,
                buy_price = excluded.buy_price,
                stop_price = excluded.stop_price,
                target_price = excluded.target_price,
                raw_text = excluded.raw_text,
                cleaned_text = excluded.cleaned_text,
                extracted_at = excluded.extracted_at
            "#,
        )
        .bind(&row.message_id)
        .bind(&row.ticker)
        .bind(row.signal_date)
        .bind(row.entry_date)
        .bind(row.buy_price)
        .bind(row.stop_price)
        .bind(row.target_price)
        .bind(&row.raw_text)
        .bind(&row.cleaned_text)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_staging(&self, message_id: &str) -> Result<Option<StagingExtraction>, StoreError> {
        let sql = format!("SELECT {STAGING_COLUMNS} FROM staging_extractions WHERE message_id = ?");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(staging_from_row).transpose()
    }

    pub async fn staging_rows(&self) -> Result<Vec<StagingExtraction>, StoreError> {
        let sql = format!("SELECT {STAGING_COLUMNS} FROM staging_extractions ORDER BY message_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(staging_from_row).collect()
    }

    /// Staging rows eligible for promotion, newest signal first.
    pub async fn clean_signals(&self) -> Result<Vec<CleanSignal>, StoreError> {
        let sql = format!(
            "SELECT {STAGING_COLUMNS} FROM staging_extractions WHERE {CLEAN_FILTER} \
             ORDER BY signal_date DESC, message_id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let staging = staging_from_row(row)?;
            // The SQL filter and the domain rule agree; anything else is skipped rather than promoted.
            if let Ok(clean) = CleanSignal::try_from(&staging) {
                out.push(clean);
            }
        }
        Ok(out)
    }

    pub async fn final_signal_for_date(&self, signal_date: i64) -> Result<Option<FinalSignal>, StoreError> {
        let sql = format!("SELECT {FINAL_COLUMNS} FROM final_signals WHERE signal_date = ? LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(signal_date)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(final_from_row).transpose()
    }

    pub async fn get_final_signal(&self, message_id: &str) -> Result<Option<FinalSignal>, StoreError> {
        let sql = format!("SELECT {FINAL_COLUMNS} FROM final_signals WHERE message_id = ?");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(final_from_row).transpose()
    }

    /// Insert-only. Returns false when the message or its signal date is already present.
    pub async fn insert_final_signal(&self, signal: &CleanSignal) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO final_signals (
                message_id, ticker, signal_date, entry_date,
                buy_price, stop_price, target_price, promoted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&signal.message_id)
        .bind(&signal.ticker)
        .bind(signal.signal_date)
        .bind(signal.entry_date)
        .bind(signal.buy_price)
        .bind(signal.stop_price)
        .bind(signal.target_price)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn final_signals(&self) -> Result<Vec<FinalSignal>, StoreError> {
        let sql = format!("SELECT {FINAL_COLUMNS} FROM final_signals ORDER BY signal_date ASC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(final_from_row).collect()
    }

    pub async fn counts(&self) -> Result<TableCounts, StoreError> {
        let clean_sql = format!("SELECT COUNT(*) FROM staging_extractions WHERE {CLEAN_FILTER}");
        Ok(TableCounts {
            raw_landing: self.count("SELECT COUNT(*) FROM raw_landing").await?,
            full_records: self.count("SELECT COUNT(*) FROM full_records").await?,
            staging_extractions: self.count("SELECT COUNT(*) FROM staging_extractions").await?,
            clean_signals: self.count(&clean_sql).await?,
            final_signals: self.count("SELECT COUNT(*) FROM final_signals").await?,
        })
    }

    async fn count(&self, sql: &str) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Furthest persisted stage for a message id (or a thread key, for landed threads).
    pub async fn message_stage(&self, message_id: &str) -> Result<Option<MessageStage>, StoreError> {
        if self.get_final_signal(message_id).await?.is_some() {
            return Ok(Some(MessageStage::Promoted));
        }

        if let Some(staging) = self.get_staging(message_id).await? {
            if staging.is_clean() {
                let occupied = self.final_signal_for_date(staging.signal_date).await?;
                if occupied.is_some_and(|f| f.message_id != message_id) {
                    return Ok(Some(MessageStage::DroppedDuplicateDate));
                }
            }
            return Ok(Some(if staging.has_signal() {
                MessageStage::ExtractedSignal
            } else {
                MessageStage::ExtractedEmpty
            }));
        }

        if self.get_full_record(message_id).await?.is_some() {
            return Ok(Some(MessageStage::Enriched));
        }

        if self.get_landing(message_id).await?.is_some() {
            return Ok(Some(MessageStage::Landed));
        }

        Ok(None)
    }
}

fn full_record_from_row(row: &SqliteRow) -> Result<FullRecord, StoreError> {
    let labels: String = row.try_get("labels")?;
    Ok(FullRecord {
        message_id: row.try_get("message_id")?,
        thread_key: row.try_get("thread_key")?,
        subject: row.try_get("subject")?,
        from_address: row.try_get("from_address")?,
        to_address: row.try_get("to_address")?,
        date_ms: row.try_get("date_ms")?,
        snippet: row.try_get("snippet")?,
        body_plain: row.try_get("body_plain")?,
        body_html: row.try_get("body_html")?,
        labels: labels
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

fn staging_from_row(row: &SqliteRow) -> Result<StagingExtraction, StoreError> {
    Ok(StagingExtraction {
        message_id: row.try_get("message_id")?,
        ticker: row.try_get("ticker")?,
        signal_date: row.try_get("signal_date")?,
        entry_date: row.try_get("entry_date")?,
        buy_price: row.try_get("buy_price")?,
        stop_price: row.try_get("stop_price")?,
        target_price: row.try_get("target_price")?,
        raw_text: row.try_get("raw_text")?,
        cleaned_text: row.try_get("cleaned_text")?,
    })
}

fn final_from_row(row: &SqliteRow) -> Result<FinalSignal, StoreError> {
    Ok(FinalSignal {
        message_id: row.try_get("message_id")?,
        ticker: row.try_get("ticker")?,
        signal_date: row.try_get("signal_date")?,
        entry_date: row.try_get("entry_date")?,
        buy_price: row.try_get("buy_price")?,
        stop_price: row.try_get("stop_price")?,
        target_price: row.try_get("target_price")?,
        promoted_at: row.try_get("promoted_at")?,
    })
}

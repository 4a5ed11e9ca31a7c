//! Parquet snapshot of the final signal store plus a digest manifest for downstream consumers.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sigmail_core::FinalSignal;
use sigmail_storage::SignalStore;
use tokio::{fs, task};
use tracing::info;

pub const SNAPSHOT_FILE: &str = "final_signals.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub async fn export_final_signals(store: &SignalStore, out_dir: &Path) -> Result<ExportManifest> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let signals = store.final_signals().await.context("reading final signals")?;
    let rows = signals.len();
    let dir = out_dir.to_path_buf();
    // Parquet encoding and hashing are synchronous file work.
    let entry = task::spawn_blocking(move || -> Result<ExportManifestFile> {
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        write_final_signals_parquet(&snapshot_path, &signals)?;
        manifest_entry("final_signals", &dir, &snapshot_path)
    })
    .await
    .context("joining snapshot writer")??;

    let manifest = ExportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        rows,
        files: vec![entry],
    };

    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(rows = manifest.rows, dir = %out_dir.display(), "final signals exported");
    Ok(manifest)
}

fn write_final_signals_parquet(path: &Path, signals: &[FinalSignal]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("message_id", DataType::Utf8, false),
        ArrowField::new("ticker", DataType::Utf8, false),
        ArrowField::new("signal_date", DataType::Int64, false),
        ArrowField::new("entry_date", DataType::Int64, false),
        ArrowField::new("buy_price", DataType::Float64, false),
        ArrowField::new("stop_price", DataType::Float64, false),
        ArrowField::new("target_price", DataType::Float64, false),
        ArrowField::new("promoted_at", DataType::Utf8, false),
    ]));

    let message_ids = StringArray::from(signals.iter().map(|s| s.message_id.as_str()).collect::<Vec<_>>());
    let tickers = StringArray::from(signals.iter().map(|s| s.ticker.as_str()).collect::<Vec<_>>());
    let signal_dates = Int64Array::from(signals.iter().map(|s| s.signal_date).collect::<Vec<_>>());
    let entry_dates = Int64Array::from(signals.iter().map(|s| s.entry_date).collect::<Vec<_>>());
    let buys = Float64Array::from(signals.iter().map(|s| s.buy_price).collect::<Vec<_>>());
    let stops = Float64Array::from(signals.iter().map(|s| s.stop_price).collect::<Vec<_>>());
    let targets = Float64Array::from(signals.iter().map(|s| s.target_price).collect::<Vec<_>>());
    let promoted = StringArray::from(
        signals
            .iter()
            .map(|s| s.promoted_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(message_ids),
            Arc::new(tickers),
            Arc::new(signal_dates),
            Arc::new(entry_dates),
            Arc::new(buys),
            Arc::new(stops),
            Arc::new(targets),
            Arc::new(promoted),
        ],
    )
    .context("building final signals record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigmail_core::CleanSignal;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_and_manifest_are_written() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("export.db").display());
        let store = SignalStore::connect(&sigmail_storage::StoreConfig::new(url))
            .await
            .expect("connect");
        store.migrate().await.expect("migrate");
        store
            .insert_final_signal(&CleanSignal {
                message_id: "wdg-1".into(),
                ticker: "WDG".into(),
                signal_date: 1_704_844_800_000,
                entry_date: 1_704_931_200_000,
                buy_price: 50.0,
                stop_price: 45.0,
                target_price: 65.0,
            })
            .await
            .expect("insert");

        let out = dir.path().join("snapshots");
        let manifest = export_final_signals(&store, &out).await.expect("export");
        assert_eq!(manifest.rows, 1);
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, SNAPSHOT_FILE);
        assert_eq!(manifest.files[0].sha256.len(), 64);

        let bytes = std::fs::read(out.join(SNAPSHOT_FILE)).expect("parquet written");
        assert_eq!(manifest.files[0].bytes, bytes.len() as u64);
        assert_eq!(&bytes[..4], b"PAR1");
        assert!(out.join(MANIFEST_FILE).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn empty_store_exports_an_empty_snapshot() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("empty.db").display());
        let store = SignalStore::connect(&sigmail_storage::StoreConfig::new(url))
            .await
            .expect("connect");
        store.migrate().await.expect("migrate");

        let out = dir.path().join("nested").join("snapshots");
        let manifest = export_final_signals(&store, &out).await.expect("export");
        assert_eq!(manifest.rows, 0);
        assert!(manifest.files[0].bytes > 0);
        assert!(out.join(SNAPSHOT_FILE).exists());
    }
}

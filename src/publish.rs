//! Publish loop.
//!
//! Every cycle locks the annotation store, stages its contents as a CSV
//! batch and uploads it.  The store is cleared only after the asset system
//! confirms the upload; on any failure the records stay put and ride along
//! with the next batch.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::asset::{AssetError, AssetSink};
use crate::config::Config;
use crate::history::UploadHistory;
use crate::lifecycle::pause;
use crate::store::AnnotationStore;
use crate::types::{AnnotationField, AnnotationRecord};

/// Default delay before the first publish cycle.
pub const DEFAULT_STAGGER_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub tenant: String,
    pub fields: Vec<AnnotationField>,
    pub frequency: Duration,
    pub stagger: Duration,
}

impl From<&Config> for PublishSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            tenant: cfg.tenant.clone(),
            fields: cfg.annotations.clone(),
            frequency: Duration::from_secs(cfg.frequency_secs),
            stagger: Duration::from_secs(cfg.publish_stagger_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to stage batch: {0}")]
    Stage(#[from] std::io::Error),
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] csv::Error),
    #[error(transparent)]
    Upload(#[from] AssetError),
    #[error("asset system rejected batch: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nothing was pending.
    Empty,
    /// The given number of annotations were uploaded and cleared.
    Published(usize),
}

/// Runs the publish loop until `shutdown` is cancelled.
pub async fn run_publish(
    sink: Arc<dyn AssetSink>,
    store: AnnotationStore,
    history: Arc<UploadHistory>,
    settings: PublishSettings,
    shutdown: CancellationToken,
) {
    info!(
        "Publishing {} to tenant {} every {}s",
        settings
            .fields
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(","),
        settings.tenant,
        settings.frequency.as_secs()
    );

    if pause(settings.stagger, &shutdown).await {
        info!("Cleaning up publish loop");
        return;
    }

    loop {
        match publish_once(sink.as_ref(), &store, &history, &settings).await {
            Ok(PublishOutcome::Published(count)) => info!("Uploaded {} annotations", count),
            Ok(PublishOutcome::Empty) => info!("No new annotations to upload"),
            Err(e) => error!("Failed to upload annotations: {}", e),
        }

        info!("Waiting {} seconds", settings.frequency.as_secs());
        if pause(settings.frequency, &shutdown).await {
            info!("Cleaning up publish loop");
            return;
        }
    }
}

/// One publish attempt.
///
/// The store lock is held from the read through the clear, so upserts
/// issued meanwhile wait and land in the next batch.
pub async fn publish_once(
    sink: &dyn AssetSink,
    store: &AnnotationStore,
    history: &UploadHistory,
    settings: &PublishSettings,
) -> Result<PublishOutcome, PublishError> {
    if store.is_empty().await {
        return Ok(PublishOutcome::Empty);
    }
    let drain = store.drain().await;
    if drain.is_empty() {
        return Ok(PublishOutcome::Empty);
    }
    info!("Writing annotations (total: {})", drain.len());

    let staged = stage_batch(&settings.fields, drain.records())?;
    let uploaded = sink.upload(&settings.tenant, staged.path()).await;
    if let Err(e) = staged.close() {
        warn!("Failed to remove staged batch: {}", e);
    }

    let resp = uploaded?;
    if !resp.ok {
        return Err(PublishError::Rejected(resp.body));
    }

    let count = drain.len();
    history.record(format!("{} annotations", count));
    drain.commit();
    Ok(PublishOutcome::Published(count))
}

/// Header row followed by one row per record, sorted by IP.
pub fn batch_rows<'a>(
    fields: &[AnnotationField],
    records: impl Iterator<Item = &'a AnnotationRecord>,
) -> Vec<Vec<String>> {
    let mut header = Vec::with_capacity(fields.len() + 1);
    header.push("IP".to_string());
    header.extend(fields.iter().map(|f| f.label().to_string()));

    let mut rows: Vec<Vec<String>> = records
        .map(|record| {
            let mut row = Vec::with_capacity(fields.len() + 1);
            row.push(record.ip.clone());
            row.extend(
                fields
                    .iter()
                    .map(|f| record.field(*f).unwrap_or_default().to_string()),
            );
            row
        })
        .collect();
    rows.sort();

    let mut batch = Vec::with_capacity(rows.len() + 1);
    batch.push(header);
    batch.extend(rows);
    batch
}

fn stage_batch<'a>(
    fields: &[AnnotationField],
    records: impl Iterator<Item = &'a AnnotationRecord>,
) -> Result<NamedTempFile, PublishError> {
    let mut file = tempfile::Builder::new()
        .prefix("annotations-")
        .suffix(".csv")
        .tempfile()?;
    {
        let mut writer = csv::Writer::from_writer(file.as_file_mut());
        for row in batch_rows(fields, records) {
            writer.write_record(&row)?;
        }
        writer.flush()?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::UploadResponse;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Records every staged payload and answers from a script; once the
    /// script runs out every upload succeeds.  Each upload takes `delay`.
    #[derive(Default)]
    struct ScriptedSink {
        delay: Duration,
        script: Mutex<Vec<Result<UploadResponse, AssetError>>>,
        payloads: Mutex<Vec<Vec<Vec<String>>>>,
        paths: Mutex<Vec<PathBuf>>,
    }

    impl ScriptedSink {
        fn failing_then_ok(failures: Vec<Result<UploadResponse, AssetError>>) -> Self {
            let mut script = failures;
            script.reverse();
            Self {
                script: Mutex::new(script),
                ..Default::default()
            }
        }

        fn payloads(&self) -> Vec<Vec<Vec<String>>> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AssetSink for ScriptedSink {
        async fn upload(&self, tenant: &str, payload: &Path) -> Result<UploadResponse, AssetError> {
            assert_eq!(tenant, "tenant-1");
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .from_path(payload)
                .unwrap();
            let rows: Vec<Vec<String>> = reader
                .records()
                .map(|r| r.unwrap().iter().map(String::from).collect())
                .collect();
            self.payloads.lock().unwrap().push(rows);
            self.paths.lock().unwrap().push(payload.to_path_buf());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            self.script.lock().unwrap().pop().unwrap_or(Ok(UploadResponse {
                ok: true,
                body: String::new(),
            }))
        }
    }

    fn settings() -> PublishSettings {
        PublishSettings {
            tenant: "tenant-1".into(),
            fields: AnnotationField::defaults(),
            frequency: Duration::from_millis(10),
            stagger: Duration::from_millis(0),
        }
    }

    fn record(ip: &str, name: &str) -> AnnotationRecord {
        AnnotationRecord {
            ip: ip.into(),
            name: Some(name.into()),
            host: Some("esxi1".into()),
            datastore: Some("ds1".into()),
            port_group: Some("VM Network".into()),
        }
    }

    fn rejected() -> Result<UploadResponse, AssetError> {
        Ok(UploadResponse {
            ok: false,
            body: "tenant not found".into(),
        })
    }

    #[tokio::test]
    async fn publishes_scenario_batch() {
        let store = AnnotationStore::new();
        let history = UploadHistory::default();
        let sink = ScriptedSink::default();
        store
            .upsert(AnnotationRecord {
                ip: "10.0.0.5".into(),
                name: Some("web1".into()),
                host: Some("esxi1".into()),
                datastore: Some("ds1".into()),
                port_group: None,
            })
            .await;

        let outcome = publish_once(&sink, &store, &history, &settings())
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Published(1));
        assert_eq!(
            sink.payloads(),
            vec![vec![
                vec!["IP", "VM Port Group", "VM Name", "VM Host Name", "VM Datastore"],
                vec!["10.0.0.5", "", "web1", "esxi1", "ds1"],
            ]]
        );
        assert!(store.is_empty().await);
        let entries = history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "1 annotations");
    }

    #[tokio::test]
    async fn empty_store_skips_upload() {
        let store = AnnotationStore::new();
        let history = UploadHistory::default();
        let sink = ScriptedSink::default();

        let outcome = publish_once(&sink, &store, &history, &settings())
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Empty);
        assert!(sink.payloads().is_empty());
        assert!(history.entries().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_keeps_batch_for_retry() {
        let store = AnnotationStore::new();
        let history = UploadHistory::default();
        let sink = ScriptedSink::failing_then_ok(vec![
            rejected(),
            Err(AssetError::InvalidRequest("connection reset".into())),
        ]);
        store.upsert(record("10.0.0.5", "web1")).await;
        store.upsert(record("10.0.0.6", "web2")).await;

        let first = publish_once(&sink, &store, &history, &settings()).await;
        assert!(matches!(first, Err(PublishError::Rejected(body)) if body == "tenant not found"));
        assert_eq!(store.len().await, 2);

        let second = publish_once(&sink, &store, &history, &settings()).await;
        assert!(matches!(second, Err(PublishError::Upload(_))));

        store.upsert(record("10.0.0.7", "web3")).await;
        let third = publish_once(&sink, &store, &history, &settings())
            .await
            .unwrap();
        assert_eq!(third, PublishOutcome::Published(3));

        let payloads = sink.payloads();
        assert_eq!(payloads[0], payloads[1]);
        assert_eq!(payloads[0].len(), 3);
        // the retried rows are carried over verbatim, plus the new one
        assert_eq!(&payloads[2][..3], &payloads[0][..]);
        assert_eq!(payloads[2][3][0], "10.0.0.7");
        assert!(store.is_empty().await);
        assert_eq!(history.entries().len(), 1);
    }

    #[tokio::test]
    async fn batch_has_one_row_per_ip() {
        let store = AnnotationStore::new();
        let history = UploadHistory::default();
        let sink = ScriptedSink::default();
        for n in 0..25 {
            store
                .upsert(record(&format!("10.0.2.{}", n), &format!("vm{}", n)))
                .await;
        }

        publish_once(&sink, &store, &history, &settings())
            .await
            .unwrap();

        let payload = &sink.payloads()[0];
        assert_eq!(payload.len(), 26);
        let mut ips: Vec<_> = payload[1..].iter().map(|row| row[0].clone()).collect();
        ips.dedup();
        assert_eq!(ips.len(), 25);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn staged_file_is_removed_after_attempt() {
        let store = AnnotationStore::new();
        let history = UploadHistory::default();
        let sink = ScriptedSink::failing_then_ok(vec![rejected()]);
        store.upsert(record("10.0.0.5", "web1")).await;

        let _ = publish_once(&sink, &store, &history, &settings()).await;
        publish_once(&sink, &store, &history, &settings())
            .await
            .unwrap();

        for path in sink.paths.lock().unwrap().iter() {
            assert!(!path.exists(), "{} left behind", path.display());
        }
    }

    #[test]
    fn rows_follow_configured_field_order() {
        let records = [record("10.0.0.5", "web1")];
        let rows = batch_rows(
            &[AnnotationField::Datastore, AnnotationField::Name],
            records.iter(),
        );

        assert_eq!(
            rows,
            vec![
                vec!["IP", "VM Datastore", "VM Name"],
                vec!["10.0.0.5", "ds1", "web1"],
            ]
        );
    }

    #[tokio::test]
    async fn loop_publishes_then_stops() {
        let store = AnnotationStore::new();
        let history = Arc::new(UploadHistory::default());
        let sink = Arc::new(ScriptedSink::default());
        let shutdown = CancellationToken::new();
        store.upsert(record("10.0.0.5", "web1")).await;

        let handle = tokio::spawn(run_publish(
            sink.clone(),
            store.clone(),
            Arc::clone(&history),
            settings(),
            shutdown.clone(),
        ));
        while history.entries().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.payloads().len(), 1);
    }

    #[tokio::test]
    async fn stop_does_not_interrupt_upload_in_flight() {
        let store = AnnotationStore::new();
        let history = Arc::new(UploadHistory::default());
        let sink = Arc::new(ScriptedSink {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let shutdown = CancellationToken::new();
        store.upsert(record("10.0.0.5", "web1")).await;

        let handle = tokio::spawn(run_publish(
            sink.clone(),
            store.clone(),
            Arc::clone(&history),
            settings(),
            shutdown.clone(),
        ));
        while sink.payloads().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.entries().len(), 1);
        assert!(store.is_empty().await);
        assert_eq!(sink.payloads().len(), 1);
    }

    #[tokio::test]
    async fn stop_during_startup_delay_skips_publishing() {
        let store = AnnotationStore::new();
        let history = Arc::new(UploadHistory::default());
        let sink = Arc::new(ScriptedSink::default());
        let shutdown = CancellationToken::new();
        store.upsert(record("10.0.0.5", "web1")).await;

        let handle = tokio::spawn(run_publish(
            sink.clone(),
            store.clone(),
            Arc::clone(&history),
            PublishSettings {
                stagger: Duration::from_secs(60),
                ..settings()
            },
            shutdown.clone(),
        ));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(sink.payloads().is_empty());
        assert!(history.entries().is_empty());
        assert_eq!(store.len().await, 1);
    }
}

//! Receipt ingestion pipeline.
//!
//! Sequences one upload through the components and owns the cleanup policy:
//!
//! ```text
//! Received ─▶ Validated ─▶ Recognized ─▶ DuplicateChecked ─▶ Committed ─▶ CleanedUp
//!     │           │             │                │               │
//!     └───────────┴─────────────┴────────────────┴───────────────┴──▶ Aborted
//! ```
//!
//! The stored artifact is held by an
//! [`ArtifactGuard`](crate::artifact::ArtifactGuard) from the moment it is
//! created, so it is deleted on every path out of the pipeline: success,
//! rejection, internal error, or cancellation of the request future.
//!
//! Nothing here retries. A failed recognition call is reported once and the
//! caller may resubmit.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::artifact::{ArtifactHandle, ArtifactStore};
use crate::config::Config;
use crate::duplicate::DuplicateDetector;
use crate::error::IngestError;
use crate::ledger::Ledger;
use crate::models::{NewReceipt, PointsLedgerEntry, Receipt, RecognitionResult};
use crate::recognition::{HttpRecognizer, Recognizer};

/// Raw upload as received from the caller.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub media_type: String,
}

/// Position of a request in the ingestion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Received,
    Validated,
    Recognized,
    DuplicateChecked,
    Committed,
    CleanedUp,
    Aborted,
}

impl IngestStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestStage::CleanedUp | IngestStage::Aborted)
    }
}

/// Result of a successful ingestion.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub receipt: Receipt,
    pub entry: PointsLedgerEntry,
    pub message: String,
}

/// Drives uploads through storage, recognition, dedup, and the ledger.
pub struct Ingestor {
    artifacts: ArtifactStore,
    recognizer: Arc<dyn Recognizer>,
    detector: DuplicateDetector,
    ledger: Ledger,
    points_per_receipt: i64,
}

impl Ingestor {
    pub fn new(
        artifacts: ArtifactStore,
        recognizer: Arc<dyn Recognizer>,
        detector: DuplicateDetector,
        ledger: Ledger,
        points_per_receipt: i64,
    ) -> Self {
        Self {
            artifacts,
            recognizer,
            detector,
            ledger,
            points_per_receipt,
        }
    }

    /// Wires every component from configuration around one pool.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let recognizer = HttpRecognizer::new(&config.recognition)?;
        Self::with_recognizer(config, pool, Arc::new(recognizer))
    }

    /// Like [`Ingestor::from_config`] with a caller-supplied recognizer.
    pub fn with_recognizer(
        config: &Config,
        pool: SqlitePool,
        recognizer: Arc<dyn Recognizer>,
    ) -> anyhow::Result<Self> {
        let artifacts = ArtifactStore::new(&config.uploads.dir, config.uploads.max_bytes);
        let window = Duration::try_seconds(config.rewards.duplicate_window_secs).ok_or_else(|| {
            anyhow::anyhow!(
                "rewards.duplicate_window_secs out of range: {}",
                config.rewards.duplicate_window_secs
            )
        })?;
        let detector = DuplicateDetector::new(pool.clone(), window);
        let ledger = Ledger::new(pool);
        Ok(Self::new(
            artifacts,
            recognizer,
            detector,
            ledger,
            config.rewards.points_per_receipt,
        ))
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub async fn ingest(&self, upload: Option<Upload>) -> Result<IngestOutcome, IngestError> {
        self.ingest_at(upload, Utc::now()).await
    }

    /// Runs the pipeline with `now` as the processing time.
    pub async fn ingest_at(
        &self,
        upload: Option<Upload>,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let mut stage = IngestStage::Received;

        let result = match intake(upload, &mut stage) {
            Ok(upload) => self.process(&upload, now, &mut stage).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    receipt_id = outcome.receipt.id,
                    merchant = %outcome.receipt.merchant,
                    total = %outcome.receipt.total_amount,
                    points = outcome.entry.amount,
                    stage = ?stage,
                    "receipt ingested"
                );
            }
            Err(err) if err.status().is_server_error() => {
                tracing::error!(stage = ?stage, code = err.code(), error = ?err, "ingestion aborted");
            }
            Err(err) => {
                tracing::info!(stage = ?stage, code = err.code(), "ingestion rejected");
            }
        }

        result
    }

    async fn process(
        &self,
        upload: &Upload,
        now: DateTime<Utc>,
        stage: &mut IngestStage,
    ) -> Result<IngestOutcome, IngestError> {
        let guard = match self
            .artifacts
            .save(&upload.bytes, &upload.file_name, &upload.media_type)
            .await
        {
            Ok(guard) => guard,
            Err(err) => {
                *stage = IngestStage::Aborted;
                return Err(err);
            }
        };
        *stage = IngestStage::Validated;
        tracing::debug!(
            artifact = %guard.handle().file_name(),
            size = guard.handle().size(),
            media_type = %guard.handle().media_type(),
            "artifact stored"
        );

        let result = self.recognize_and_commit(guard.handle(), now, stage).await;

        // Cleanup runs whatever the outcome; a failed delete leaves removal to the guard's Drop.
        if let Err(e) = guard.cleanup(&self.artifacts).await {
            tracing::warn!(error = %e, "artifact cleanup failed");
        }

        *stage = match result {
            Ok(_) => IngestStage::CleanedUp,
            Err(_) => IngestStage::Aborted,
        };
        result
    }

    async fn recognize_and_commit(
        &self,
        artifact: &ArtifactHandle,
        now: DateTime<Utc>,
        stage: &mut IngestStage,
    ) -> Result<IngestOutcome, IngestError> {
        let recognized: RecognitionResult = self.recognizer.recognize(artifact).await?;
        *stage = IngestStage::Recognized;
        tracing::debug!(
            merchant = %recognized.merchant,
            total = %recognized.total,
            confidence = recognized.confidence,
            "receipt recognized"
        );

        if self
            .detector
            .is_duplicate_at(&recognized.merchant, recognized.total, now)
            .await?
        {
            return Err(IngestError::DuplicateReceipt);
        }
        *stage = IngestStage::DuplicateChecked;

        let new = NewReceipt::from_recognition(&recognized, self.points_per_receipt);
        let (receipt, entry) = self.ledger.credit(&new, now).await?;
        *stage = IngestStage::Committed;

        let message = format!(
            "Receipt processed successfully! +{} points earned.",
            entry.amount
        );
        Ok(IngestOutcome {
            receipt,
            entry,
            message,
        })
    }
}

/// Accepts the upload into the pipeline, aborting when there is none.
fn intake(upload: Option<Upload>, stage: &mut IngestStage) -> Result<Upload, IngestError> {
    match upload {
        Some(upload) => Ok(upload),
        None => {
            *stage = IngestStage::Aborted;
            Err(IngestError::NoFileProvided)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::from_cents;
    use crate::recognition::RecognitionError;
    use crate::{db, migrate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Recognizer returning scripted outcomes and counting calls.
    struct ScriptedRecognizer {
        outcomes: Mutex<Vec<Result<RecognitionResult, RecognitionError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn new(outcomes: Vec<Result<RecognitionResult, RecognitionError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Recognizer for ScriptedRecognizer {
        async fn recognize(
            &self,
            artifact: &ArtifactHandle,
        ) -> Result<RecognitionResult, RecognitionError> {
            assert!(artifact.path().exists(), "artifact must exist during recognition");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Err(RecognitionError::Unavailable("script exhausted".into()));
            }
            outcomes.remove(0)
        }
    }

    /// Recognizer that never answers, standing in for a hung OCR call.
    struct StalledRecognizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Recognizer for StalledRecognizer {
        async fn recognize(
            &self,
            _artifact: &ArtifactHandle,
        ) -> Result<RecognitionResult, RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn recognized(merchant: &str, cents: i64) -> Result<RecognitionResult, RecognitionError> {
        Ok(RecognitionResult {
            merchant: merchant.to_string(),
            total: from_cents(cents),
            raw_text: format!("{}\nTOTAL {}", merchant, from_cents(cents)),
            confidence: 91.0,
        })
    }

    fn jpeg(size: usize) -> Option<Upload> {
        Some(Upload {
            bytes: vec![0xAB; size],
            file_name: "receipt.jpg".to_string(),
            media_type: "image/jpeg".to_string(),
        })
    }

    async fn setup(recognizer: Arc<dyn Recognizer>) -> (TempDir, Ingestor) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal();
        config.db.path = tmp.path().join("rewards.sqlite");
        config.uploads.dir = tmp.path().join("uploads");
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let ingestor = Ingestor::with_recognizer(&config, pool, recognizer).unwrap();
        (tmp, ingestor)
    }

    #[tokio::test]
    async fn test_success_credits_once_and_cleans_up() {
        let recognizer = ScriptedRecognizer::new(vec![recognized("Joe's Diner", 1842)]);
        let (_tmp, ingestor) = setup(recognizer.clone()).await;

        let before = ingestor.ledger().total_points().await.unwrap();
        let outcome = ingestor.ingest(jpeg(5 * 1024 * 1024)).await.unwrap();

        assert_eq!(outcome.receipt.points_awarded, 25);
        assert_eq!(outcome.entry.amount, 25);
        assert_eq!(outcome.entry.receipt_id, Some(outcome.receipt.id));
        assert_eq!(outcome.message, "Receipt processed successfully! +25 points earned.");
        assert_eq!(ingestor.ledger().total_points().await.unwrap(), before + 25);
        assert_eq!(ingestor.ledger().receipt_count().await.unwrap(), 1);
        assert_eq!(ingestor.ledger().list_entries().await.unwrap().len(), 1);
        assert_eq!(ingestor.artifacts().count().await.unwrap(), 0);
        assert_eq!(recognizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let recognizer = ScriptedRecognizer::new(vec![]);
        let (_tmp, ingestor) = setup(recognizer.clone()).await;

        let err = ingestor.ingest(None).await.unwrap_err();
        assert!(matches!(err, IngestError::NoFileProvided));
        assert_eq!(recognizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_pdf_rejected_before_recognition() {
        let recognizer = ScriptedRecognizer::new(vec![recognized("Acme", 100)]);
        let (_tmp, ingestor) = setup(recognizer.clone()).await;

        let upload = Upload {
            bytes: b"%PDF-1.7".to_vec(),
            file_name: "receipt.pdf".to_string(),
            media_type: "application/pdf".to_string(),
        };
        let err = ingestor.ingest(Some(upload)).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidMediaType(_)));
        assert_eq!(recognizer.calls(), 0);
        assert_eq!(ingestor.artifacts().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversize_rejected() {
        let recognizer = ScriptedRecognizer::new(vec![recognized("Acme", 100)]);
        let (_tmp, ingestor) = setup(recognizer.clone()).await;

        let err = ingestor.ingest(jpeg(10 * 1024 * 1024 + 1)).await.unwrap_err();
        assert!(matches!(err, IngestError::SizeExceeded { .. }));
        assert_eq!(recognizer.calls(), 0);
        assert_eq!(ingestor.artifacts().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recognition_failures_clean_up() {
        let recognizer = ScriptedRecognizer::new(vec![
            Err(RecognitionError::Unavailable("request timed out after 30s".into())),
            Err(RecognitionError::Rejected),
        ]);
        let (_tmp, ingestor) = setup(recognizer.clone()).await;

        let err = ingestor.ingest(jpeg(64)).await.unwrap_err();
        assert!(matches!(err, IngestError::RecognitionUnavailable(_)));
        assert_eq!(ingestor.artifacts().count().await.unwrap(), 0);

        let err = ingestor.ingest(jpeg(64)).await.unwrap_err();
        assert!(matches!(err, IngestError::RecognitionRejected));
        assert_eq!(ingestor.artifacts().count().await.unwrap(), 0);

        assert_eq!(recognizer.calls(), 2);
        assert_eq!(ingestor.ledger().receipt_count().await.unwrap(), 0);
        assert_eq!(ingestor.ledger().total_points().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_window() {
        let recognizer = ScriptedRecognizer::new(vec![
            recognized("Acme", 1250),
            recognized("Acme", 1250),
            recognized("Acme", 1250),
        ]);
        let (_tmp, ingestor) = setup(recognizer).await;
        let t = Utc::now();

        ingestor.ingest_at(jpeg(64), t).await.unwrap();

        let err = ingestor
            .ingest_at(jpeg(64), t + Duration::minutes(30))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::DuplicateReceipt));
        assert_eq!(ingestor.artifacts().count().await.unwrap(), 0);

        ingestor
            .ingest_at(jpeg(64), t + Duration::minutes(90))
            .await
            .unwrap();

        assert_eq!(ingestor.ledger().receipt_count().await.unwrap(), 2);
        assert_eq!(ingestor.ledger().total_points().await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_commit_failure_is_internal_and_cleans_up() {
        let recognizer = ScriptedRecognizer::new(vec![recognized("Acme", 1250)]);
        let (_tmp, ingestor) = setup(recognizer).await;
        sqlx::query("DROP TABLE points_ledger")
            .execute(ingestor.ledger().pool())
            .await
            .unwrap();

        let err = ingestor.ingest(jpeg(64)).await.unwrap_err();
        assert!(matches!(err, IngestError::Internal(_)));
        assert_eq!(ingestor.artifacts().count().await.unwrap(), 0);
        assert_eq!(ingestor.ledger().receipt_count().await.unwrap(), 0);
    }

    #[test]
    fn test_terminal_stages() {
        assert!(IngestStage::CleanedUp.is_terminal());
        assert!(IngestStage::Aborted.is_terminal());
        assert!(!IngestStage::Committed.is_terminal());
        assert!(!IngestStage::Received.is_terminal());
    }

    #[test]
    fn test_missing_upload_aborts() {
        let mut stage = IngestStage::Received;
        let err = intake(None, &mut stage).unwrap_err();
        assert!(matches!(err, IngestError::NoFileProvided));
        assert_eq!(stage, IngestStage::Aborted);

        let mut stage = IngestStage::Received;
        assert!(intake(jpeg(8), &mut stage).is_ok());
        assert_eq!(stage, IngestStage::Received);
    }

    #[tokio::test]
    async fn test_dropped_request_removes_artifact() {
        let recognizer = Arc::new(StalledRecognizer {
            calls: AtomicUsize::new(0),
        });
        let (_tmp, ingestor) = setup(recognizer.clone()).await;

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            ingestor.ingest(jpeg(1024 * 1024)),
        )
        .await;

        assert!(result.is_err(), "stalled ingestion should not complete");
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ingestor.artifacts().count().await.unwrap(), 0);
        assert_eq!(ingestor.ledger().receipt_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_request_during_save_leaves_no_file() {
        let recognizer = ScriptedRecognizer::new(vec![]);
        let (_tmp, ingestor) = setup(recognizer).await;

        for i in 0..20u64 {
            let _ = tokio::time::timeout(
                std::time::Duration::from_micros(i * 250),
                ingestor.ingest(jpeg(8 * 1024 * 1024)),
            )
            .await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let mut count = ingestor.artifacts().count().await.unwrap();
        for _ in 0..100 {
            if count == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            count = ingestor.artifacts().count().await.unwrap();
        }
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_window_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal();
        config.db.path = tmp.path().join("rewards.sqlite");
        config.rewards.duplicate_window_secs = i64::MAX;
        let pool = db::connect(&config).await.unwrap();

        let result = Ingestor::with_recognizer(&config, pool, ScriptedRecognizer::new(vec![]));
        assert!(result.is_err());
    }
}

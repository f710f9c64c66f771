//! Duplicate-submission guard.
//!
//! A receipt counts as a duplicate when a previously recorded receipt has the
//! exact same merchant and total and was processed within the trailing
//! window (default one hour). The check runs outside the commit transaction,
//! so two concurrent submissions of the same pair can both pass it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;

use crate::models::to_cents;

#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    pool: SqlitePool,
    window: Duration,
}

impl DuplicateDetector {
    pub fn new(pool: SqlitePool, window: Duration) -> Self {
        Self { pool, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Checks against the current time.
    pub async fn is_duplicate(&self, merchant: &str, total: Decimal) -> Result<bool> {
        self.is_duplicate_at(merchant, total, Utc::now()).await
    }

    /// Checks for a matching receipt processed after `now - window`.
    pub async fn is_duplicate_at(
        &self,
        merchant: &str,
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let cents = to_cents(total)
            .ok_or_else(|| anyhow::anyhow!("total out of range: {}", total))?;
        let since = now
            .checked_sub_signed(self.window)
            .ok_or_else(|| anyhow::anyhow!("duplicate window out of range: {}", self.window))?
            .timestamp();

        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM receipts
                WHERE merchant = ? AND total_cents = ? AND processed_at > ?
            )
            "#,
        )
        .bind(merchant)
        .bind(cents)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::models::{from_cents, NewReceipt};
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Ledger, DuplicateDetector) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("test.sqlite"))
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let ledger = Ledger::new(pool.clone());
        let detector = DuplicateDetector::new(pool, Duration::hours(1));
        (tmp, ledger, detector)
    }

    fn receipt(merchant: &str, cents: i64) -> NewReceipt {
        NewReceipt {
            merchant: merchant.to_string(),
            total: from_cents(cents),
            points_awarded: 25,
            raw_ocr_text: None,
            confidence: 90.0,
        }
    }

    #[tokio::test]
    async fn test_empty_ledger_has_no_duplicates() {
        let (_tmp, _ledger, detector) = setup().await;
        assert!(!detector.is_duplicate("Acme", from_cents(1250)).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_boundaries() {
        let (_tmp, ledger, detector) = setup().await;
        let t = Utc::now();
        ledger.credit(&receipt("Acme", 1250), t).await.unwrap();

        let at_30 = t + Duration::minutes(30);
        let at_90 = t + Duration::minutes(90);
        assert!(detector.is_duplicate_at("Acme", from_cents(1250), at_30).await.unwrap());
        assert!(!detector.is_duplicate_at("Acme", from_cents(1250), at_90).await.unwrap());
    }

    #[tokio::test]
    async fn test_exact_match_only() {
        let (_tmp, ledger, detector) = setup().await;
        let t = Utc::now();
        ledger.credit(&receipt("Acme", 1250), t).await.unwrap();

        assert!(!detector.is_duplicate_at("acme", from_cents(1250), t).await.unwrap());
        assert!(!detector.is_duplicate_at("Acme ", from_cents(1250), t).await.unwrap());
        assert!(!detector.is_duplicate_at("Acme", from_cents(1251), t).await.unwrap());
        assert!(detector.is_duplicate_at("Acme", from_cents(1250), t).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_beyond_calendar_is_error() {
        let (_tmp, ledger, _) = setup().await;
        let window = Duration::try_days(100_000_000).unwrap();
        let detector = DuplicateDetector::new(ledger.pool().clone(), window);

        let err = detector
            .is_duplicate("Acme", from_cents(1250))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}

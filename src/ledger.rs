//! Receipt and points persistence.
//!
//! A credit is a receipt row plus one `earned` row in `points_ledger`
//! referencing it. [`Ledger::credit`] writes both inside a single
//! transaction, so either both exist or neither does. Rows are never updated
//! or deleted; the balance is the sum of all ledger amounts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::models::{from_cents, to_cents, NewReceipt, PointsLedgerEntry, Receipt, TransactionKind};

/// Owned handle to the receipts and points tables.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Records a receipt and its `earned` entry atomically.
    pub async fn credit(
        &self,
        new: &NewReceipt,
        processed_at: DateTime<Utc>,
    ) -> Result<(Receipt, PointsLedgerEntry)> {
        let ts = processed_at.timestamp();
        let mut tx = self.pool.begin().await?;

        let receipt = record_receipt(&mut tx, new, ts).await?;
        let entry = record_transaction(
            &mut tx,
            TransactionKind::Earned,
            receipt.points_awarded,
            Some(receipt.id),
            ts,
        )
        .await?;

        tx.commit().await.context("Failed to commit credit")?;
        Ok((receipt, entry))
    }

    /// Current balance. Zero for an empty ledger.
    pub async fn total_points(&self) -> Result<i64> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(amount), 0) FROM points_ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    /// All receipts, newest first.
    pub async fn list_receipts(&self) -> Result<Vec<Receipt>> {
        let rows = sqlx::query(
            r#"
            SELECT id, merchant, total_cents, points_awarded, raw_ocr_text, confidence, processed_at
            FROM receipts
            ORDER BY processed_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(receipt_from_row).collect())
    }

    /// All ledger entries in insertion order.
    pub async fn list_entries(&self) -> Result<Vec<PointsLedgerEntry>> {
        let rows = sqlx::query(
            "SELECT id, transaction_type, amount, receipt_id, created_at FROM points_ledger ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn receipt_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM receipts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Sum of all receipt totals.
    pub async fn total_spent(&self) -> Result<Decimal> {
        let cents: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(total_cents), 0) FROM receipts")
            .fetch_one(&self.pool)
            .await?;
        Ok(from_cents(cents))
    }
}

/// Inserts a receipt row. `processed_at` is fixed here and never changes.
pub async fn record_receipt(
    conn: &mut SqliteConnection,
    new: &NewReceipt,
    processed_at: i64,
) -> Result<Receipt> {
    let total_cents =
        to_cents(new.total).ok_or_else(|| anyhow::anyhow!("total out of range: {}", new.total))?;

    let result = sqlx::query(
        r#"
        INSERT INTO receipts (merchant, total_cents, points_awarded, raw_ocr_text, confidence, processed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&new.merchant)
    .bind(total_cents)
    .bind(new.points_awarded)
    .bind(&new.raw_ocr_text)
    .bind(new.confidence)
    .bind(processed_at)
    .execute(&mut *conn)
    .await
    .context("Failed to insert receipt")?;

    Ok(Receipt {
        id: result.last_insert_rowid(),
        merchant: new.merchant.clone(),
        total_amount: from_cents(total_cents),
        points_awarded: new.points_awarded,
        raw_ocr_text: new.raw_ocr_text.clone(),
        confidence: new.confidence,
        processed_at,
    })
}

/// Appends a ledger entry.
pub async fn record_transaction(
    conn: &mut SqliteConnection,
    kind: TransactionKind,
    amount: i64,
    receipt_id: Option<i64>,
    created_at: i64,
) -> Result<PointsLedgerEntry> {
    let result = sqlx::query(
        "INSERT INTO points_ledger (transaction_type, amount, receipt_id, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(kind.as_str())
    .bind(amount)
    .bind(receipt_id)
    .bind(created_at)
    .execute(&mut *conn)
    .await
    .context("Failed to insert points transaction")?;

    Ok(PointsLedgerEntry {
        id: result.last_insert_rowid(),
        kind,
        amount,
        receipt_id,
        created_at,
    })
}

fn receipt_from_row(row: &SqliteRow) -> Receipt {
    Receipt {
        id: row.get("id"),
        merchant: row.get("merchant"),
        total_amount: from_cents(row.get("total_cents")),
        points_awarded: row.get("points_awarded"),
        raw_ocr_text: row.get("raw_ocr_text"),
        confidence: row.get("confidence"),
        processed_at: row.get("processed_at"),
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<PointsLedgerEntry> {
    let kind: String = row.get("transaction_type");
    Ok(PointsLedgerEntry {
        id: row.get("id"),
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| anyhow::anyhow!("unknown transaction type: {}", kind))?,
        amount: row.get("amount"),
        receipt_id: row.get("receipt_id"),
        created_at: row.get("created_at"),
    })
}

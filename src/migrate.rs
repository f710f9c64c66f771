use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the schema on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // AUTOINCREMENT: receipt ids are never reused, even after the max row is gone
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS receipts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            merchant TEXT NOT NULL,
            total_cents INTEGER NOT NULL,
            points_awarded INTEGER NOT NULL,
            raw_ocr_text TEXT,
            confidence REAL NOT NULL,
            processed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS points_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_type TEXT NOT NULL DEFAULT 'earned',
            amount INTEGER NOT NULL,
            receipt_id INTEGER,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (receipt_id) REFERENCES receipts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_receipts_dedup ON receipts(merchant, total_cents, processed_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_receipts_processed_at ON receipts(processed_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_points_ledger_receipt_id ON points_ledger(receipt_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

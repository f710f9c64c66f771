//! Ledger summary for the `rewards stats` command.
//!
//! Shows how many receipts were credited, how much was spent across them,
//! the current balance, and a per-merchant breakdown.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::ledger::Ledger;
use crate::models::from_cents;

/// Per-merchant receipt totals.
struct MerchantStats {
    merchant: String,
    receipt_count: i64,
    total_cents: i64,
    last_processed_at: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let ledger = Ledger::new(pool.clone());

    let receipt_count = ledger.receipt_count().await?;
    let total_spent = ledger.total_spent().await?;
    let total_points = ledger.total_points().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Receipt Rewards — Ledger Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Receipts:    {}", receipt_count);
    println!("  Spent:       ${:.2}", total_spent);
    println!("  Points:      {}", total_points);

    let rows = sqlx::query(
        r#"
        SELECT
            merchant,
            COUNT(*) AS receipt_count,
            SUM(total_cents) AS total_cents,
            MAX(processed_at) AS last_processed_at
        FROM receipts
        GROUP BY merchant
        ORDER BY receipt_count DESC, merchant ASC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let merchants: Vec<MerchantStats> = rows
        .iter()
        .map(|row| MerchantStats {
            merchant: row.get("merchant"),
            receipt_count: row.get("receipt_count"),
            total_cents: row.get("total_cents"),
            last_processed_at: row.get("last_processed_at"),
        })
        .collect();

    if !merchants.is_empty() {
        println!();
        println!("  By merchant:");
        println!(
            "  {:<28} {:>8} {:>12}   {}",
            "MERCHANT", "RECEIPTS", "SPENT", "LAST SEEN"
        );
        println!("  {}", "-".repeat(70));

        for m in &merchants {
            println!(
                "  {:<28} {:>8} {:>12}   {}",
                truncate(&m.merchant, 28),
                m.receipt_count,
                format!("${:.2}", from_cents(m.total_cents)),
                format_ts_relative(m.last_processed_at)
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars - 1).collect();
        format!("{}…", cut)
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_short(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_short(ts)
    }
}

fn format_ts_short(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

//! Read-side CLI commands: receipt listing and points balance.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::ledger::Ledger;
use crate::models::format_ts_iso;

/// Prints processed receipts, newest first.
pub async fn run_list_receipts(config: &Config, limit: Option<usize>) -> Result<()> {
    let pool = db::connect(config).await?;
    let ledger = Ledger::new(pool.clone());
    let mut receipts = ledger.list_receipts().await?;
    pool.close().await;

    if receipts.is_empty() {
        println!("No receipts.");
        return Ok(());
    }

    if let Some(lim) = limit {
        receipts.truncate(lim);
    }

    println!(
        "{:>6}  {:<20}  {:<28} {:>10} {:>7} {:>6}",
        "ID", "PROCESSED", "MERCHANT", "TOTAL", "POINTS", "CONF"
    );
    for r in &receipts {
        println!(
            "{:>6}  {:<20}  {:<28} {:>10} {:>7} {:>5.1}%",
            r.id,
            format_ts_iso(r.processed_at),
            r.merchant,
            format!("${:.2}", r.total_amount),
            format!("+{}", r.points_awarded),
            r.confidence
        );
    }

    Ok(())
}

/// Prints the current balance.
pub async fn run_points(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let total = Ledger::new(pool.clone()).total_points().await?;
    pool.close().await;

    println!("total_points: {}", total);
    Ok(())
}

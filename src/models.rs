//! Core data models flowing through receipt ingestion.
//!
//! [`RecognitionResult`] is transient; only the fields copied into
//! [`NewReceipt`] survive into the persisted [`Receipt`].

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;

/// Fields extracted by the recognition service.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub merchant: String,
    /// Receipt total, rounded to two decimal places.
    pub total: Decimal,
    pub raw_text: String,
    /// Confidence score in `0..=100`.
    pub confidence: f64,
}

/// Receipt fields handed to the ledger for insertion.
#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub merchant: String,
    pub total: Decimal,
    pub points_awarded: i64,
    pub raw_ocr_text: Option<String>,
    pub confidence: f64,
}

impl NewReceipt {
    pub fn from_recognition(result: &RecognitionResult, points_awarded: i64) -> Self {
        Self {
            merchant: result.merchant.clone(),
            total: result.total,
            points_awarded,
            raw_ocr_text: Some(result.raw_text.clone()).filter(|t| !t.is_empty()),
            confidence: result.confidence,
        }
    }
}

/// Persisted receipt. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub id: i64,
    pub merchant: String,
    pub total_amount: Decimal,
    pub points_awarded: i64,
    pub raw_ocr_text: Option<String>,
    pub confidence: f64,
    /// Unix seconds, set at insert.
    #[serde(serialize_with = "serialize_ts_iso")]
    pub processed_at: i64,
}

/// Kind of a points ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Earned,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Earned => "earned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earned" => Some(TransactionKind::Earned),
            _ => None,
        }
    }
}

/// Append-only points ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointsLedgerEntry {
    pub id: i64,
    pub kind: TransactionKind,
    pub amount: i64,
    pub receipt_id: Option<i64>,
    #[serde(serialize_with = "serialize_ts_iso")]
    pub created_at: i64,
}

/// Converts a JSON number into a two-place decimal amount.
///
/// Returns `None` for NaN or infinite values.
pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp(2))
}

/// Amount in integer cents, the storage representation.
pub fn to_cents(amount: Decimal) -> Option<i64> {
    (amount.round_dp(2) * Decimal::ONE_HUNDRED).to_i64()
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn serialize_ts_iso<S>(ts: &i64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format_ts_iso(*ts))
}

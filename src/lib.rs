//! # Receipt Rewards
//!
//! Turns a photographed retail receipt into a reward-points credit.
//!
//! An uploaded image is stored transiently, sent to an external OCR service,
//! checked against recent history for accidental resubmission, and, if new,
//! recorded together with a fixed points award in an append-only ledger.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │ Artifact │──▶│ Recognition  │──▶│  Duplicate  │──▶│  Ledger  │
//! │  Store   │   │ (OCR, HTTP)  │   │  Detector   │   │ (SQLite) │
//! └──────────┘   └──────────────┘   └─────────────┘   └────┬─────┘
//!       ▲                                                  │
//!       └──────────── cleanup on every exit ◀──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rewards init                 # create database
//! rewards serve                # start HTTP API
//! rewards receipts             # list processed receipts
//! rewards points               # print the balance
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`error`] | Ingestion failure taxonomy |
//! | [`models`] | Core data types |
//! | [`artifact`] | Transient upload storage |
//! | [`recognition`] | OCR service client |
//! | [`duplicate`] | Duplicate-submission guard |
//! | [`ledger`] | Receipt and points persistence |
//! | [`ingest`] | Ingestion pipeline |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod artifact;
pub mod config;
pub mod db;
pub mod duplicate;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod receipts;
pub mod recognition;
pub mod server;
pub mod stats;

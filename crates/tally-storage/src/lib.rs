//! Relational store and reconciliation engine for Tally, plus the raw
//! retrieval utilities source adapters build on.
//!
//! Records from external sources are merged into users, tickets, and time
//! entries without duplicating any of them when the same data is fetched
//! again. Every batch is applied inside one transaction.

pub mod artifact;
pub mod cache;
pub mod db;
pub mod error;
pub mod http;
pub mod reports;
pub mod resolve;
pub mod upsert;

pub use artifact::{ArtifactStore, StoredArtifact};
pub use cache::RunCache;
pub use db::{TimeDb, DEFAULT_DATABASE_URL};
pub use error::StoreError;
pub use http::{BackoffPolicy, FetchError, FetchRequest, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use reports::{MonthlyEffort, UserRow};
pub use resolve::{resolve_ticket, resolve_user, TicketResolution, UserResolution};
pub use upsert::{IssueUpsertReport, TimeEntryUpsertReport};

pub const CRATE_NAME: &str = "tally-storage";

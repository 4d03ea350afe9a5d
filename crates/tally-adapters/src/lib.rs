//! Source adapter contracts and the JIRA / TMetric implementations.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tally_core::{FetchWindow, IssueRecord, TimeEntryRecord};
use tally_storage::{
    FetchError, HttpFetcher, IssueUpsertReport, StoreError, TimeDb, TimeEntryUpsertReport,
};
use thiserror::Error;

pub mod jira;
pub mod tmetric;

pub use jira::{JiraAdapter, JiraConfig};
pub use tmetric::{TMetricAdapter, TMetricConfig};

pub const CRATE_NAME: &str = "tally-adapters";

/// Source ids in the order a sync run visits them. Issues land before the
/// time entries that reference them by title.
pub const SOURCE_IDS: [&str; 2] = [jira::SOURCE_ID, tmetric::SOURCE_ID];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding config file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config file {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id} adapter has no configuration loaded")]
    NotConfigured { source_id: &'static str },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parsing {source_id} response: {message}")]
    Parse {
        source_id: &'static str,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdapterError {
    pub(crate) fn parse(source_id: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            source_id,
            message: message.into(),
        }
    }
}

/// Destination for normalized record batches.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn accept_issues(&self, batch: &[IssueRecord]) -> Result<IssueUpsertReport, StoreError>;

    async fn accept_time_entries(
        &self,
        batch: &[TimeEntryRecord],
    ) -> Result<TimeEntryUpsertReport, StoreError>;
}

#[async_trait]
impl RecordSink for TimeDb {
    async fn accept_issues(&self, batch: &[IssueRecord]) -> Result<IssueUpsertReport, StoreError> {
        self.upsert_issues(batch).await
    }

    async fn accept_time_entries(
        &self,
        batch: &[TimeEntryRecord],
    ) -> Result<TimeEntryUpsertReport, StoreError> {
        self.upsert_time_entries(batch).await
    }
}

/// Totals across every batch one adapter handed to its sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub batches: usize,
    pub records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub users_created: usize,
    pub anonymous_tickets_created: usize,
    pub unrecognized_categories: Vec<String>,
}

impl FetchStats {
    pub fn absorb_issues(&mut self, records: usize, report: IssueUpsertReport) {
        self.batches += 1;
        self.records += records;
        self.inserted += report.inserted;
        self.updated += report.updated;
        self.unrecognized_categories
            .extend(report.unrecognized_categories);
    }

    pub fn absorb_time_entries(&mut self, records: usize, report: TimeEntryUpsertReport) {
        self.batches += 1;
        self.records += records;
        self.inserted += report.inserted;
        self.updated += report.updated;
        self.users_created += report.users_created;
        self.anonymous_tickets_created += report.anonymous_tickets_created.len();
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;

    /// File extension for raw captures of this source's responses.
    fn raw_extension(&self) -> &'static str {
        "bin"
    }

    /// Reads `<source_id>.yaml` from `config_dir`.
    fn load_configuration(&mut self, config_dir: &Path) -> Result<(), ConfigError>;

    /// Retrieves everything in `window`, handing each page to `sink` as one batch.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        sink: &dyn RecordSink,
        window: &FetchWindow,
    ) -> Result<FetchStats, AdapterError>;

    /// Raw bytes of the first response for `window`, untouched.
    async fn fetch_raw(&self, http: &HttpFetcher, window: &FetchWindow) -> Result<Vec<u8>, AdapterError>;
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        jira::SOURCE_ID => Some(Box::new(JiraAdapter::default())),
        tmetric::SOURCE_ID => Some(Box::new(TMetricAdapter::default())),
        _ => None,
    }
}

pub fn config_path(config_dir: &Path, source_id: &str) -> PathBuf {
    config_dir.join(format!("{source_id}.yaml"))
}

pub(crate) fn read_yaml_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn require_non_empty(path: &Path, field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            message: format!("`{field}` must not be empty"),
        });
    }
    Ok(())
}

//! Sync run orchestration: window computation, ordered source runs, raw
//! captures, and the optional cron scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::Serialize;
use tally_adapters::{adapter_for_source, AdapterError, FetchStats, SourceAdapter, SOURCE_IDS};
use tally_core::FetchWindow;
use tally_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, StoredArtifact, TimeDb, DEFAULT_DATABASE_URL,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tally-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub config_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub history_days: i64,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            config_dir: PathBuf::from("./config"),
            artifacts_dir: PathBuf::from("./artifacts"),
            scheduler_enabled: false,
            sync_cron: "0 6 * * *".to_string(),
            user_agent: "tally/0.1".to_string(),
            http_timeout_secs: 20,
            history_days: 2,
            web_port: 3333,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            config_dir: std::env::var("TALLY_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            scheduler_enabled: std::env::var("TALLY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("TALLY_SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("TALLY_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("TALLY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            history_days: std::env::var("TALLY_HISTORY_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.history_days),
            web_port: std::env::var("TALLY_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }
}

/// Per-run choices made by the caller.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub history_days: i64,
    pub jira: bool,
    pub tmetric: bool,
}

impl SyncOptions {
    pub fn all_sources(history_days: i64) -> Self {
        Self {
            history_days,
            jira: true,
            tmetric: true,
        }
    }

    pub fn source_enabled(&self, source_id: &str) -> bool {
        match source_id {
            "jira" => self.jira,
            "tmetric" => self.tmetric,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Completed { stats: FetchStats },
    Failed { error: String },
    Disabled,
    /// Not attempted because an earlier source failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRun {
    pub source_id: String,
    pub display_name: String,
    pub outcome: SourceOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when the requested history was empty and nothing ran.
    pub window: Option<FetchWindow>,
    pub sources: Vec<SourceRun>,
}

impl SyncRunSummary {
    pub fn is_success(&self) -> bool {
        !self
            .sources
            .iter()
            .any(|s| matches!(s.outcome, SourceOutcome::Failed { .. }))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{source_id} failed: {error}")]
    Source {
        source_id: String,
        summary: Box<SyncRunSummary>,
        #[source]
        error: AdapterError,
    },
    #[error("no adapter registered for source `{0}`")]
    UnknownSource(String),
    #[error("raw capture from {source_id} failed: {error}")]
    Raw {
        source_id: String,
        #[source]
        error: AdapterError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct SyncPipeline {
    config: SyncConfig,
    db: TimeDb,
    http: HttpFetcher,
    artifact_store: ArtifactStore,
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, db: TimeDb) -> anyhow::Result<Self> {
        let adapters = SOURCE_IDS
            .into_iter()
            .filter_map(adapter_for_source)
            .collect();
        Self::with_adapters(config, db, adapters)
    }

    /// Runs exactly `adapters`, in the given order.
    pub fn with_adapters(
        config: SyncConfig,
        db: TimeDb,
        adapters: Vec<Box<dyn SourceAdapter>>,
    ) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        Ok(Self {
            config,
            db,
            http,
            artifact_store,
            adapters,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn db(&self) -> &TimeDb {
        &self.db
    }

    /// One sync over the window ending tonight. Sources run in order and the
    /// first failure stops the run: time entries fetched without their issues
    /// would all land on anonymous tickets.
    pub async fn run_once(
        &mut self,
        options: &SyncOptions,
        now: DateTime<FixedOffset>,
    ) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            window: FetchWindow::ending_tonight(options.history_days, now),
            sources: Vec::new(),
        };
        let Some(window) = summary.window else {
            info!(history_days = options.history_days, "empty history window, nothing to fetch");
            summary.finished_at = Utc::now();
            return Ok(summary);
        };

        info!(%run_id, start = %window.start, end = %window.end, "sync run started");
        let mut failure = None;
        for adapter in &mut self.adapters {
            let source_id = adapter.source_id();
            let outcome = if failure.is_some() {
                SourceOutcome::Skipped
            } else if !options.source_enabled(source_id) {
                SourceOutcome::Disabled
            } else {
                let span = info_span!("source_fetch", source_id);
                let result = run_source(
                    adapter.as_mut(),
                    &self.config,
                    &self.http,
                    &self.db,
                    &window,
                )
                .instrument(span)
                .await;
                match result {
                    Ok(stats) => {
                        info!(
                            source_id,
                            records = stats.records,
                            inserted = stats.inserted,
                            updated = stats.updated,
                            "source finished"
                        );
                        SourceOutcome::Completed { stats }
                    }
                    Err(err) => {
                        error!(source_id, error = %err, "source failed, halting run");
                        let outcome = SourceOutcome::Failed {
                            error: err.to_string(),
                        };
                        failure = Some((source_id, err));
                        outcome
                    }
                }
            };
            summary.sources.push(SourceRun {
                source_id: source_id.to_string(),
                display_name: adapter.display_name().to_string(),
                outcome,
            });
        }
        summary.finished_at = Utc::now();

        match failure {
            None => {
                info!(%run_id, "sync run finished");
                Ok(summary)
            }
            Some((source_id, error)) => Err(SyncError::Source {
                source_id: source_id.to_string(),
                summary: Box::new(summary),
                error,
            }),
        }
    }

    /// Stores the raw first response of one source for the window ending tonight.
    pub async fn capture_raw(
        &mut self,
        source_id: &str,
        history_days: i64,
        now: DateTime<FixedOffset>,
    ) -> Result<Option<StoredArtifact>, SyncError> {
        let Some(window) = FetchWindow::ending_tonight(history_days, now) else {
            return Ok(None);
        };
        let adapter = self
            .adapters
            .iter_mut()
            .find(|a| a.source_id() == source_id)
            .ok_or_else(|| SyncError::UnknownSource(source_id.to_string()))?;
        let raw_error = |error| SyncError::Raw {
            source_id: source_id.to_string(),
            error,
        };

        adapter
            .load_configuration(&self.config.config_dir)
            .map_err(|e| raw_error(e.into()))?;
        let bytes = adapter
            .fetch_raw(&self.http, &window)
            .await
            .map_err(raw_error)?;
        let stored = self
            .artifact_store
            .store_capture(&window, source_id, adapter.raw_extension(), &bytes)
            .await?;
        info!(
            source_id,
            path = %stored.absolute_path.display(),
            bytes = stored.byte_size,
            deduplicated = stored.deduplicated,
            "raw capture stored"
        );
        Ok(Some(stored))
    }
}

async fn run_source(
    adapter: &mut dyn SourceAdapter,
    config: &SyncConfig,
    http: &HttpFetcher,
    db: &TimeDb,
    window: &FetchWindow,
) -> Result<FetchStats, AdapterError> {
    adapter.load_configuration(&config.config_dir)?;
    adapter.fetch(http, db, window).await
}

/// Connects to the configured store and runs one sync.
pub async fn run_sync(config: SyncConfig, options: &SyncOptions) -> Result<SyncRunSummary, SyncError> {
    let db = TimeDb::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let mut pipeline = SyncPipeline::new(config, db)?;
    pipeline.run_once(options, Local::now().fixed_offset()).await
}

/// A scheduler that runs `pipeline` on the configured cron expression, or
/// `None` when scheduling is disabled. Runs never overlap.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Mutex<SyncPipeline>>,
    options: SyncOptions,
) -> anyhow::Result<Option<JobScheduler>> {
    let (enabled, cron) = {
        let guard = pipeline.lock().await;
        (guard.config.scheduler_enabled, guard.config.sync_cron.clone())
    };
    if !enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let options = options.clone();
        Box::pin(async move {
            let mut pipeline = pipeline.lock().await;
            match pipeline.run_once(&options, Local::now().fixed_offset()).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                Err(err) => warn!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

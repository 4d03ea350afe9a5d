//! TMetric detailed-report CSV, fetched one local day at a time.
//!
//! The report only carries durations, so every entry is placed at 01:00 on
//! the day it was reported for.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, TimeDelta, Utc};
use serde::Deserialize;
use tally_core::{FetchWindow, SourceSystem, TimeEntryRecord};
use tally_storage::{FetchRequest, HttpFetcher};
use tracing::info;

use crate::{
    config_path, read_yaml_config, require_non_empty, AdapterError, ConfigError, FetchStats,
    RecordSink, SourceAdapter,
};

pub const SOURCE_ID: &str = "tmetric";

const API_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const TASK_START_HOUR: i64 = 1;
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

fn default_base_url() -> String {
    "https://app.tmetric.com".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TMetricConfig {
    pub account_id: String,
    /// Appended to the report's user column to form an email address.
    pub email_suffix: String,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

/// Reports are requested one calendar day at a time, cut at midnight in the
/// host's local time zone unless a fixed offset is set.
#[derive(Debug, Clone, Default)]
pub struct TMetricAdapter {
    config: Option<TMetricConfig>,
    day_offset: Option<FixedOffset>,
}

impl TMetricAdapter {
    pub fn with_config(config: TMetricConfig) -> Self {
        Self {
            config: Some(config),
            day_offset: None,
        }
    }

    pub fn with_day_offset(mut self, offset: FixedOffset) -> Self {
        self.day_offset = Some(offset);
        self
    }

    fn day_slices(&self, window: &FetchWindow) -> Vec<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
        match &self.day_offset {
            Some(offset) => window.day_slices_in(offset),
            None => window.day_slices_in(&Local),
        }
    }

    fn config(&self) -> Result<&TMetricConfig, AdapterError> {
        self.config
            .as_ref()
            .ok_or(AdapterError::NotConfigured { source_id: SOURCE_ID })
    }

    fn report_request(
        config: &TMetricConfig,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> FetchRequest {
        let base = config.base_url.trim_end_matches('/');
        let url = format!(
            "{base}/api/reports/detailed/csv?accountId={}&activeProjectsOnly=false&budget=false\
             &endDate={}&groupColumnNames=project&groupColumnNames=user&noRounding=false&startDate={}",
            config.account_id,
            end.with_timezone(&Utc).format(API_DATE_FORMAT),
            start.with_timezone(&Utc).format(API_DATE_FORMAT),
        );
        FetchRequest::get(url)
            .cookies(&config.cookies)
            .header("Accept", "text/csv, */*")
            .header("Referer", format!("{base}/"))
    }
}

/// Parses one day's report. Entries start at 01:00 on `day_start`'s date.
pub fn parse_report(
    body: &[u8],
    day_start: DateTime<FixedOffset>,
    email_suffix: &str,
) -> Result<Vec<TimeEntryRecord>, AdapterError> {
    let body = body.strip_prefix(UTF8_BOM).unwrap_or(body);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);

    let headers = reader
        .headers()
        .map_err(|e| AdapterError::parse(SOURCE_ID, format!("unreadable header row: {e}")))?
        .clone();
    let header_line = headers.iter().collect::<Vec<_>>().join(",");
    let column = |names: &[&str], label: &str| {
        headers
            .iter()
            .position(|h| names.contains(&h))
            .ok_or_else(|| {
                AdapterError::parse(
                    SOURCE_ID,
                    format!("unable to find {label} column in CSV, first line = '{header_line}'"),
                )
            })
    };
    let user_col = column(&["User"], "User")?;
    let task_col = column(&["Time Entry", "Task"], "Task")?;
    let time_col = column(&["Time"], "Time")?;

    let start = day_start
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(*day_start.offset()).single())
        .map(|midnight| midnight + TimeDelta::hours(TASK_START_HOUR))
        .ok_or_else(|| AdapterError::parse(SOURCE_ID, format!("no local midnight for {day_start}")))?;

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let line = index + 2;
        let row = row.map_err(|e| AdapterError::parse(SOURCE_ID, format!("line {line}: {e}")))?;
        let field = |col: usize| {
            row.get(col).ok_or_else(|| {
                AdapterError::parse(SOURCE_ID, format!("line {line}: missing column {col}"))
            })
        };
        let time = field(time_col)?;
        let duration = parse_duration(time).ok_or_else(|| {
            AdapterError::parse(SOURCE_ID, format!("line {line}: malformed duration `{time}`"))
        })?;
        records.push(TimeEntryRecord {
            source_system: SourceSystem::TMetric,
            email: format!("{}{email_suffix}", field(user_col)?),
            task_title: field(task_col)?.to_string(),
            start,
            end: start + duration,
        });
    }
    Ok(records)
}

/// `H:MM:SS`, hours unbounded.
fn parse_duration(text: &str) -> Option<TimeDelta> {
    let mut parts = text.trim().split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0 || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    Some(TimeDelta::seconds(hours * 3600 + minutes * 60 + seconds))
}

#[async_trait]
impl SourceAdapter for TMetricAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn display_name(&self) -> &'static str {
        "TMetric"
    }

    fn raw_extension(&self) -> &'static str {
        "csv"
    }

    fn load_configuration(&mut self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_path(config_dir, SOURCE_ID);
        let config: TMetricConfig = read_yaml_config(&path)?;
        require_non_empty(&path, "account_id", &config.account_id)?;
        self.config = Some(config);
        Ok(())
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        sink: &dyn RecordSink,
        window: &FetchWindow,
    ) -> Result<FetchStats, AdapterError> {
        let config = self.config()?;
        let mut stats = FetchStats::default();
        for (day_start, day_end) in self.day_slices(window) {
            info!(from = %day_start.to_rfc3339(), to = %day_end.to_rfc3339(), "fetching TMetric day");
            let response = http
                .fetch_bytes(SOURCE_ID, &Self::report_request(config, day_start, day_end))
                .await?;
            let batch = parse_report(&response.body, day_start, &config.email_suffix)?;
            let report = sink.accept_time_entries(&batch).await?;
            stats.absorb_time_entries(batch.len(), report);
        }
        Ok(stats)
    }

    /// The whole window as a single report.
    async fn fetch_raw(&self, http: &HttpFetcher, window: &FetchWindow) -> Result<Vec<u8>, AdapterError> {
        let config = self.config()?;
        let response = http
            .fetch_bytes(SOURCE_ID, &Self::report_request(config, window.start, window.end))
            .await?;
        Ok(response.body)
    }
}

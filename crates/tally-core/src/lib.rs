//! Canonical ingestion records and identity rules for Tally.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tally-core";

pub type UserId = i64;
pub type TicketId = i64;

/// Tag recorded alongside every ticket and time entry naming where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSystem {
    #[serde(rename = "anon")]
    Anonymous,
    Jira,
    #[serde(rename = "tmetric")]
    TMetric,
}

impl SourceSystem {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anon",
            Self::Jira => "jira",
            Self::TMetric => "tmetric",
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source system tag `{0}`")]
pub struct UnknownSourceSystem(pub String);

impl FromStr for SourceSystem {
    type Err = UnknownSourceSystem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anon" => Ok(Self::Anonymous),
            "jira" => Ok(Self::Jira),
            "tmetric" => Ok(Self::TMetric),
            other => Err(UnknownSourceSystem(other.to_string())),
        }
    }
}

/// Closed set of ticket categories used by reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TicketCategory {
    Bug,
    Feature,
    BusinessAsUsual,
    Test,
    Interrupt,
    Epic,
    Spike,
    Other,
    Anonymous,
}

impl TicketCategory {
    pub const ALL: [Self; 9] = [
        Self::Bug,
        Self::Feature,
        Self::BusinessAsUsual,
        Self::Test,
        Self::Interrupt,
        Self::Epic,
        Self::Spike,
        Self::Other,
        Self::Anonymous,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::BusinessAsUsual => "business-as-usual",
            Self::Test => "test",
            Self::Interrupt => "interrupt",
            Self::Epic => "epic",
            Self::Spike => "spike",
            Self::Other => "other",
            Self::Anonymous => "anonymous",
        }
    }

    /// Maps a JIRA issue-type label onto a category, matched exactly.
    ///
    /// `None` means the label is unrecognized and the caller decides how to
    /// report it. `Anonymous` is never produced: only the ticket resolver
    /// creates anonymous tickets.
    pub fn from_issue_type(label: &str) -> Option<Self> {
        match label {
            "Story" => Some(Self::Feature),
            "Bug" => Some(Self::Bug),
            "BAU" => Some(Self::BusinessAsUsual),
            "Test" => Some(Self::Test),
            "Interrupt" => Some(Self::Interrupt),
            "Spike" => Some(Self::Spike),
            "Epic" => Some(Self::Epic),
            _ => None,
        }
    }
}

impl fmt::Display for TicketCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown ticket category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for TicketCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Issue metadata as reported by an issue tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub source_system: SourceSystem,
    pub source_native_id: String,
    pub title: String,
    /// Native issue-type label (e.g. "Story"), mapped to a category on upsert.
    pub issue_type: String,
    pub story_points: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Time spent by one user against a task title.
///
/// Timestamps keep the source-local offset: the calendar day used for
/// per-day identity is the day as the source saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntryRecord {
    pub source_system: SourceSystem,
    pub email: String,
    pub task_title: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl TimeEntryRecord {
    pub fn duration(&self) -> TimeDelta {
        self.end.signed_duration_since(self.start)
    }
}

const ANON_PREFIX: &str = "anon(";
const ANON_SEPARATOR: &str = "): ";

/// Title given to the per-user placeholder ticket for an unmatched task title.
pub fn anonymous_task_name(user_id: UserId, title: &str) -> String {
    format!("{ANON_PREFIX}{user_id}{ANON_SEPARATOR}{title}")
}

/// Splits an anonymous task name back into its owner and original title.
pub fn parse_anonymous_task_name(name: &str) -> Option<(UserId, &str)> {
    let rest = name.strip_prefix(ANON_PREFIX)?;
    let (id, title) = rest.split_once(ANON_SEPARATOR)?;
    Some((id.parse().ok()?, title))
}

/// Dedup key for a time entry from a source that reports daily summaries.
///
/// Year and day-of-year are summed, so (2024, day 10) and (2025, day 9)
/// produce the same key for the same ticket. Existing rows were keyed this
/// way; changing the formula would duplicate them on the next fetch.
pub fn per_day_synthetic_id(ticket_id: TicketId, start: &DateTime<FixedOffset>) -> String {
    let day_key = start.year() + start.ordinal() as i32;
    format!("{ticket_id}:{day_key}")
}

/// Inclusive time range handed to source adapters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl FetchWindow {
    pub fn new(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> Self {
        Self { start, end }
    }

    /// Window ending at 23:59:59 today (in `now`'s offset) and reaching back
    /// `history_days` whole days. Returns `None` when there is nothing to fetch.
    pub fn ending_tonight(history_days: i64, now: DateTime<FixedOffset>) -> Option<Self> {
        if history_days <= 0 {
            return None;
        }
        let tonight = now.date_naive().and_hms_opt(23, 59, 59)?;
        let end = now.offset().from_local_datetime(&tonight).single()?;
        let start = end.checked_sub_signed(TimeDelta::try_days(history_days)?)?;
        Some(Self { start, end })
    }

    /// Day slices cut at midnight in the window's own offset.
    pub fn day_slices(&self) -> Vec<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
        self.day_slices_in(self.start.offset())
    }

    /// Consecutive calendar-day slices covering the window, starting at the
    /// midnight in `tz` on or before `start`; the final slice is clipped at
    /// `end`. Each midnight takes the offset `tz` has on that day, so a slice
    /// spanning a DST change is 23 or 25 hours long.
    pub fn day_slices_in<Tz: TimeZone>(
        &self,
        tz: &Tz,
    ) -> Vec<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
        let mut day = self.start.with_timezone(tz).date_naive();
        let mut slices = Vec::new();
        while let Some(pos) = day_start_in(tz, day) {
            if pos >= self.end {
                break;
            }
            let Some(next_day) = day.succ_opt() else {
                slices.push((pos, self.end));
                break;
            };
            let next = day_start_in(tz, next_day).map_or(self.end, |m| m.min(self.end));
            slices.push((pos, next));
            day = next_day;
        }
        slices
    }
}

/// First instant of `day` in `tz`. Zones that skip midnight start the day at 01:00.
fn day_start_in<Tz: TimeZone>(tz: &Tz, day: NaiveDate) -> Option<DateTime<FixedOffset>> {
    [0, 1].into_iter().find_map(|hour| {
        let local = day.and_hms_opt(hour, 0, 0)?;
        tz.from_local_datetime(&local)
            .earliest()
            .map(|t| t.fixed_offset())
    })
}

//! Batch upserts: one transaction per batch, rolled back wholesale on error.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use tally_core::{anonymous_task_name, per_day_synthetic_id, IssueRecord, TicketCategory, TimeEntryRecord};
use tracing::{debug, warn};

use crate::cache::RunCache;
use crate::db::TimeDb;
use crate::error::StoreError;
use crate::resolve::{resolve_ticket, resolve_user, TicketResolution};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IssueUpsertReport {
    pub inserted: usize,
    pub updated: usize,
    /// Native issue-type labels that fell back to `other`, in batch order.
    pub unrecognized_categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeEntryUpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub users_created: usize,
    /// Titles of anonymous tickets created because no ticket matched.
    pub anonymous_tickets_created: Vec<String>,
}

impl TimeDb {
    /// Merge issue metadata into the ticket table keyed by (system, native id).
    ///
    /// Title, category, and story points are last-write-wins; the creation
    /// time is only written on insert.
    pub async fn upsert_issues(&self, batch: &[IssueRecord]) -> Result<IssueUpsertReport, StoreError> {
        let mut tx = self.pool().begin().await?;
        match apply_issues(&mut tx, batch).await {
            Ok(report) => {
                tx.commit().await?;
                debug!(
                    inserted = report.inserted,
                    updated = report.updated,
                    "issue batch committed"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, records = batch.len(), "rolling back issue batch");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "issue batch rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Merge time-spent records keyed by (system, per-day synthetic id),
    /// resolving user and ticket for each record first.
    pub async fn upsert_time_entries(
        &self,
        batch: &[TimeEntryRecord],
    ) -> Result<TimeEntryUpsertReport, StoreError> {
        let mut cache = RunCache::new();
        let mut tx = self.pool().begin().await?;
        match apply_time_entries(&mut tx, &mut cache, batch).await {
            Ok(report) => {
                tx.commit().await?;
                debug!(
                    inserted = report.inserted,
                    updated = report.updated,
                    users_created = report.users_created,
                    anonymous_tickets = report.anonymous_tickets_created.len(),
                    "time entry batch committed"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, records = batch.len(), "rolling back time entry batch");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "time entry batch rollback failed");
                }
                Err(err)
            }
        }
    }
}

async fn apply_issues(
    conn: &mut SqliteConnection,
    batch: &[IssueRecord],
) -> Result<IssueUpsertReport, StoreError> {
    let mut report = IssueUpsertReport::default();
    for issue in batch {
        let category = match TicketCategory::from_issue_type(&issue.issue_type) {
            Some(category) => category,
            None => {
                warn!(
                    issue_type = %issue.issue_type,
                    native_id = %issue.source_native_id,
                    "unrecognized issue type, filing as other"
                );
                report.unrecognized_categories.push(issue.issue_type.clone());
                TicketCategory::Other
            }
        };

        let updated = sqlx::query(
            r#"
            UPDATE tickets
               SET title = $1,
                   category = $2,
                   story_points = $3
             WHERE system = $4
               AND source_native_id = $5
            "#,
        )
        .bind(&issue.title)
        .bind(category.as_str())
        .bind(issue.story_points)
        .bind(issue.source_system.as_str())
        .bind(&issue.source_native_id)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() > 0 {
            report.updated += 1;
            continue;
        }

        sqlx::query(
            r#"
            INSERT INTO tickets (system, source_native_id, title, category, story_points, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(issue.source_system.as_str())
        .bind(&issue.source_native_id)
        .bind(&issue.title)
        .bind(category.as_str())
        .bind(issue.story_points)
        .bind(issue.created_at)
        .execute(&mut *conn)
        .await?;
        report.inserted += 1;
    }
    Ok(report)
}

async fn apply_time_entries(
    conn: &mut SqliteConnection,
    cache: &mut RunCache,
    batch: &[TimeEntryRecord],
) -> Result<TimeEntryUpsertReport, StoreError> {
    let mut report = TimeEntryUpsertReport::default();
    for record in batch {
        let user = resolve_user(conn, cache, &record.email).await?;
        if user.created {
            report.users_created += 1;
        }

        let resolution = resolve_ticket(conn, cache, user.user_id, &record.task_title, true).await?;
        if let TicketResolution::AnonymousCreated(_) = resolution {
            report
                .anonymous_tickets_created
                .push(anonymous_task_name(user.user_id, &record.task_title));
        }
        let ticket_id = resolution
            .ticket_id()
            .ok_or_else(|| StoreError::UnresolvedTicket {
                title: record.task_title.clone(),
            })?;

        let synthetic_id = per_day_synthetic_id(ticket_id, &record.start);
        let start = record.start.with_timezone(&Utc);
        let end = record.end.with_timezone(&Utc);

        let updated = sqlx::query(
            r#"
            UPDATE time_entries
               SET start_time = $1,
                   end_time = $2
             WHERE system = $3
               AND synthetic_id = $4
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(record.source_system.as_str())
        .bind(&synthetic_id)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() > 0 {
            report.updated += 1;
            continue;
        }

        sqlx::query(
            r#"
            INSERT INTO time_entries (user_id, system, synthetic_id, start_time, end_time, ticket_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.user_id)
        .bind(record.source_system.as_str())
        .bind(&synthetic_id)
        .bind(start)
        .bind(end)
        .bind(ticket_id)
        .execute(&mut *conn)
        .await?;
        report.inserted += 1;
    }
    Ok(report)
}

//! Read-side queries for effort reporting.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Month, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite};
use tally_core::{TicketCategory, UserId};

use crate::db::TimeDb;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserRow {
    pub user_id: UserId,
    pub email: String,
}

/// Seconds logged in one calendar month, split by ticket category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyEffort {
    pub year: i32,
    pub month: u32,
    pub month_name: String,
    pub total_seconds: f64,
    pub seconds_by_category: BTreeMap<TicketCategory, f64>,
}

impl MonthlyEffort {
    fn new(year: i32, month: u32) -> Self {
        let month_name = u8::try_from(month)
            .ok()
            .and_then(|m| Month::try_from(m).ok())
            .map(|m| m.name().to_string())
            .unwrap_or_default();
        Self {
            year,
            month,
            month_name,
            total_seconds: 0.0,
            seconds_by_category: BTreeMap::new(),
        }
    }

    pub fn seconds(&self, category: TicketCategory) -> f64 {
        self.seconds_by_category.get(&category).copied().unwrap_or(0.0)
    }
}

impl TimeDb {
    pub async fn list_users(&self) -> Result<Vec<UserRow>, StoreError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT user_id, email FROM users ORDER BY lower(email)",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Lower-cased email to user id for every known user.
    pub async fn user_ids_by_email(&self) -> Result<HashMap<String, UserId>, StoreError> {
        Ok(self
            .list_users()
            .await?
            .into_iter()
            .map(|u| (u.email.to_lowercase(), u.user_id))
            .collect())
    }

    /// Effort per month and category for entries starting after `since`.
    ///
    /// `None` covers every user; an empty slice covers nobody.
    pub async fn monthly_effort(
        &self,
        user_ids: Option<&[UserId]>,
        since: DateTime<Utc>,
    ) -> Result<Vec<MonthlyEffort>, StoreError> {
        if user_ids.is_some_and(<[UserId]>::is_empty) {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT t.start_time, t.end_time, k.category
              FROM time_entries AS t
             INNER JOIN tickets AS k ON k.ticket_id = t.ticket_id
             WHERE t.start_time > "#,
        );
        query.push_bind(since);
        if let Some(ids) = user_ids {
            query.push(" AND t.user_id IN (");
            let mut separated = query.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }
        query.push(" ORDER BY t.start_time");

        let rows = query.build().fetch_all(self.pool()).await?;

        let mut months: BTreeMap<(i32, u32), MonthlyEffort> = BTreeMap::new();
        for row in rows {
            let start: DateTime<Utc> = row.try_get("start_time")?;
            let end: DateTime<Utc> = row.try_get("end_time")?;
            let category: String = row.try_get("category")?;
            let category = category.parse().unwrap_or(TicketCategory::Other);
            let seconds = end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0;

            let entry = months
                .entry((start.year(), start.month()))
                .or_insert_with(|| MonthlyEffort::new(start.year(), start.month()));
            entry.total_seconds += seconds;
            *entry.seconds_by_category.entry(category).or_default() += seconds;
        }

        Ok(months.into_values().collect())
    }
}

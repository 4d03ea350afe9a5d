//! Identity and ticket resolution inside an open batch transaction.

use chrono::Utc;
use sqlx::{Connection, SqliteConnection};
use tally_core::{anonymous_task_name, SourceSystem, TicketCategory, TicketId, UserId};
use tracing::{debug, info};

use crate::cache::RunCache;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserResolution {
    pub user_id: UserId,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketResolution {
    /// A ticket titled exactly as asked, or this user's anonymous ticket for it.
    Existing(TicketId),
    /// Nothing matched and a new anonymous ticket was created.
    AnonymousCreated(TicketId),
    /// Nothing matched and creation was not allowed.
    NotFound,
}

impl TicketResolution {
    pub fn ticket_id(self) -> Option<TicketId> {
        match self {
            Self::Existing(id) | Self::AnonymousCreated(id) => Some(id),
            Self::NotFound => None,
        }
    }
}

/// Maps an email address to a user id, creating the user on first sight.
///
/// A uniqueness conflict on insert means another writer created the same user
/// between our read and our write; the read is retried once.
pub async fn resolve_user(
    conn: &mut SqliteConnection,
    cache: &mut RunCache,
    email: &str,
) -> Result<UserResolution, StoreError> {
    let email = email.to_lowercase();
    if let Some(user_id) = cache.user(&email) {
        return Ok(UserResolution {
            user_id,
            created: false,
        });
    }

    for attempt in 0..2 {
        if let Some(user_id) = find_user(conn, &email).await? {
            cache.remember_user(email, user_id);
            return Ok(UserResolution {
                user_id,
                created: false,
            });
        }
        if attempt > 0 {
            break;
        }
        match insert_user(conn, &email).await {
            Ok(user_id) => {
                debug!(user_id, email = %email, "created user");
                cache.remember_user(email, user_id);
                return Ok(UserResolution {
                    user_id,
                    created: true,
                });
            }
            Err(err) if err.is_unique_violation() => {
                debug!(email = %email, "user insert lost a race, re-reading");
            }
            Err(err) => return Err(err),
        }
    }

    Err(StoreError::UserRace { email })
}

async fn find_user(conn: &mut SqliteConnection, email: &str) -> Result<Option<UserId>, StoreError> {
    let user_id = sqlx::query_scalar::<_, i64>(
        "SELECT user_id FROM users WHERE lower(email) = lower($1)",
    )
    .bind(email)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(user_id)
}

async fn insert_user(conn: &mut SqliteConnection, email: &str) -> Result<UserId, StoreError> {
    // A savepoint keeps a rejected insert from poisoning the batch transaction.
    let mut savepoint = conn.begin().await?;
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO users (email) VALUES ($1) RETURNING user_id",
    )
    .bind(email)
    .fetch_one(&mut *savepoint)
    .await;

    match inserted {
        Ok(user_id) => {
            savepoint.commit().await?;
            Ok(user_id)
        }
        Err(err) => {
            savepoint.rollback().await?;
            Err(err.into())
        }
    }
}

/// Maps a free-text task title to a ticket.
///
/// Tries the exact title first, then this user's anonymous ticket for the
/// title. With `allow_create` a miss on both creates the anonymous ticket.
pub async fn resolve_ticket(
    conn: &mut SqliteConnection,
    cache: &mut RunCache,
    user_id: UserId,
    title: &str,
    allow_create: bool,
) -> Result<TicketResolution, StoreError> {
    if let Some(ticket_id) = lookup_title(conn, cache, title).await? {
        return Ok(TicketResolution::Existing(ticket_id));
    }

    let anon_title = anonymous_task_name(user_id, title);
    if let Some(ticket_id) = lookup_title(conn, cache, &anon_title).await? {
        return Ok(TicketResolution::Existing(ticket_id));
    }

    if !allow_create {
        return Ok(TicketResolution::NotFound);
    }

    info!(user_id, title, "no ticket matches task title, creating anonymous ticket");
    let ticket_id = insert_anonymous_ticket(conn, user_id, &anon_title).await?;
    cache.remember_ticket(anon_title, Some(ticket_id));
    Ok(TicketResolution::AnonymousCreated(ticket_id))
}

/// Most recently created ticket with exactly this title, memoized by the
/// literal title string including absences.
async fn lookup_title(
    conn: &mut SqliteConnection,
    cache: &mut RunCache,
    title: &str,
) -> Result<Option<TicketId>, StoreError> {
    if let Some(cached) = cache.ticket(title) {
        return Ok(cached);
    }
    let ticket_id = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT ticket_id
          FROM tickets
         WHERE title = $1
         ORDER BY created_at DESC, ticket_id DESC
         LIMIT 1
        "#,
    )
    .bind(title)
    .fetch_optional(&mut *conn)
    .await?;
    cache.remember_ticket(title.to_string(), ticket_id);
    Ok(ticket_id)
}

async fn insert_anonymous_ticket(
    conn: &mut SqliteConnection,
    user_id: UserId,
    anon_title: &str,
) -> Result<TicketId, StoreError> {
    let ticket_id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO tickets (system, source_native_id, title, category, story_points, owner_user_id, created_at)
        VALUES ($1, NULL, $2, $3, NULL, $4, $5)
        RETURNING ticket_id
        "#,
    )
    .bind(SourceSystem::Anonymous.as_str())
    .bind(anon_title)
    .bind(TicketCategory::Anonymous.as_str())
    .bind(user_id)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;
    Ok(ticket_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeDb;

    async fn memory_db() -> TimeDb {
        TimeDb::connect("sqlite::memory:").await.expect("in-memory store")
    }

    #[tokio::test]
    async fn user_is_created_once_and_then_found() {
        let db = memory_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut cache = RunCache::new();

        let first = resolve_user(&mut conn, &mut cache, "Ben@X.com").await.unwrap();
        assert!(first.created);

        let mut fresh_cache = RunCache::new();
        let second = resolve_user(&mut conn, &mut fresh_cache, "ben@x.com").await.unwrap();
        assert!(!second.created);
        assert_eq!(first.user_id, second.user_id);

        let stored: String = sqlx::query_scalar("SELECT email FROM users")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(stored, "ben@x.com");
    }

    #[tokio::test]
    async fn duplicate_user_insert_is_classified_as_unique_violation() {
        let db = memory_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        insert_user(&mut conn, "a@x.com").await.unwrap();
        let err = insert_user(&mut conn, "A@X.COM").await.unwrap_err();
        assert!(err.is_unique_violation(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn unique_conflict_that_never_resolves_is_a_user_race() {
        let db = memory_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        sqlx::query(
            "CREATE TRIGGER twin_user BEFORE INSERT ON users BEGIN INSERT INTO users (email) VALUES (NEW.email); END",
        )
        .execute(&mut *conn)
        .await
        .unwrap();
        let mut cache = RunCache::new();

        let err = resolve_user(&mut conn, &mut cache, "b@x.com").await.unwrap_err();

        assert!(matches!(err, StoreError::UserRace { ref email } if email == "b@x.com"), "got {err}");
        assert_eq!(cache.user("b@x.com"), None);
        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(users, 0);
    }

    #[tokio::test]
    async fn cached_user_skips_the_store() {
        let db = memory_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut cache = RunCache::new();
        cache.remember_user("ghost@x.com".into(), 77);

        let resolved = resolve_user(&mut conn, &mut cache, "Ghost@X.com").await.unwrap();
        assert_eq!(resolved.user_id, 77);
        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(users, 0);
    }

    #[tokio::test]
    async fn unmatched_title_without_create_is_not_found() {
        let db = memory_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut cache = RunCache::new();

        let resolution = resolve_ticket(&mut conn, &mut cache, 1, "Nothing here", false)
            .await
            .unwrap();
        assert_eq!(resolution, TicketResolution::NotFound);
        assert_eq!(resolution.ticket_id(), None);
        assert_eq!(cache.ticket("Nothing here"), Some(None));
        assert_eq!(cache.ticket(&anonymous_task_name(1, "Nothing here")), Some(None));
    }

    #[tokio::test]
    async fn created_anonymous_ticket_is_reused_within_the_batch() {
        let db = memory_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut cache = RunCache::new();

        let created = resolve_ticket(&mut conn, &mut cache, 5, "Untracked work", true)
            .await
            .unwrap();
        let TicketResolution::AnonymousCreated(id) = created else {
            panic!("expected creation, got {created:?}");
        };
        let again = resolve_ticket(&mut conn, &mut cache, 5, "Untracked work", true)
            .await
            .unwrap();
        assert_eq!(again, TicketResolution::Existing(id));

        let (title, category, owner): (String, String, Option<i64>) = sqlx::query_as(
            "SELECT title, category, owner_user_id FROM tickets WHERE ticket_id = $1",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(title, "anon(5): Untracked work");
        assert_eq!(category, "anonymous");
        assert_eq!(owner, Some(5));
    }

    #[tokio::test]
    async fn title_lookup_prefers_most_recently_created() {
        let db = memory_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        for (native_id, created) in [("1", "2023-05-01T00:00:00Z"), ("2", "2024-05-01T00:00:00Z")] {
            sqlx::query(
                "INSERT INTO tickets (system, source_native_id, title, category, created_at) VALUES ('jira', $1, 'Weekly sync', 'business-as-usual', $2)",
            )
            .bind(native_id)
            .bind(chrono::DateTime::parse_from_rfc3339(created).unwrap().with_timezone(&Utc))
            .execute(&mut *conn)
            .await
            .unwrap();
        }
        let newest: i64 = sqlx::query_scalar("SELECT ticket_id FROM tickets WHERE source_native_id = '2'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();

        let mut cache = RunCache::new();
        let resolution = resolve_ticket(&mut conn, &mut cache, 1, "Weekly sync", true)
            .await
            .unwrap();
        assert_eq!(resolution, TicketResolution::Existing(newest));
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to store {url}: {source}")]
    Connectivity {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("applying schema migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("user {email} was neither found nor insertable after a uniqueness conflict")]
    UserRace { email: String },
    #[error("task title {title:?} did not resolve to a ticket")]
    UnresolvedTicket { title: String },
}

impl StoreError {
    /// True when the store rejected a write on a unique index.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Database(sqlx::Error::Database(db)) if db.is_unique_violation())
    }
}

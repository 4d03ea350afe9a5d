use std::collections::HashMap;

use tally_core::{TicketId, UserId};

/// Lookup shortcuts that live for exactly one upsert transaction.
///
/// Title entries hold `None` for titles confirmed absent, so repeated misses
/// within a batch do not go back to the store.
#[derive(Debug, Default)]
pub struct RunCache {
    users_by_email: HashMap<String, UserId>,
    tickets_by_title: HashMap<String, Option<TicketId>>,
}

impl RunCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `email` must already be case-folded.
    pub fn user(&self, email: &str) -> Option<UserId> {
        self.users_by_email.get(email).copied()
    }

    pub fn remember_user(&mut self, email: String, user_id: UserId) {
        self.users_by_email.insert(email, user_id);
    }

    /// Outer `None` is a cache miss; `Some(None)` is a cached absence.
    pub fn ticket(&self, title: &str) -> Option<Option<TicketId>> {
        self.tickets_by_title.get(title).copied()
    }

    pub fn remember_ticket(&mut self, title: String, ticket_id: Option<TicketId>) {
        self.tickets_by_title.insert(title, ticket_id);
    }
}

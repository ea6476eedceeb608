use std::collections::HashMap;

use crate::types::TypingUser;

#[derive(Debug, Clone)]
struct TypingEntry {
    display_name: String,
    expires_at_ms: u64,
}

/// Ephemeral typing-indicator state for the active conversation.
///
/// Each typing event records an explicit expires-at timestamp; expiry is
/// swept on access instead of relying on externally managed timer handles,
/// so rapid conversation switches cannot leak timers.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    ttl_ms: u64,
    entries: HashMap<String, TypingEntry>,
}

impl TypingTracker {
    /// Create a tracker with the given per-user indicator lifetime.
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms: ttl_ms.max(1),
            entries: HashMap::new(),
        }
    }

    /// Record a typing event, refreshing the user's expiry.
    pub fn note(&mut self, user_id: impl Into<String>, display_name: impl Into<String>, now_ms: u64) {
        self.entries.insert(
            user_id.into(),
            TypingEntry {
                display_name: display_name.into(),
                expires_at_ms: now_ms.saturating_add(self.ttl_ms),
            },
        );
    }

    /// Sweep expired entries and return the users still typing, sorted by id.
    pub fn active(&mut self, now_ms: u64) -> Vec<TypingUser> {
        self.entries.retain(|_, entry| entry.expires_at_ms > now_ms);

        let mut users: Vec<TypingUser> = self
            .entries
            .iter()
            .map(|(user_id, entry)| TypingUser {
                user_id: user_id.clone(),
                display_name: entry.display_name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Drop all entries; called on conversation switch.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

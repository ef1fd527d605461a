use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::canonical_message_id;
use crate::sync::matching::same_conversation;

/// An optimistic send we are still expecting to see confirmed or echoed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub temp_id: String,
    /// Server id, once the REST confirmation has assigned one.
    pub real_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    resolved_at: Option<Instant>,
}

impl PendingSend {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// The fields of an inbound message used to correlate it with a pending
/// send.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub message_id: Option<&'a str>,
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    pub text: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Temp id → pending send. Entries stay around for `gc_after` once resolved
/// so a late WebSocket echo still finds its optimistic twin.
#[derive(Debug)]
pub struct PendingSendRegistry {
    entries: HashMap<String, PendingSend>,
    window: Duration,
    gc_after: Duration,
}

impl PendingSendRegistry {
    pub fn new(window: Duration, gc_after: Duration) -> Self {
        PendingSendRegistry {
            entries: HashMap::new(),
            window,
            gc_after,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, temp_id: &str) -> Option<&PendingSend> {
        self.entries.get(temp_id)
    }

    pub fn register(
        &mut self,
        temp_id: &str,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
        timestamp: DateTime<Utc>,
    ) {
        debug!("Registering pending send {}", temp_id);
        self.entries.insert(
            temp_id.to_string(),
            PendingSend {
                temp_id: temp_id.to_string(),
                real_id: None,
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                text: text.to_string(),
                timestamp,
                resolved_at: None,
            },
        );
    }

    /// Record the server id for `temp_id` and start its GC clock.
    pub fn resolve(&mut self, temp_id: &str, real_id: &str) {
        if let Some(entry) = self.entries.get_mut(temp_id) {
            entry.real_id = Some(real_id.to_string());
            entry.resolved_at = Some(Instant::now());
        }
    }

    /// A failed send is waiting on the user again; restart it as unresolved.
    pub fn reopen(&mut self, temp_id: &str, timestamp: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(temp_id) {
            entry.timestamp = timestamp;
            entry.resolved_at = None;
        }
    }

    pub fn remove(&mut self, temp_id: &str) -> Option<PendingSend> {
        self.entries.remove(temp_id)
    }

    /// Temp id of the pending send `candidate` is a copy of: same server id,
    /// or same text, sender and conversation within the window.
    pub fn correlate(&self, candidate: &Candidate<'_>) -> Option<String> {
        if let Some(id) = candidate.message_id {
            let id = canonical_message_id(id);
            let by_id = self.entries.values().find(|entry| {
                entry.temp_id == id
                    || entry
                        .real_id
                        .as_deref()
                        .map(|real| canonical_message_id(real) == id)
                        .unwrap_or(false)
            });
            if let Some(entry) = by_id {
                return Some(entry.temp_id.clone());
            }
        }

        let window = chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::seconds(5));
        self.entries
            .values()
            .filter(|entry| {
                entry.sender_id == candidate.sender_id
                    && entry.text == candidate.text
                    && same_conversation(&entry.conversation_id, candidate.conversation_id).is_some()
                    && gap(entry.timestamp, candidate.timestamp) <= window
            })
            .min_by_key(|entry| gap(entry.timestamp, candidate.timestamp))
            .map(|entry| entry.temp_id.clone())
    }

    /// Drop entries resolved more than `gc_after` before `now`.
    pub fn prune(&mut self, now: Instant) -> usize {
        let gc_after = self.gc_after;
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.resolved_at {
            Some(at) => now.saturating_duration_since(at) < gc_after,
            None => true,
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Pruned {} resolved pending sends", removed);
        }
        removed
    }
}

pub(crate) fn gap(a: DateTime<Utc>, b: DateTime<Utc>) -> chrono::Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

// Deciding whether an inbound event belongs to the selected conversation.
// Backend conversation ids vary in case, participant order and a handful of
// visually confusable characters, so the match is done in stages, first hit
// wins.

use log::warn;

use crate::models::{derive_other_participant, normalize_id, same_user, CONVERSATION_PREFIX};

/// Why an event was accepted for the active conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    /// Ids equal after normalization.
    Exact,
    /// Ids equal once the `conv_` prefix is removed from both.
    Prefixless,
    /// Same two participants, in either order.
    Participants,
    /// The event's sender/receiver pair is exactly us and the other
    /// participant.
    SenderPair,
    /// Could not be attributed anywhere else but names the current user.
    FailOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(MatchReason),
    Mismatch,
}

impl MatchOutcome {
    pub fn is_match(self) -> bool {
        matches!(self, MatchOutcome::Matched(_))
    }

    /// A match that did not rely on the fail-open fallback.
    pub fn is_confident(self) -> bool {
        matches!(self, MatchOutcome::Matched(reason) if reason != MatchReason::FailOpen)
    }
}

/// The routing fields of an inbound event.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventRoute<'a> {
    pub conversation_id: Option<&'a str>,
    pub sender_id: Option<&'a str>,
    pub receiver_id: Option<&'a str>,
}

fn strip_prefix(normalized: &str) -> &str {
    let prefix = normalize_id(CONVERSATION_PREFIX);
    normalized.strip_prefix(prefix.as_str()).unwrap_or(normalized)
}

/// The two participant components of a normalized id, sorted.
fn participant_pair(normalized: &str) -> Option<(String, String)> {
    let body = strip_prefix(normalized);
    let mut parts = body.split('_');
    let (a, b) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || a.is_empty() || b.is_empty() {
        return None;
    }
    let (a, b) = (a.to_string(), b.to_string());
    Some(if a <= b { (a, b) } else { (b, a) })
}

/// Whether two conversation ids name the same conversation (stages a-c).
pub fn same_conversation(a: &str, b: &str) -> Option<MatchReason> {
    let (a, b) = (normalize_id(a), normalize_id(b));
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if a == b {
        return Some(MatchReason::Exact);
    }
    if strip_prefix(&a) == strip_prefix(&b) {
        return Some(MatchReason::Prefixless);
    }
    match (participant_pair(&a), participant_pair(&b)) {
        (Some(x), Some(y)) if x == y => Some(MatchReason::Participants),
        _ => None,
    }
}

/// Match an inbound event against the selected conversation.
///
/// The fail-open stage only applies when the event cannot be attributed to
/// any conversation: it has no decomposable conversation id, its
/// sender/receiver pair is incomplete, and it still names the current user.
/// An event that clearly belongs to a different pair is a mismatch.
pub fn match_event(
    route: &EventRoute<'_>,
    selected_conversation_id: &str,
    other_participant_id: Option<&str>,
    current_user_id: &str,
) -> MatchOutcome {
    if let Some(event_id) = route.conversation_id {
        if let Some(reason) = same_conversation(event_id, selected_conversation_id) {
            return MatchOutcome::Matched(reason);
        }
    }

    let other = other_participant_id
        .map(|id| id.to_string())
        .or_else(|| derive_other_participant(selected_conversation_id, current_user_id));

    if let (Some(other), Some(sender), Some(receiver)) = (other.as_deref(), route.sender_id, route.receiver_id) {
        let forward = same_user(sender, current_user_id) && same_user(receiver, other);
        let backward = same_user(sender, other) && same_user(receiver, current_user_id);
        if forward || backward {
            return MatchOutcome::Matched(MatchReason::SenderPair);
        }
    }

    let attributable_id = route
        .conversation_id
        .map(|id| participant_pair(&normalize_id(id)).is_some())
        .unwrap_or(false);
    let complete_pair = route.sender_id.is_some() && route.receiver_id.is_some();
    let names_me = route.sender_id.map(|s| same_user(s, current_user_id)).unwrap_or(false)
        || route.receiver_id.map(|r| same_user(r, current_user_id)).unwrap_or(false);

    if !attributable_id && !complete_pair && names_me {
        warn!(
            "Accepting unattributable event into {} (conversation {:?}, sender {:?}, receiver {:?})",
            selected_conversation_id, route.conversation_id, route.sender_id, route.receiver_id
        );
        return MatchOutcome::Matched(MatchReason::FailOpen);
    }

    MatchOutcome::Mismatch
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Remote users currently typing, each with a deadline after which they are
/// dropped even if no stop signal arrives.
#[derive(Debug, Default, Clone)]
pub struct TypingSet {
    deadlines: HashMap<String, Instant>,
}

impl TypingSet {
    pub fn start(&mut self, user_id: &str, now: Instant, expiry: Duration) {
        self.deadlines.insert(user_id.to_string(), now + expiry);
    }

    /// Returns true if the user was in the set.
    pub fn stop(&mut self, user_id: &str) -> bool {
        self.deadlines.remove(user_id).is_some()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Drop expired entries; true if anything changed.
    pub fn prune(&mut self, now: Instant) -> bool {
        let before = self.deadlines.len();
        self.deadlines.retain(|_, deadline| *deadline > now);
        before != self.deadlines.len()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.deadlines.contains_key(user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Sorted for stable display.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.deadlines.keys().cloned().collect();
        users.sort();
        users
    }
}

/// Our own outbound typing signal. Every keystroke bumps the epoch; the idle
/// timer armed for an older epoch does nothing.
#[derive(Debug, Default, Clone)]
pub struct OutboundTyping {
    epoch: u64,
    active: Option<ActiveTyping>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTyping {
    pub conversation_id: String,
    pub receiver_id: String,
}

impl OutboundTyping {
    /// Register a keystroke. Returns the epoch to arm the idle timer with and
    /// whether a start signal has to go out.
    pub fn keystroke(&mut self, conversation_id: &str, receiver_id: &str) -> (u64, bool) {
        self.epoch += 1;
        let target = ActiveTyping {
            conversation_id: conversation_id.to_string(),
            receiver_id: receiver_id.to_string(),
        };
        let started = self.active.as_ref() != Some(&target);
        self.active = Some(target);
        (self.epoch, started)
    }

    /// Stop unconditionally; returns what we were typing into, if anything.
    pub fn stop(&mut self) -> Option<ActiveTyping> {
        self.epoch += 1;
        self.active.take()
    }

    /// Idle timer fired: stop only if nothing happened since it was armed.
    pub fn expire(&mut self, epoch: u64) -> Option<ActiveTyping> {
        if epoch == self.epoch {
            self.active.take()
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_set_expires() {
        let mut set = TypingSet::default();
        let now = Instant::now();
        set.start("b", now, Duration::from_secs(5));
        assert!(!set.prune(now + Duration::from_secs(4)));
        assert!(set.contains("b"));
        assert!(set.prune(now + Duration::from_secs(6)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_outbound_start_sent_once() {
        let mut typing = OutboundTyping::default();
        let (first, started) = typing.keystroke("conv_a_b", "b");
        assert!(started);
        let (second, started) = typing.keystroke("conv_a_b", "b");
        assert!(!started);

        // the first timer is stale
        assert_eq!(typing.expire(first), None);
        assert!(typing.is_active());
        assert_eq!(typing.expire(second).map(|a| a.receiver_id), Some("b".to_string()));
        assert!(!typing.is_active());
    }

    #[test]
    fn test_stop_invalidates_timer() {
        let mut typing = OutboundTyping::default();
        let (epoch, _) = typing.keystroke("conv_a_b", "b");
        assert!(typing.stop().is_some());
        assert_eq!(typing.expire(epoch), None);
        assert_eq!(typing.stop(), None);
    }
}

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Client-side typing indicators. An indicator expires if no `typing:stop`
/// arrives within the timeout.
#[derive(Debug)]
pub struct TypingTracker {
    timeout: Duration,
    active: HashMap<(Uuid, Uuid), Instant>,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: HashMap::new(),
        }
    }

    /// Starts or refreshes an indicator.
    pub fn start(&mut self, conversation_id: Uuid, user_id: Uuid) {
        self.active
            .insert((conversation_id, user_id), Instant::now() + self.timeout);
    }

    /// Returns true if the indicator was active.
    pub fn stop(&mut self, conversation_id: Uuid, user_id: Uuid) -> bool {
        self.active.remove(&(conversation_id, user_id)).is_some()
    }

    /// Users currently typing in a conversation.
    pub fn typing_in(&self, conversation_id: Uuid) -> Vec<Uuid> {
        let now = Instant::now();
        let mut users: Vec<Uuid> = self
            .active
            .iter()
            .filter(|((conv, _), deadline)| *conv == conversation_id && **deadline > now)
            .map(|((_, user), _)| *user)
            .collect();
        users.sort();
        users
    }

    /// Earliest pending expiry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.values().min().copied()
    }

    /// Removes and returns every indicator whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(Uuid, Uuid)> {
        let expired: Vec<(Uuid, Uuid)> = self
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.active.remove(key);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

/// Bounded set of message ids already delivered to the application. The
/// oldest id is forgotten once capacity is reached.
#[derive(Debug)]
pub struct SeenMessages {
    capacity: usize,
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Records the id. Returns false if it was already seen.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

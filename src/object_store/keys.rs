use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;

/// Derives backend keys from a strictly increasing millisecond stamp.
///
/// Local keys are `{millis}-{name}`, remote keys `{owner}/{millis}-{name}`.
/// Two keys handed out by the same generator never share a stamp, even
/// within one millisecond, so same-named uploads never overwrite each other.
pub struct KeyGenerator {
    clock: Arc<dyn Clock>,
    last: AtomicI64,
}

impl KeyGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicI64::new(0),
        }
    }

    pub fn next_stamp(&self) -> i64 {
        let now = self.clock.unix_timestamp_millis();
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn local_key(&self, original_name: &str) -> String {
        format!("{}-{original_name}", self.next_stamp())
    }

    pub fn remote_key(&self, owner_id: &str, original_name: &str) -> String {
        format!("{owner_id}/{}-{original_name}", self.next_stamp())
    }
}

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Process-local record of recently seen transport message identifiers.
///
/// This only filters sender retries that land on the same instance; it is not
/// what prevents duplicate chat messages across instances.
#[derive(Debug)]
pub struct DedupGuard {
    seen: RwLock<HashMap<String, DateTime<Utc>>>,
    retention: ChronoDuration,
}

impl DedupGuard {
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: RwLock::new(HashMap::new()),
            retention: ChronoDuration::from_std(retention)
                .unwrap_or_else(|_| ChronoDuration::days(365)),
        }
    }

    /// Marks `message_id` as observed at `now`, returning `true` when it was
    /// already seen inside the retention window.
    pub fn observe(&self, message_id: &str, now: DateTime<Utc>) -> bool {
        {
            let seen = self.seen.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(first_seen) = seen.get(message_id) {
                if self.is_live(*first_seen, now) {
                    return true;
                }
            }
        }

        // Re-check under the write lock so two racing callers cannot both see "new".
        let mut seen = self.seen.write().unwrap_or_else(PoisonError::into_inner);
        match seen.entry(message_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if self.is_live(*entry.get(), now) {
                    true
                } else {
                    entry.insert(now);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                false
            }
        }
    }

    /// Drops entries older than the retention window, returning how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut seen = self.seen.write().unwrap_or_else(PoisonError::into_inner);
        let before = seen.len();
        seen.retain(|_, first_seen| self.is_live(*first_seen, now));
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_live(&self, first_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(first_seen) < self.retention
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).expect("valid timestamp")
    }

    #[test]
    fn second_observation_is_reported_as_seen() {
        let guard = DedupGuard::new(Duration::from_secs(900));
        assert!(!guard.observe("msg-1", at(0)));
        assert!(guard.observe("msg-1", at(10)));
        assert!(!guard.observe("msg-2", at(10)));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn expired_entries_count_as_new_and_are_swept() {
        let guard = DedupGuard::new(Duration::from_secs(900));
        assert!(!guard.observe("msg-1", at(0)));
        assert!(!guard.observe("msg-2", at(600)));

        assert_eq!(guard.sweep(at(901)), 1);
        assert_eq!(guard.len(), 1);

        assert!(!guard.observe("msg-2", at(1600)));
        assert!(guard.observe("msg-2", at(1601)));
    }

    #[test]
    fn concurrent_observers_agree_on_a_single_first_sighting() {
        let guard = Arc::new(DedupGuard::new(Duration::from_secs(900)));
        let fresh = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..16 {
                let guard = guard.clone();
                let fresh = fresh.clone();
                scope.spawn(move || {
                    if !guard.observe("msg-race", at(0)) {
                        fresh.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(fresh.load(Ordering::SeqCst), 1);
    }
}

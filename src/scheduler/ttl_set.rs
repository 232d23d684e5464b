//! Time-bounded membership set.
//!
//! Holds booked-job fingerprints between offer selection and the durable
//! STAGING write. Entries expire by time, not count; a janitor sweep drops
//! expired keys so the map does not grow with abandoned bookings.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Mutex-guarded set whose entries expire after a fixed TTL.
pub struct TtlSet {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl TtlSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, key: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), Instant::now());
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// True if the key is present and not expired.
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(inserted) => inserted.elapsed() <= self.ttl,
            None => false,
        }
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, inserted| inserted.elapsed() <= self.ttl);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains_remove() {
        let set = TtlSet::new(Duration::from_secs(60));
        assert!(!set.contains("g:p:a"));
        set.insert("g:p:a");
        assert!(set.contains("g:p:a"));
        set.remove("g:p:a");
        assert!(!set.contains("g:p:a"));
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let set = TtlSet::new(Duration::ZERO);
        set.insert("g:p:a");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!set.contains("g:p:a"));
    }

    #[test]
    fn test_sweep_drops_expired_only() {
        let set = TtlSet::new(Duration::from_millis(20));
        set.insert("old");
        std::thread::sleep(Duration::from_millis(30));
        set.insert("fresh");
        set.sweep();
        assert_eq!(set.len(), 1);
        assert!(set.contains("fresh"));
    }
}

//! Per-session class cache
//!
//! An explicit keyed store with injected session identity, never implicit
//! process-wide state, so multiple concurrent sessions (tests, several
//! targets) cannot cross-contaminate. A record is only ever replaced whole:
//! readers see the previous full enumeration or the new one, never a mix.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::types::{ClassInfo, ProcessSession};

/// One full, unfiltered enumeration of a session's classes.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub session: ProcessSession,
    /// Discovery-ordered; every entry has a non-empty name and a unique
    /// handle.
    pub classes: Vec<ClassInfo>,
    pub built_at: SystemTime,
    /// Batch size the enumeration ran with.
    pub batch_size: usize,
    /// Handles dropped because their name could not be resolved.
    pub dropped: usize,
}

impl CacheRecord {
    pub fn new(
        session: ProcessSession,
        classes: Vec<ClassInfo>,
        batch_size: usize,
        dropped: usize,
    ) -> Self {
        Self {
            session,
            classes,
            built_at: SystemTime::now(),
            batch_size,
            dropped,
        }
    }
}

/// Keyed store of cache records, one per live session.
#[derive(Debug, Default)]
pub struct ClassCache {
    records: HashMap<ProcessSession, CacheRecord>,
}

impl ClassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks, never triggers enumeration.
    pub fn lookup(&self, session: &ProcessSession) -> Option<&CacheRecord> {
        self.records.get(session)
    }

    /// Replace the session's record wholesale. Records keyed to an earlier
    /// generation of the same pid are orphans of a dead process and are
    /// dropped rather than left to collide.
    pub fn populate(&mut self, record: CacheRecord) {
        let session = record.session;
        self.records
            .retain(|key, _| key.pid != session.pid || key.generation == session.generation);
        self.records.insert(session, record);
    }

    /// Forget the session's record. Returns whether one existed.
    pub fn invalidate(&mut self, session: &ProcessSession) -> bool {
        self.records.remove(session).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassHandle;

    fn record(session: ProcessSession, names: &[&str]) -> CacheRecord {
        let classes = names
            .iter()
            .enumerate()
            .map(|(i, name)| ClassInfo::new(ClassHandle(0x1000 + i as u64 * 8), *name))
            .collect();
        CacheRecord::new(session, classes, 35, 0)
    }

    #[test]
    fn test_populate_then_lookup_returns_exactly_what_went_in() {
        let mut cache = ClassCache::new();
        let session = ProcessSession::new(42, 1);
        let original = record(session, &["IDSFoo", "IDSBar", "NSFoo"]);
        let expected = original.classes.clone();

        cache.populate(original);
        let looked_up = cache.lookup(&session).unwrap();
        assert_eq!(looked_up.classes, expected);
        assert_eq!(looked_up.dropped, 0);
    }

    #[test]
    fn test_lookup_misses_other_sessions() {
        let mut cache = ClassCache::new();
        cache.populate(record(ProcessSession::new(42, 1), &["A"]));

        assert!(cache.lookup(&ProcessSession::new(43, 1)).is_none());
        assert!(cache.lookup(&ProcessSession::new(42, 2)).is_none());
    }

    #[test]
    fn test_populate_replaces_whole_record() {
        let mut cache = ClassCache::new();
        let session = ProcessSession::new(42, 1);
        cache.populate(record(session, &["Old1", "Old2"]));
        cache.populate(record(session, &["New"]));

        let looked_up = cache.lookup(&session).unwrap();
        assert_eq!(looked_up.classes.len(), 1);
        assert_eq!(looked_up.classes[0].name, "New");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_forgets_only_that_session() {
        let mut cache = ClassCache::new();
        let a = ProcessSession::new(42, 1);
        let b = ProcessSession::new(99, 1);
        cache.populate(record(a, &["A"]));
        cache.populate(record(b, &["B"]));

        assert!(cache.invalidate(&a));
        assert!(!cache.invalidate(&a));
        assert!(cache.lookup(&a).is_none());
        assert!(cache.lookup(&b).is_some());
    }

    #[test]
    fn test_relaunch_evicts_stale_generation() {
        let mut cache = ClassCache::new();
        let old = ProcessSession::new(42, 1);
        let relaunched = ProcessSession::new(42, 2);
        cache.populate(record(old, &["Stale"]));
        cache.populate(record(relaunched, &["Fresh"]));

        assert!(cache.lookup(&old).is_none());
        assert_eq!(cache.lookup(&relaunched).unwrap().classes[0].name, "Fresh");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_pids_coexist() {
        let mut cache = ClassCache::new();
        cache.populate(record(ProcessSession::new(42, 1), &["A"]));
        cache.populate(record(ProcessSession::new(43, 7), &["B"]));
        assert_eq!(cache.len(), 2);
    }
}

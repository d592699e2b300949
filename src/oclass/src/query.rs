//! Query orchestration
//!
//! The front door of the engine. A query routes through, in order: the fast
//! path (exact patterns only), the per-session cache, and full enumeration
//! (bulk array read + batched name resolution), which commits to the cache
//! only after the whole batch sequence succeeds. Matches are filtered and
//! sorted locally, then optionally augmented with image paths and ancestry
//! chains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::ancestry::{self, AncestryChain};
use crate::cache::{CacheRecord, ClassCache};
use crate::channel::{ChannelError, TargetChannel};
use crate::class_list::{self, EnumerationError};
use crate::image;
use crate::names;
use crate::pattern::{ModuleFilter, NamePattern};
use crate::runtime;
use crate::stats::QueryStats;
use crate::types::{ClassHandle, ClassInfo, ProcessSession};

/// Default handles per consolidated batch. Larger batches mean fewer
/// expensive calls but more expression-parse overhead per call; around 35
/// balanced the two in practice. A tuning input, not a semantic one.
pub const DEFAULT_BATCH_SIZE: usize = 35;

/// Most matches for which ancestry augmentation still runs.
pub const DEFAULT_ANCESTRY_LIMIT: usize = 20;

/// Cooperative cancellation flag, checked between batches. Cancelling
/// mid-enumeration leaves the previous cache record authoritative.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("query cancelled")]
    Cancelled,

    #[error(transparent)]
    Enumeration(EnumerationError),

    #[error(transparent)]
    Channel(ChannelError),
}

impl From<EnumerationError> for QueryError {
    fn from(err: EnumerationError) -> Self {
        match err {
            EnumerationError::Cancelled => QueryError::Cancelled,
            other => QueryError::Enumeration(other),
        }
    }
}

/// Knobs for one query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Bypass the cache and re-enumerate, refreshing the record.
    pub reload: bool,
    /// Drop the session's record before doing anything else.
    pub clear_cache: bool,
    /// Handles per consolidated batch.
    pub batch_size: usize,
    /// Resolve superclass chains for the matched set.
    pub include_ancestry: bool,
    /// Skip ancestry when more than this many classes matched.
    pub ancestry_limit: usize,
    /// Resolve image paths for the matched set.
    pub resolve_modules: bool,
    /// Keep only matches whose image path matches this glob.
    pub module_filter: Option<String>,
    pub cancel: Option<CancelToken>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            reload: false,
            clear_cache: false,
            batch_size: DEFAULT_BATCH_SIZE,
            include_ancestry: false,
            ancestry_limit: DEFAULT_ANCESTRY_LIMIT,
            resolve_modules: false,
            module_filter: None,
            cancel: None,
        }
    }
}

/// One matched class, with its ancestry chain when requested.
#[derive(Debug, Clone, Serialize)]
pub struct ClassMatch {
    pub class: ClassInfo,
    pub ancestry: Option<AncestryChain>,
}

/// Result of a query: lexicographically ordered matches plus accounting.
#[derive(Debug)]
pub struct QueryOutcome {
    pub matches: Vec<ClassMatch>,
    /// Classes known in the session (cache record size, or the match count
    /// on the fast path).
    pub total_classes: usize,
    /// Classes dropped because their name could not be resolved.
    pub dropped: usize,
    pub from_cache: bool,
    pub stats: QueryStats,
}

/// The enumeration engine: owns the per-session cache and drives queries
/// over a caller-supplied channel.
#[derive(Debug, Default)]
pub struct ClassInspector {
    cache: ClassCache,
}

impl ClassInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &ClassCache {
        &self.cache
    }

    /// Forget the session's cached enumeration. The next query against it
    /// re-enumerates from the target.
    pub fn clear_cache(&mut self, session: &ProcessSession) -> bool {
        self.cache.invalidate(session)
    }

    pub fn query(
        &mut self,
        channel: &dyn TargetChannel,
        pattern: &str,
        options: &QueryOptions,
    ) -> Result<QueryOutcome, QueryError> {
        let started = Instant::now();
        let mut stats = QueryStats::default();
        let session = channel.session();

        let compiled = NamePattern::parse(pattern)?;
        let module_filter = options
            .module_filter
            .as_deref()
            .map(ModuleFilter::parse)
            .transpose()?;
        if options.clear_cache {
            self.cache.invalidate(&session);
        }
        stats.setup = started.elapsed();

        if let Some(name) = compiled.as_exact() {
            return exact_query(channel, name, options, module_filter.as_ref(), stats, started);
        }

        let mut matched = Vec::new();
        let mut total = 0usize;
        let mut dropped = 0usize;
        let mut from_cache = false;

        if !options.reload {
            if let Some(record) = self.cache.lookup(&session) {
                matched = filter_classes(&record.classes, &compiled);
                total = record.classes.len();
                dropped = record.dropped;
                from_cache = true;
            }
        }

        if !from_cache {
            let bulk_started = Instant::now();
            let handles = class_list::read_class_handles(channel, &mut stats)?;
            stats.bulk_read = bulk_started.elapsed();

            let batching_started = Instant::now();
            let resolved = names::resolve_names(
                channel,
                &handles,
                options.batch_size,
                options.cancel.as_ref(),
                &mut stats,
            )?;
            stats.batching = batching_started.elapsed();

            matched = filter_classes(&resolved.classes, &compiled);
            total = resolved.classes.len();
            dropped = resolved.dropped;
            // Commit point: the full batch sequence completed.
            self.cache.populate(CacheRecord::new(
                session,
                resolved.classes,
                options.batch_size,
                dropped,
            ));
        }

        sort_matches(&mut matched);
        let matches = augment(channel, matched, options, module_filter.as_ref(), &mut stats);

        stats.total = started.elapsed();
        debug!(
            pattern,
            matched = matches.len(),
            total,
            dropped,
            from_cache,
            "query complete"
        );
        Ok(QueryOutcome {
            matches,
            total_classes: total,
            dropped,
            from_cache,
            stats,
        })
    }
}

/// Exact, non-wildcard lookup: one expensive call, no enumeration, no cache
/// involvement, case-sensitive only.
fn exact_query(
    channel: &dyn TargetChannel,
    name: &str,
    options: &QueryOptions,
    module_filter: Option<&ModuleFilter>,
    mut stats: QueryStats,
    started: Instant,
) -> Result<QueryOutcome, QueryError> {
    let value = stats
        .eval(channel, &runtime::get_class_expr(name))
        .map_err(QueryError::Channel)?;
    let matched = match value.as_pointer() {
        Some(handle) if handle != 0 => vec![ClassInfo::new(ClassHandle(handle), name)],
        _ => Vec::new(),
    };
    let matches = augment(channel, matched, options, module_filter, &mut stats);

    stats.total = started.elapsed();
    Ok(QueryOutcome {
        total_classes: matches.len(),
        dropped: 0,
        from_cache: false,
        matches,
        stats,
    })
}

fn filter_classes(classes: &[ClassInfo], pattern: &NamePattern) -> Vec<ClassInfo> {
    classes
        .iter()
        .filter(|class| pattern.matches(&class.name))
        .cloned()
        .collect()
}

/// Lexicographic by name; ties (duplicate names are legal) break by handle
/// so repeated queries order identically.
fn sort_matches(matched: &mut [ClassInfo]) {
    matched.sort_by(|a, b| a.name.cmp(&b.name).then(a.handle.cmp(&b.handle)));
}

/// Fill image paths, apply the module filter, and walk ancestry for the
/// matched set.
fn augment(
    channel: &dyn TargetChannel,
    mut matched: Vec<ClassInfo>,
    options: &QueryOptions,
    module_filter: Option<&ModuleFilter>,
    stats: &mut QueryStats,
) -> Vec<ClassMatch> {
    if (options.resolve_modules || module_filter.is_some()) && !matched.is_empty() {
        let handles: Vec<ClassHandle> = matched.iter().map(|c| c.handle).collect();
        let paths = image::resolve_image_paths(channel, &handles, options.batch_size, stats);
        for class in &mut matched {
            class.module_path = paths.get(&class.handle).cloned();
        }
        if let Some(filter) = module_filter {
            matched.retain(|class| filter.matches(class.module_path.as_deref()));
        }
    }

    let chains: Vec<Option<AncestryChain>> =
        if options.include_ancestry && !matched.is_empty() && matched.len() <= options.ancestry_limit
        {
            ancestry::walk(channel, &mut matched, options.batch_size, stats)
                .into_iter()
                .map(Some)
                .collect()
        } else {
            vec![None; matched.len()]
        };

    matched
        .into_iter()
        .zip(chains)
        .map(|(class, ancestry)| ClassMatch { class, ancestry })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::MockChannel;

    fn names(outcome: &QueryOutcome) -> Vec<&str> {
        outcome
            .matches
            .iter()
            .map(|m| m.class.name.as_str())
            .collect()
    }

    fn foo_channel(count: usize) -> MockChannel {
        let channel = MockChannel::new(1234);
        for i in 0..count {
            channel.add_class(&format!("Foo{i}"));
        }
        channel
    }

    #[test]
    fn test_scenario_hundred_classes_batch_ten() {
        let channel = foo_channel(100);
        let mut inspector = ClassInspector::new();
        let options = QueryOptions {
            batch_size: 10,
            ..QueryOptions::default()
        };

        let outcome = inspector.query(&channel, "", &options).unwrap();

        assert_eq!(outcome.matches.len(), 100);
        assert_eq!(outcome.total_classes, 100);
        assert!(!outcome.from_cache);
        // ceil(100/10) batch evaluations, and exactly two bulk reads for
        // the pointer array phase (header + array).
        assert_eq!(channel.calls("batch_names"), 10);
        assert_eq!(channel.calls("copy_list"), 1);
        assert_eq!(outcome.stats.memory_reads, 2 + 10);

        // String sort, not numeric: Foo1 < Foo10 < Foo2, Foo9 last-ish.
        let sorted = names(&outcome);
        assert_eq!(sorted[0], "Foo0");
        assert_eq!(sorted[1], "Foo1");
        assert_eq!(sorted[2], "Foo10");
        assert_eq!(sorted[99], "Foo99");
        let mut expected: Vec<String> = (0..100).map(|i| format!("Foo{i}")).collect();
        expected.sort();
        assert_eq!(sorted, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_scenario_wildcard_prefix_query() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo", "IDSBar", "NSFoo"]);
        let mut inspector = ClassInspector::new();

        let outcome = inspector
            .query(&channel, "IDS*", &QueryOptions::default())
            .unwrap();

        assert_eq!(names(&outcome), vec!["IDSBar", "IDSFoo"]);
        assert_eq!(outcome.total_classes, 3);
    }

    #[test]
    fn test_wildcard_is_case_insensitive() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo", "NSFoo"]);
        let mut inspector = ClassInspector::new();

        let outcome = inspector
            .query(&channel, "ids*", &QueryOptions::default())
            .unwrap();
        assert_eq!(names(&outcome), vec!["IDSFoo"]);
    }

    #[test]
    fn test_idempotent_queries_and_cache_hit() {
        let channel = foo_channel(30);
        let mut inspector = ClassInspector::new();
        let options = QueryOptions::default();

        let first = inspector.query(&channel, "Foo*", &options).unwrap();
        let second = inspector.query(&channel, "Foo*", &options).unwrap();

        assert_eq!(names(&first), names(&second));
        assert!(!first.from_cache);
        assert!(second.from_cache);
        // The cached query touched the target not at all.
        assert_eq!(second.stats.evaluations, 0);
        assert_eq!(second.stats.memory_reads, 0);
    }

    #[test]
    fn test_scenario_exact_pattern_is_one_call() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo", "IDSBar", "NSFoo"]);
        let mut inspector = ClassInspector::new();

        let outcome = inspector
            .query(&channel, "IDSFoo", &QueryOptions::default())
            .unwrap();

        assert_eq!(names(&outcome), vec!["IDSFoo"]);
        assert_eq!(outcome.stats.evaluations, 1);
        assert_eq!(channel.calls("fast_path"), 1);
        assert_eq!(channel.calls("copy_list"), 0);
        // The fast path never populates the cache.
        assert!(inspector.cache().is_empty());
    }

    #[test]
    fn test_exact_miss_is_empty_without_enumeration() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo"]);
        let mut inspector = ClassInspector::new();

        let outcome = inspector
            .query(&channel, "NoSuchClass", &QueryOptions::default())
            .unwrap();

        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.stats.evaluations, 1);
    }

    #[test]
    fn test_exact_match_is_case_sensitive() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo"]);
        let mut inspector = ClassInspector::new();

        let outcome = inspector
            .query(&channel, "idsfoo", &QueryOptions::default())
            .unwrap();
        assert!(outcome.matches.is_empty());
    }

    #[test]
    fn test_fast_path_equivalence_with_enumeration() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo", "IDSFox", "NSFoo"]);
        let mut inspector = ClassInspector::new();

        let fast = inspector
            .query(&channel, "IDSFoo", &QueryOptions::default())
            .unwrap();
        // `IDSFo?` matches IDSFoo and IDSFox; intersect down to the same
        // class via the full enumeration path.
        let full = inspector
            .query(&channel, "IDSFo?", &QueryOptions::default())
            .unwrap();
        let via_enumeration = full
            .matches
            .iter()
            .find(|m| m.class.name == "IDSFoo")
            .unwrap();

        assert_eq!(fast.matches.len(), 1);
        assert_eq!(fast.matches[0].class.handle, via_enumeration.class.handle);
        assert_eq!(fast.matches[0].class.name, via_enumeration.class.name);
    }

    #[test]
    fn test_clear_cache_forces_reenumeration() {
        let channel = foo_channel(12);
        let mut inspector = ClassInspector::new();
        let options = QueryOptions::default();

        inspector.query(&channel, "*", &options).unwrap();
        inspector.query(&channel, "*", &options).unwrap();
        assert_eq!(channel.calls("copy_list"), 1);

        let cleared = QueryOptions {
            clear_cache: true,
            ..QueryOptions::default()
        };
        let outcome = inspector.query(&channel, "*", &cleared).unwrap();

        assert!(!outcome.from_cache);
        assert_eq!(channel.calls("copy_list"), 2);
        assert!(channel.calls("batch_names") >= 2);
    }

    #[test]
    fn test_reload_sees_newly_registered_classes() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo"]);
        let mut inspector = ClassInspector::new();
        let options = QueryOptions::default();

        inspector.query(&channel, "*", &options).unwrap();
        channel.add_class("IDSLate");

        let stale = inspector.query(&channel, "IDS*", &options).unwrap();
        assert_eq!(names(&stale), vec!["IDSFoo"]);

        let reload = QueryOptions {
            reload: true,
            ..QueryOptions::default()
        };
        let fresh = inspector.query(&channel, "IDS*", &reload).unwrap();
        assert_eq!(names(&fresh), vec!["IDSFoo", "IDSLate"]);
    }

    #[test]
    fn test_batch_size_is_not_semantic() {
        for batch_size in [3, 35] {
            let channel = foo_channel(23);
            let mut inspector = ClassInspector::new();
            let options = QueryOptions {
                batch_size,
                ..QueryOptions::default()
            };
            let outcome = inspector.query(&channel, "*", &options).unwrap();
            assert_eq!(outcome.matches.len(), 23);
            let mut expected: Vec<String> = (0..23).map(|i| format!("Foo{i}")).collect();
            expected.sort();
            assert_eq!(
                names(&outcome),
                expected.iter().map(String::as_str).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_cancelled_query_leaves_previous_record() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo", "IDSBar"]);
        let mut inspector = ClassInspector::new();

        inspector
            .query(&channel, "*", &QueryOptions::default())
            .unwrap();
        channel.add_class("IDSLate");

        let token = CancelToken::new();
        token.cancel();
        let options = QueryOptions {
            reload: true,
            cancel: Some(token),
            ..QueryOptions::default()
        };
        let err = inspector.query(&channel, "*", &options).unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));

        // The pre-cancellation record is still authoritative.
        let cached = inspector
            .query(&channel, "*", &QueryOptions::default())
            .unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.matches.len(), 2);
    }

    #[test]
    fn test_dropped_classes_reported_and_reported_again_from_cache() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo", "Broken", "NSFoo"]);
        channel.fail_name_of("Broken");
        let mut inspector = ClassInspector::new();

        let first = inspector
            .query(&channel, "*", &QueryOptions::default())
            .unwrap();
        assert_eq!(first.dropped, 1);
        assert_eq!(first.matches.len(), 2);

        let second = inspector
            .query(&channel, "*", &QueryOptions::default())
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.dropped, 1);
    }

    #[test]
    fn test_sessions_do_not_cross_contaminate() {
        let alpha = MockChannel::with_classes(1111, &["AlphaOnly"]);
        let beta = MockChannel::with_classes(2222, &["BetaOnly"]);
        let mut inspector = ClassInspector::new();
        let options = QueryOptions::default();

        inspector.query(&alpha, "*", &options).unwrap();
        inspector.query(&beta, "*", &options).unwrap();

        let from_alpha = inspector.query(&alpha, "*", &options).unwrap();
        assert!(from_alpha.from_cache);
        assert_eq!(names(&from_alpha), vec!["AlphaOnly"]);
        assert_eq!(inspector.cache().len(), 2);
    }

    #[test]
    fn test_relaunched_target_is_not_served_stale_classes() {
        let channel = MockChannel::with_classes(1234, &["OldGen"]);
        let mut inspector = ClassInspector::new();
        let options = QueryOptions::default();

        inspector.query(&channel, "*", &options).unwrap();
        channel.relaunch();
        channel.add_class("NewGen");

        let outcome = inspector.query(&channel, "*", &options).unwrap();
        assert!(!outcome.from_cache);
        assert_eq!(names(&outcome), vec!["NewGen", "OldGen"]);
        assert_eq!(inspector.cache().len(), 1);
    }

    #[test]
    fn test_module_filter_keeps_only_matching_images() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo", "NSFoo"]);
        channel.set_image("IDSFoo", "/System/Library/PrivateFrameworks/IDS.framework/IDS");
        channel.set_image("NSFoo", "/System/Library/Frameworks/Foundation.framework/Foundation");
        let mut inspector = ClassInspector::new();

        let options = QueryOptions {
            module_filter: Some("*IDS*".into()),
            ..QueryOptions::default()
        };
        let outcome = inspector.query(&channel, "*Foo", &options).unwrap();

        assert_eq!(names(&outcome), vec!["IDSFoo"]);
        assert_eq!(
            outcome.matches[0].class.module_path.as_deref(),
            Some("/System/Library/PrivateFrameworks/IDS.framework/IDS")
        );
    }

    #[test]
    fn test_ancestry_augments_fast_path_match() {
        let channel = MockChannel::with_classes(1234, &["NSObject", "UIResponder", "UIView"]);
        channel.link_parent("UIView", "UIResponder");
        channel.link_parent("UIResponder", "NSObject");
        let mut inspector = ClassInspector::new();

        let options = QueryOptions {
            include_ancestry: true,
            ..QueryOptions::default()
        };
        let outcome = inspector.query(&channel, "UIView", &options).unwrap();

        let chain = outcome.matches[0].ancestry.as_ref().unwrap();
        assert_eq!(chain.links, vec!["UIResponder", "NSObject"]);
        assert_eq!(
            outcome.matches[0].class.parent,
            Some(ClassHandle(channel.handle_of("UIResponder")))
        );
    }

    #[test]
    fn test_ancestry_skipped_above_limit() {
        let channel = MockChannel::with_classes(1234, &["NSObject", "A1", "A2", "A3"]);
        for name in ["A1", "A2", "A3"] {
            channel.link_parent(name, "NSObject");
        }
        let mut inspector = ClassInspector::new();

        let options = QueryOptions {
            include_ancestry: true,
            ancestry_limit: 2,
            ..QueryOptions::default()
        };
        let outcome = inspector.query(&channel, "A?", &options).unwrap();

        assert_eq!(outcome.matches.len(), 3);
        assert!(outcome.matches.iter().all(|m| m.ancestry.is_none()));
        assert_eq!(channel.calls("batch_super"), 0);
    }

    #[test]
    fn test_unavailable_target_aborts_query() {
        let channel = MockChannel::with_classes(1234, &["IDSFoo"]);
        channel.unavailable.set(true);
        let mut inspector = ClassInspector::new();

        let err = inspector
            .query(&channel, "*", &QueryOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Enumeration(EnumerationError::SourceUnavailable(_))
        ));
        assert!(inspector.cache().is_empty());
    }
}

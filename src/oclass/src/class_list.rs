//! Bulk class pointer array extraction
//!
//! Snapshots the target's registered-class list with a fixed number of
//! expensive calls regardless of how many classes exist: one compound
//! evaluation parks `[list_ptr, count]` in a scratch header, two bulk reads
//! copy the header and the pointer array out, and one closing evaluation
//! frees the scratch plus the runtime-owned list.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use crate::batch::release_expr;
use crate::channel::{ChannelError, TargetChannel};
use crate::runtime;
use crate::stats::QueryStats;
use crate::types::ClassHandle;

/// Upper bound on a plausible registered-class count. A header decoding to
/// more than this is corrupt scratch, not a real runtime.
const MAX_CLASS_COUNT: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum EnumerationError {
    /// The target refused the list snapshot call.
    #[error("class list enumeration refused by target: {0}")]
    SourceUnavailable(String),

    /// The pointer array read came back short; the whole array is discarded.
    #[error("class pointer array truncated: expected {expected} bytes, read {actual}")]
    TruncatedRead { expected: usize, actual: usize },

    /// The caller aborted mid-enumeration; nothing was committed.
    #[error("enumeration aborted before completion")]
    Cancelled,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Read the full class handle array out of the target.
///
/// Returns handles in registration order, null entries skipped and
/// duplicates dropped. Exactly two expensive calls are issued.
pub fn read_class_handles(
    channel: &dyn TargetChannel,
    stats: &mut QueryStats,
) -> Result<Vec<ClassHandle>, EnumerationError> {
    let header_ptr = stats
        .eval(channel, &runtime::copy_class_list_expr())
        .map_err(|err| EnumerationError::SourceUnavailable(err.to_string()))?
        .as_pointer()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            EnumerationError::SourceUnavailable("scratch allocation failed in target".into())
        })?;

    let order = channel.byte_order();
    let header = match stats.read(channel, header_ptr, 16) {
        Ok(bytes) if bytes.len() >= 16 => bytes,
        Ok(bytes) => {
            release_scratch(channel, stats, &[header_ptr]);
            return Err(EnumerationError::TruncatedRead {
                expected: 16,
                actual: bytes.len(),
            });
        }
        Err(err) => {
            release_scratch(channel, stats, &[header_ptr]);
            return Err(err.into());
        }
    };
    let list_ptr = order.read_u64(&header[0..8]);
    let count = order.read_u64(&header[8..16]);

    if count == 0 {
        release_scratch(channel, stats, &[header_ptr, list_ptr]);
        return Ok(Vec::new());
    }
    if list_ptr == 0 || count > MAX_CLASS_COUNT {
        release_scratch(channel, stats, &[header_ptr]);
        return Err(EnumerationError::SourceUnavailable(format!(
            "implausible class list header: ptr {list_ptr:#x}, count {count}"
        )));
    }

    let width = channel.pointer_width();
    let array_len = count as usize * width;
    let array = match stats.read(channel, list_ptr, array_len) {
        Ok(bytes) => bytes,
        Err(err) => {
            release_scratch(channel, stats, &[header_ptr, list_ptr]);
            return Err(err.into());
        }
    };
    release_scratch(channel, stats, &[header_ptr, list_ptr]);

    if array.len() < array_len {
        return Err(EnumerationError::TruncatedRead {
            expected: array_len,
            actual: array.len(),
        });
    }

    let mut seen = HashSet::with_capacity(count as usize);
    let mut handles = Vec::with_capacity(count as usize);
    for chunk in array.chunks_exact(width) {
        let handle = order.read_ptr(chunk, width);
        if handle != 0 && seen.insert(handle) {
            handles.push(ClassHandle(handle));
        }
    }

    debug!(count, decoded = handles.len(), "read class pointer array");
    Ok(handles)
}

/// Free scratch left in the target. Best-effort cleanup on both the success
/// and failure paths.
fn release_scratch(channel: &dyn TargetChannel, stats: &mut QueryStats, addrs: &[u64]) {
    let addrs: Vec<u64> = addrs.iter().copied().filter(|a| *a != 0).collect();
    if addrs.is_empty() {
        return;
    }
    if let Err(err) = stats.eval(channel, &release_expr(&addrs)) {
        debug!(%err, "failed to release class list scratch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::MockChannel;

    #[test]
    fn test_read_class_handles_decodes_all() {
        let channel = MockChannel::with_classes(77, &["NSObject", "IDSFoo", "IDSBar"]);
        let mut stats = QueryStats::default();

        let handles = read_class_handles(&channel, &mut stats).unwrap();
        assert_eq!(handles.len(), 3);
        assert_eq!(handles[0].0, channel.handle_of("NSObject"));
        assert_eq!(handles[2].0, channel.handle_of("IDSBar"));
    }

    #[test]
    fn test_read_class_handles_call_counts() {
        let channel = MockChannel::with_classes(77, &["A", "B", "C", "D"]);
        let mut stats = QueryStats::default();

        read_class_handles(&channel, &mut stats).unwrap();
        // One snapshot call, one scratch release, two bulk reads.
        assert_eq!(stats.evaluations, 2);
        assert_eq!(stats.memory_reads, 2);
        assert_eq!(channel.calls("copy_list"), 1);
        assert_eq!(channel.calls("release"), 1);
    }

    #[test]
    fn test_read_class_handles_releases_scratch() {
        let channel = MockChannel::with_classes(77, &["A", "B"]);
        let mut stats = QueryStats::default();

        read_class_handles(&channel, &mut stats).unwrap();
        assert_eq!(channel.live_scratch_blocks(), 0);
    }

    #[test]
    fn test_unavailable_target_is_source_unavailable() {
        let channel = MockChannel::with_classes(77, &["A"]);
        channel.unavailable.set(true);
        let mut stats = QueryStats::default();

        let err = read_class_handles(&channel, &mut stats).unwrap_err();
        assert!(matches!(err, EnumerationError::SourceUnavailable(_)));
    }

    #[test]
    fn test_truncated_array_is_rejected_whole() {
        let channel = MockChannel::with_classes(77, &["A", "B", "C", "D", "E"]);
        channel.truncate_list.set(true);
        let mut stats = QueryStats::default();

        let err = read_class_handles(&channel, &mut stats).unwrap_err();
        match err {
            EnumerationError::TruncatedRead { expected, actual } => {
                assert_eq!(expected, 5 * 8);
                assert_eq!(actual, 3 * 8);
            }
            other => panic!("expected TruncatedRead, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_runtime_yields_empty_list() {
        let channel = MockChannel::new(77);
        let mut stats = QueryStats::default();

        let handles = read_class_handles(&channel, &mut stats).unwrap();
        assert!(handles.is_empty());
    }
}

//! Image path resolution
//!
//! Resolves which image (dylib/framework) each matched class was loaded
//! from, batched through the consolidated-buffer helper exactly like name
//! resolution. Paths are display and filter augmentation, so this is
//! best-effort: a failed batch leaves its paths unresolved instead of
//! degrading to per-handle calls.

use std::collections::HashMap;

use tracing::warn;

use crate::batch::{self, BatchLayout, ScratchQueue};
use crate::channel::TargetChannel;
use crate::runtime;
use crate::stats::QueryStats;
use crate::types::ClassHandle;

/// Resolve image paths for `handles`. Missing entries mean the target could
/// not name an image for that class.
pub(crate) fn resolve_image_paths(
    channel: &dyn TargetChannel,
    handles: &[ClassHandle],
    batch_size: usize,
    stats: &mut QueryStats,
) -> HashMap<ClassHandle, String> {
    let batch_size = batch_size.max(1);
    let mut scratch = ScratchQueue::default();
    let mut paths = HashMap::with_capacity(handles.len());

    for chunk in handles.chunks(batch_size) {
        let layout = BatchLayout::paths(chunk.len());
        let released = scratch.take();
        let body = runtime::batch_image_body(chunk, layout.payload_capacity);
        let expr = batch::wrap_block(&released, &layout, &body);

        let buffer_ptr = match stats.eval(channel, &expr) {
            Ok(value) => value.as_pointer().filter(|p| *p != 0),
            Err(err) => {
                scratch.put_back(released);
                warn!(%err, batch = chunk.len(), "image path batch failed, paths left unresolved");
                continue;
            }
        };
        let Some(buffer_ptr) = buffer_ptr else {
            continue;
        };
        scratch.push(buffer_ptr);

        let Ok(buf) = stats.read(channel, buffer_ptr, layout.buffer_len()) else {
            continue;
        };
        let Some(offsets) = batch::decode_offsets(&layout, &buf, channel.byte_order()) else {
            continue;
        };
        for (i, handle) in chunk.iter().enumerate() {
            if let Some(path) =
                batch::item_payload(&layout, &buf, &offsets, i).and_then(batch::cstr_at)
            {
                if !path.is_empty() {
                    paths.insert(*handle, path);
                }
            }
        }
    }

    scratch.release(channel, stats);
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::MockChannel;

    #[test]
    fn test_resolve_image_paths() {
        let channel = MockChannel::with_classes(3, &["NSString", "IDSFoo", "Orphan"]);
        channel.set_image("NSString", "/System/Library/Frameworks/Foundation.framework/Foundation");
        channel.set_image("IDSFoo", "/System/Library/PrivateFrameworks/IDS.framework/IDS");
        let mut stats = QueryStats::default();

        let handles: Vec<ClassHandle> = ["NSString", "IDSFoo", "Orphan"]
            .iter()
            .map(|n| ClassHandle(channel.handle_of(n)))
            .collect();
        let paths = resolve_image_paths(&channel, &handles, 35, &mut stats);

        assert_eq!(paths.len(), 2);
        assert_eq!(
            paths[&handles[1]],
            "/System/Library/PrivateFrameworks/IDS.framework/IDS"
        );
        assert!(!paths.contains_key(&handles[2]));
        assert_eq!(channel.calls("batch_image"), 1);
        assert_eq!(channel.live_scratch_blocks(), 0);
    }

    #[test]
    fn test_failed_batch_leaves_paths_unresolved() {
        let channel = MockChannel::with_classes(3, &["NSString"]);
        channel.set_image("NSString", "/usr/lib/libfoundation.dylib");
        channel.max_expr_len.set(Some(100));
        let mut stats = QueryStats::default();

        let handles = vec![ClassHandle(channel.handle_of("NSString"))];
        let paths = resolve_image_paths(&channel, &handles, 35, &mut stats);

        assert!(paths.is_empty());
    }
}

//! Batched name resolution
//!
//! Turns B separate expensive `class_getName` calls into one compound
//! evaluation per batch of B handles, then decodes the consolidated buffer
//! locally from a single bulk read. A batch that fails to evaluate (for
//! example by tripping the evaluator's expression-size limit) degrades to
//! plain single-handle calls; a handle whose individual lookup also fails is
//! dropped and counted, never fatal. Batches run in ascending handle-array
//! order, so an unchanged target always enumerates identically.

use tracing::{debug, warn};

use crate::batch::{self, BatchLayout, ScratchQueue};
use crate::channel::{ChannelError, TargetChannel};
use crate::class_list::EnumerationError;
use crate::query::CancelToken;
use crate::runtime;
use crate::stats::QueryStats;
use crate::types::{ClassHandle, ClassInfo};

/// Outcome of resolving names for one handle array.
#[derive(Debug)]
pub(crate) struct ResolvedNames {
    /// Discovery-ordered classes, every one with a non-empty name.
    pub classes: Vec<ClassInfo>,
    /// Handles whose name could not be resolved.
    pub dropped: usize,
}

pub(crate) fn resolve_names(
    channel: &dyn TargetChannel,
    handles: &[ClassHandle],
    batch_size: usize,
    cancel: Option<&CancelToken>,
    stats: &mut QueryStats,
) -> Result<ResolvedNames, EnumerationError> {
    let batch_size = batch_size.max(1);
    let mut scratch = ScratchQueue::default();
    let mut classes = Vec::with_capacity(handles.len());
    let mut dropped = 0usize;

    for chunk in handles.chunks(batch_size) {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            scratch.release(channel, stats);
            return Err(EnumerationError::Cancelled);
        }

        let mut retry = Vec::new();
        match resolve_batch(channel, chunk, &mut scratch, stats)? {
            Some(resolved) => {
                for (handle, name) in chunk.iter().zip(resolved) {
                    match name {
                        Some(name) if !name.is_empty() => {
                            classes.push(ClassInfo::new(*handle, name));
                        }
                        _ => retry.push(*handle),
                    }
                }
            }
            // The whole batch failed to evaluate; every handle goes the
            // slow way.
            None => retry.extend_from_slice(chunk),
        }

        for handle in retry {
            match resolve_single(channel, handle, stats)? {
                Some(name) => classes.push(ClassInfo::new(handle, name)),
                None => dropped += 1,
            }
        }
    }

    scratch.release(channel, stats);

    debug!(
        total = handles.len(),
        resolved = classes.len(),
        dropped,
        "batched name resolution complete"
    );
    if dropped > 0 {
        warn!(dropped, "classes could not be resolved and were dropped");
    }
    Ok(ResolvedNames { classes, dropped })
}

/// One consolidated evaluation plus one bulk read for a batch.
/// `Ok(None)` means the batch expression itself failed and the caller
/// should fall back to single-handle resolution.
fn resolve_batch(
    channel: &dyn TargetChannel,
    chunk: &[ClassHandle],
    scratch: &mut ScratchQueue,
    stats: &mut QueryStats,
) -> Result<Option<Vec<Option<String>>>, EnumerationError> {
    let layout = BatchLayout::strings(chunk.len());
    let released = scratch.take();
    let body = runtime::batch_names_body(chunk, layout.payload_capacity);
    let expr = batch::wrap_block(&released, &layout, &body);

    let buffer_ptr = match stats.eval(channel, &expr) {
        Ok(value) => value.as_pointer().filter(|p| *p != 0),
        Err(ChannelError::Unavailable) => {
            scratch.put_back(released);
            scratch.release(channel, stats);
            return Err(ChannelError::Unavailable.into());
        }
        Err(err) => {
            scratch.put_back(released);
            warn!(%err, batch = chunk.len(), "batch expression failed, degrading to single calls");
            return Ok(None);
        }
    };
    let Some(buffer_ptr) = buffer_ptr else {
        // Block ran but scratch allocation failed inside the target.
        warn!(batch = chunk.len(), "target could not allocate batch scratch");
        return Ok(None);
    };
    scratch.push(buffer_ptr);

    let buf = stats.read(channel, buffer_ptr, layout.buffer_len())?;
    let Some(offsets) = batch::decode_offsets(&layout, &buf, channel.byte_order()) else {
        warn!(batch = chunk.len(), "batch buffer read came back short");
        return Ok(None);
    };

    let names = (0..chunk.len())
        .map(|i| batch::item_payload(&layout, &buf, &offsets, i).and_then(batch::cstr_at))
        .collect();
    Ok(Some(names))
}

/// Degraded path: one expensive call for one handle. `Ok(None)` drops the
/// handle; only a vanished target aborts the enumeration.
fn resolve_single(
    channel: &dyn TargetChannel,
    handle: ClassHandle,
    stats: &mut QueryStats,
) -> Result<Option<String>, EnumerationError> {
    match stats.eval(channel, &runtime::single_name_expr(handle)) {
        Ok(value) => Ok(value
            .as_str()
            .map(str::to_string)
            .filter(|name| !name.is_empty())),
        Err(ChannelError::Unavailable) => Err(ChannelError::Unavailable.into()),
        Err(err) => {
            debug!(%handle, %err, "single name lookup failed");
            Ok(None)
        }
    }
}

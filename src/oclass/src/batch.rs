//! Consolidated-buffer batching
//!
//! The central optimization: many logical calls folded into one physical
//! evaluation that writes a self-describing buffer into target scratch
//! memory. Buffer layout:
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ offsets: (items + 1) x u32    │  <- payload offset per item, or
//! │                               │     0xFFFFFFFF if unresolved;
//! │                               │     last entry = payload bytes used
//! │ payload: capacity bytes       │  <- items' encoded results
//! └───────────────────────────────┘
//! ```
//!
//! Offset table and payload are contiguous and the full size is known
//! locally, so one bulk read fetches everything. What an item's payload
//! means is up to the instantiation (a C string for names and image paths,
//! pointer-plus-string for ancestry levels); this module only owns the
//! framing, the decode, and the deferred release of scratch buffers.

use std::fmt::Write;

use tracing::debug;

use crate::channel::{ByteOrdering, TargetChannel};
use crate::stats::QueryStats;

/// Sentinel offset marking an item the target could not resolve.
pub(crate) const OFFSET_UNRESOLVED: u32 = 0xFFFF_FFFF;

/// Payload bytes reserved per class name. Names overflowing the estimate
/// fall back to single-handle resolution rather than being truncated.
pub(crate) const NAME_CAPACITY_PER_ITEM: usize = 64;

/// Payload bytes reserved per image path; framework paths run much longer
/// than class names.
pub(crate) const PATH_CAPACITY_PER_ITEM: usize = 256;

/// Sizing of one consolidated batch buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLayout {
    pub items: usize,
    pub payload_capacity: usize,
}

impl BatchLayout {
    /// Layout for class-name payloads.
    pub fn strings(items: usize) -> Self {
        Self {
            items,
            payload_capacity: items * NAME_CAPACITY_PER_ITEM,
        }
    }

    /// Layout for image-path payloads.
    pub fn paths(items: usize) -> Self {
        Self {
            items,
            payload_capacity: items * PATH_CAPACITY_PER_ITEM,
        }
    }

    /// Layout for pointer-plus-string payloads (ancestry levels).
    pub fn pointer_strings(items: usize, pointer_width: usize) -> Self {
        Self {
            items,
            payload_capacity: items * (pointer_width + NAME_CAPACITY_PER_ITEM),
        }
    }

    pub fn offsets_len(&self) -> usize {
        (self.items + 1) * 4
    }

    pub fn buffer_len(&self) -> usize {
        self.offsets_len() + self.payload_capacity
    }
}

/// Wrap per-item statements into the immediately-invoked block that
/// allocates the consolidated buffer. `released` addresses are freed in the
/// block's prelude, folding the previous batch's cleanup into this batch's
/// evaluation instead of spending a separate expensive call on it.
pub(crate) fn wrap_block(released: &[u64], layout: &BatchLayout, body: &str) -> String {
    let mut expr = String::from("(void *)(^{\n");
    for addr in released {
        let _ = writeln!(expr, "    free((void *){addr:#x});");
    }
    let _ = write!(
        expr,
        "    char *buf = (char *)malloc({buffer_len});\n\
         \x20   if (!buf) return (void *)0;\n\
         \x20   unsigned int *offsets = (unsigned int *)buf;\n\
         \x20   char *payload = buf + {offsets_len};\n\
         \x20   unsigned int cursor = 0;\n",
        buffer_len = layout.buffer_len(),
        offsets_len = layout.offsets_len(),
    );
    expr.push_str(body);
    let _ = write!(
        expr,
        "    offsets[{items}] = cursor;\n\
         \x20   return (void *)buf;\n\
         }}())",
        items = layout.items,
    );
    expr
}

/// A free-only block releasing leftover scratch buffers.
pub(crate) fn release_expr(addrs: &[u64]) -> String {
    let mut expr = String::from("(void)(^{\n");
    for addr in addrs {
        let _ = writeln!(expr, "    free((void *){addr:#x});");
    }
    expr.push_str("}())");
    expr
}

/// Decode the offset table from a bulk-read buffer. `None` when the read
/// came back too short to contain the table.
pub(crate) fn decode_offsets(
    layout: &BatchLayout,
    buf: &[u8],
    order: ByteOrdering,
) -> Option<Vec<u32>> {
    if buf.len() < layout.offsets_len() {
        return None;
    }
    Some(
        (0..=layout.items)
            .map(|i| order.read_u32(&buf[i * 4..i * 4 + 4]))
            .collect(),
    )
}

/// Payload bytes for one item: from its offset up to the used payload end.
/// `None` for the unresolved sentinel or a malformed offset.
pub(crate) fn item_payload<'a>(
    layout: &BatchLayout,
    buf: &'a [u8],
    offsets: &[u32],
    index: usize,
) -> Option<&'a [u8]> {
    let offset = offsets[index];
    if offset == OFFSET_UNRESOLVED {
        return None;
    }
    let total = (offsets[layout.items] as usize).min(layout.payload_capacity);
    let start = layout.offsets_len() + offset as usize;
    let end = layout.offsets_len() + total;
    if offset as usize >= total || end > buf.len() {
        return None;
    }
    Some(&buf[start..end])
}

/// Read the NUL-terminated string at the start of an item payload.
pub(crate) fn cstr_at(payload: &[u8]) -> Option<String> {
    let nul = payload.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&payload[..nul]).to_string())
}

/// Scratch buffers awaiting release in the target. Each batch frees its
/// predecessor's buffer in its own block prelude; whatever is left is freed
/// by one closing expression, keeping expensive calls at ceil(M/B) + O(1).
#[derive(Debug, Default)]
pub(crate) struct ScratchQueue {
    pending: Vec<u64>,
}

impl ScratchQueue {
    pub fn take(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pending)
    }

    /// Re-queue addresses whose releasing expression never ran.
    pub fn put_back(&mut self, addrs: Vec<u64>) {
        self.pending.extend(addrs);
    }

    pub fn push(&mut self, addr: u64) {
        self.pending.push(addr);
    }

    /// Free everything still pending. Best-effort: a failure here leaks
    /// scratch in a target that is likely going away, not engine state.
    pub fn release(&mut self, channel: &dyn TargetChannel, stats: &mut QueryStats) {
        let addrs = self.take();
        if addrs.is_empty() {
            return;
        }
        if let Err(err) = stats.eval(channel, &release_expr(&addrs)) {
            debug!(%err, buffers = addrs.len(), "failed to release target scratch");
        }
    }
}

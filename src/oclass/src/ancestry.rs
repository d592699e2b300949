//! Batched superclass chain resolution
//!
//! Walks inheritance chains for a small matched set, level-synchronously:
//! every still-active chain advances one superclass per round through a
//! consolidated batch whose item payload is the parent pointer followed by
//! the parent name. A chain ends at a nil superclass, at a handle it has
//! already visited (flagged as a cycle, the chain graph in a live process
//! is externally mutable and cannot be trusted acyclic), or at the depth
//! cap. Faults are flagged on the chain, never raised.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::batch::{self, BatchLayout, ScratchQueue};
use crate::channel::{ChannelError, TargetChannel};
use crate::runtime;
use crate::stats::QueryStats;
use crate::types::{ClassHandle, ClassInfo};

/// Levels walked before a chain is declared runaway.
pub const MAX_ANCESTRY_DEPTH: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum AncestryError {
    /// The superclass chain revisited a handle; the chain is truncated at
    /// the repeat.
    #[error("superclass chain revisits {handle} at depth {depth}")]
    CycleDetected { handle: ClassHandle, depth: usize },

    /// The chain was still descending at the depth cap.
    #[error("superclass chain exceeded {max_depth} levels")]
    DepthExceeded { max_depth: usize },
}

/// Superclass names of one class, nearest first, plus any fault that
/// truncated the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AncestryChain {
    pub links: Vec<String>,
    pub fault: Option<AncestryError>,
}

struct ChainState {
    current: u64,
    first_parent: Option<u64>,
    visited: HashSet<u64>,
    links: Vec<String>,
    active: bool,
    fault: Option<AncestryError>,
}

impl ChainState {
    fn new(seed: ClassHandle) -> Self {
        Self {
            current: seed.0,
            first_parent: None,
            visited: HashSet::from([seed.0]),
            links: Vec::new(),
            active: true,
            fault: None,
        }
    }

    fn finish(&mut self) {
        self.active = false;
    }

    fn advance(&mut self, parent: u64, name: String, depth: usize) {
        if self.visited.contains(&parent) {
            self.fault = Some(AncestryError::CycleDetected {
                handle: ClassHandle(parent),
                depth,
            });
            self.active = false;
            return;
        }
        self.visited.insert(parent);
        self.links.push(name);
        self.first_parent.get_or_insert(parent);
        self.current = parent;
    }
}

/// Resolve ancestry for every seed. Also fills each seed's `parent` handle
/// from the first resolved level. Returns one chain per seed, aligned.
pub(crate) fn walk(
    channel: &dyn TargetChannel,
    seeds: &mut [ClassInfo],
    batch_size: usize,
    stats: &mut QueryStats,
) -> Vec<AncestryChain> {
    let batch_size = batch_size.max(1);
    let width = channel.pointer_width();
    let mut scratch = ScratchQueue::default();
    let mut chains: Vec<ChainState> = seeds.iter().map(|s| ChainState::new(s.handle)).collect();

    'walk: for depth in 0..MAX_ANCESTRY_DEPTH {
        let active: Vec<usize> = (0..chains.len()).filter(|&i| chains[i].active).collect();
        if active.is_empty() {
            break;
        }

        for group in active.chunks(batch_size) {
            let handles: Vec<ClassHandle> =
                group.iter().map(|&i| ClassHandle(chains[i].current)).collect();
            if !advance_group(
                channel,
                &mut chains,
                group,
                &handles,
                depth,
                width,
                &mut scratch,
                stats,
            ) {
                // Target went away; report what was resolved so far.
                warn!(depth, "target unavailable during ancestry walk");
                break 'walk;
            }
        }
    }

    scratch.release(channel, stats);

    for (seed, chain) in seeds.iter_mut().zip(chains.iter()) {
        seed.parent = chain.first_parent.map(ClassHandle);
    }

    chains
        .into_iter()
        .map(|mut chain| {
            if chain.active {
                chain.fault = Some(AncestryError::DepthExceeded {
                    max_depth: MAX_ANCESTRY_DEPTH,
                });
            }
            AncestryChain {
                links: chain.links,
                fault: chain.fault,
            }
        })
        .collect()
}

/// Advance one group of chains a single level. Returns false when the
/// target became unavailable and the walk should stop.
#[allow(clippy::too_many_arguments)]
fn advance_group(
    channel: &dyn TargetChannel,
    chains: &mut [ChainState],
    group: &[usize],
    handles: &[ClassHandle],
    depth: usize,
    width: usize,
    scratch: &mut ScratchQueue,
    stats: &mut QueryStats,
) -> bool {
    let layout = BatchLayout::pointer_strings(handles.len(), width);
    let released = scratch.take();
    let body = runtime::batch_superclass_body(handles, layout.payload_capacity, width);
    let expr = batch::wrap_block(&released, &layout, &body);

    let buffer_ptr = match stats.eval(channel, &expr) {
        Ok(value) => value.as_pointer().filter(|p| *p != 0),
        Err(ChannelError::Unavailable) => {
            scratch.put_back(released);
            return false;
        }
        Err(err) => {
            scratch.put_back(released);
            debug!(%err, "ancestry batch failed, degrading to single calls");
            return advance_group_singly(channel, chains, group, depth, stats);
        }
    };
    let Some(buffer_ptr) = buffer_ptr else {
        return advance_group_singly(channel, chains, group, depth, stats);
    };
    scratch.push(buffer_ptr);

    let buf = match stats.read(channel, buffer_ptr, layout.buffer_len()) {
        Ok(buf) => buf,
        Err(_) => return advance_group_singly(channel, chains, group, depth, stats),
    };
    let Some(offsets) = batch::decode_offsets(&layout, &buf, channel.byte_order()) else {
        return advance_group_singly(channel, chains, group, depth, stats);
    };

    for (slot, &chain_idx) in group.iter().enumerate() {
        let chain = &mut chains[chain_idx];
        let Some(payload) = batch::item_payload(&layout, &buf, &offsets, slot) else {
            chain.finish();
            continue;
        };
        if payload.len() < width {
            chain.finish();
            continue;
        }
        let parent = channel.byte_order().read_ptr(&payload[..width], width);
        match batch::cstr_at(&payload[width..]) {
            Some(name) if parent != 0 && !name.is_empty() => chain.advance(parent, name, depth),
            _ => chain.finish(),
        }
    }
    true
}

/// Two plain evaluations per chain for one level, when batching is not an
/// option.
fn advance_group_singly(
    channel: &dyn TargetChannel,
    chains: &mut [ChainState],
    group: &[usize],
    depth: usize,
    stats: &mut QueryStats,
) -> bool {
    for &chain_idx in group {
        let handle = ClassHandle(chains[chain_idx].current);
        let parent = match stats.eval(channel, &runtime::single_superclass_expr(handle)) {
            Ok(value) => value.as_pointer().unwrap_or(0),
            Err(ChannelError::Unavailable) => return false,
            Err(_) => 0,
        };
        if parent == 0 {
            chains[chain_idx].finish();
            continue;
        }
        match stats.eval(channel, &runtime::single_name_expr(ClassHandle(parent))) {
            Ok(value) => match value.as_str().filter(|n| !n.is_empty()) {
                Some(name) => chains[chain_idx].advance(parent, name.to_string(), depth),
                None => chains[chain_idx].finish(),
            },
            Err(ChannelError::Unavailable) => return false,
            Err(_) => chains[chain_idx].finish(),
        }
    }
    true
}

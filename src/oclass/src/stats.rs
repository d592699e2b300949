//! Query timing and resource accounting
//!
//! Mirrors the channel cost model: every expensive evaluation and every bulk
//! read is counted, and the enumeration phases are timed so callers can see
//! where a slow query spent its time.

use std::time::Duration;

use crate::channel::{ChannelError, TargetChannel, Value};

/// Resource usage of one query.
#[derive(Debug, Clone, Default)]
pub struct QueryStats {
    /// Wall-clock total for the query.
    pub total: Duration,
    /// Pattern parsing and cache consultation.
    pub setup: Duration,
    /// Class pointer array extraction (one compound call + bulk reads).
    pub bulk_read: Duration,
    /// Batched name resolution.
    pub batching: Duration,
    /// Expensive-channel calls issued.
    pub evaluations: u64,
    /// Cheap-channel reads issued.
    pub memory_reads: u64,
}

impl QueryStats {
    pub(crate) fn eval(
        &mut self,
        channel: &dyn TargetChannel,
        expr: &str,
    ) -> Result<Value, ChannelError> {
        self.evaluations += 1;
        channel.evaluate(expr)
    }

    pub(crate) fn read(
        &mut self,
        channel: &dyn TargetChannel,
        address: u64,
        length: usize,
    ) -> Result<Vec<u8>, ChannelError> {
        self.memory_reads += 1;
        channel.read_bytes(address, length)
    }
}

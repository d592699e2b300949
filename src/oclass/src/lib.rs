//! # oclass
//!
//! Objective-C runtime class enumeration and caching over a debugger
//! channel.
//!
//! The engine reconstructs the registered-class set of a paused target
//! process (commonly 10,000+ classes) through two asymmetric primitives: an
//! expensive remote expression evaluator and a cheap bulk memory reader.
//! The work that would naively cost one expensive call per class is folded
//! into consolidated batches - one compound evaluation writes many results
//! into a self-describing scratch buffer that a single bulk read copies out
//! - and the full result is cached per process session.
//!
//! ## Example
//!
//! ```no_run
//! use oclass::{ClassInspector, QueryOptions, TargetChannel};
//!
//! # fn run(channel: &dyn TargetChannel) -> Result<(), oclass::QueryError> {
//! let mut inspector = ClassInspector::new();
//!
//! // First wildcard query enumerates the target and fills the cache.
//! let outcome = inspector.query(channel, "IDS*", &QueryOptions::default())?;
//! for m in &outcome.matches {
//!     println!("{}", m.class.name);
//! }
//!
//! // Exact queries take the single-call fast path instead.
//! let one = inspector.query(channel, "IDSService", &QueryOptions::default())?;
//! assert!(one.matches.len() <= 1);
//! # Ok(())
//! # }
//! ```

pub mod ancestry;
mod batch;
pub mod cache;
pub mod channel;
pub mod class_list;
mod image;
mod names;
pub mod pattern;
pub mod query;
mod runtime;
pub mod stats;
pub mod types;

#[doc(inline)]
pub use ancestry::{AncestryChain, AncestryError, MAX_ANCESTRY_DEPTH};
#[doc(inline)]
pub use cache::{CacheRecord, ClassCache};
#[doc(inline)]
pub use channel::{ByteOrdering, ChannelError, TargetChannel, Value};
#[doc(inline)]
pub use class_list::EnumerationError;
#[doc(inline)]
pub use pattern::{ModuleFilter, NamePattern};
#[doc(inline)]
pub use query::{
    CancelToken, ClassInspector, ClassMatch, QueryError, QueryOptions, QueryOutcome,
    DEFAULT_ANCESTRY_LIMIT, DEFAULT_BATCH_SIZE,
};
#[doc(inline)]
pub use stats::QueryStats;
#[doc(inline)]
pub use types::{ClassHandle, ClassInfo, ProcessSession};

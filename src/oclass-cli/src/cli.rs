//! CLI argument definitions for ocls

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "ocls",
    version,
    about = "Find Objective-C classes in a paused target process",
    long_about = "Find Objective-C classes in a paused target process.\n\n\
        Pattern matching:\n\
        \x20 - no wildcards: exact match (case-sensitive), single-call fast path\n\
        \x20 - with * / ?: glob match (case-insensitive) over the cached class list\n\
        \x20 - empty: list every class"
)]
pub struct Cli {
    /// Class name or wildcard pattern (* and ?); omit to list all classes
    pub pattern: Option<String>,

    /// Force reload from the runtime, refreshing the cache
    #[arg(long)]
    pub reload: bool,

    /// Clear the cache for the current process before querying
    #[arg(long)]
    pub clear_cache: bool,

    /// Classes resolved per batched expression evaluation
    #[arg(long, default_value_t = oclass::DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Show the superclass chain for each match
    #[arg(long)]
    pub ancestry: bool,

    /// Show the image (dylib) each match was loaded from
    #[arg(long)]
    pub modules: bool,

    /// Only show classes from images matching this pattern
    #[arg(long, value_name = "PATTERN")]
    pub dylib: Option<String>,

    /// Emit matches as JSON instead of a listing
    #[arg(long)]
    pub json: bool,

    /// Show a detailed timing breakdown
    #[arg(short, long)]
    pub verbose: bool,

    /// Unix socket of the debugger-side bridge adapter
    #[arg(
        long,
        env = "OCLS_BRIDGE_SOCKET",
        default_value = "/tmp/ocls-bridge.sock"
    )]
    pub socket: PathBuf,
}

mod bridge;
mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bridge::BridgeChannel;
use cli::Cli;
use oclass::{ClassInspector, QueryOptions, QueryOutcome};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let channel = BridgeChannel::connect(&cli.socket)
        .with_context(|| format!("no debugger bridge at {}", cli.socket.display()))?;

    let pattern = cli.pattern.clone().unwrap_or_default();
    let options = QueryOptions {
        reload: cli.reload,
        clear_cache: cli.clear_cache,
        batch_size: cli.batch_size.max(1),
        include_ancestry: cli.ancestry,
        resolve_modules: cli.modules,
        module_filter: cli.dylib.clone(),
        ..QueryOptions::default()
    };

    let mut inspector = ClassInspector::new();
    let outcome = inspector.query(&channel, &pattern, &options)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.matches)?);
    } else {
        print_matches(&outcome, &pattern, cli.dylib.as_deref());
        print_summary(&outcome, cli.verbose);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "oclass=debug" } else { "oclass=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_matches(outcome: &QueryOutcome, pattern: &str, dylib: Option<&str>) {
    let mut filters = Vec::new();
    if !pattern.is_empty() {
        filters.push(format!("pattern: {pattern}"));
    }
    if let Some(dylib) = dylib {
        filters.push(format!("dylib: {dylib}"));
    }
    let filter_note = if filters.is_empty() {
        String::new()
    } else {
        format!(" matching {}", filters.join(", "))
    };

    if outcome.matches.is_empty() {
        println!("No classes found{filter_note}");
    } else {
        println!("Found {} class(es){filter_note}:", outcome.matches.len());
        for m in &outcome.matches {
            match m.ancestry.as_ref().filter(|chain| !chain.links.is_empty()) {
                Some(chain) => {
                    println!("  {} -> {}", m.class.name, chain.links.join(" -> "));
                }
                None => println!("  {}", m.class.name),
            }
            if let Some(path) = &m.class.module_path {
                println!("      {path}");
            }
        }
    }

    if outcome.dropped > 0 {
        println!("{} class(es) could not be resolved", outcome.dropped);
    }
}

fn print_summary(outcome: &QueryOutcome, verbose: bool) {
    let stats = &outcome.stats;
    let seconds = stats.total.as_secs_f64();
    println!();
    if verbose {
        println!("Performance summary{}:", if outcome.from_cache { " (from cache)" } else { "" });
        println!("  Total time:     {seconds:.3}s");
        println!(
            "  Classes:        {} total, {} matched",
            outcome.total_classes,
            outcome.matches.len()
        );
        if !outcome.from_cache {
            println!("    Setup:        {:.3}s", stats.setup.as_secs_f64());
            println!("    Bulk read:    {:.3}s", stats.bulk_read.as_secs_f64());
            println!("    Batching:     {:.3}s", stats.batching.as_secs_f64());
            println!("  Expressions:    {}", stats.evaluations);
            println!("  Memory reads:   {}", stats.memory_reads);
        }
    } else {
        let source = if outcome.from_cache { " | cached" } else { "" };
        println!(
            "[{} total | {} matched | {seconds:.2}s{source}]",
            outcome.total_classes,
            outcome.matches.len()
        );
    }
}

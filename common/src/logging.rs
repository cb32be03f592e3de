//! Common logging initializer.
//!

use eyre::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialise the tracing stack.
///
/// The filter is taken from the environment (`RUST_LOG`), falling back to
/// the given default directive.  Optionally a rolling file layer is added,
/// used by long-running managers that should keep a log next to the work
/// tree.
///
#[tracing::instrument]
pub fn init_logging(name: &'static str, default_filter: &str, use_file: Option<String>) -> Result<()> {
    // Load filters from environment, fallback on the verbosity flag.
    //
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    // Log to file?
    //
    let file = use_file.map(|dir| {
        // Basic append-only rolling file for all traces.
        //
        let file_appender = tracing_appender::rolling::daily(dir, name);
        tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_appender)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file)
        .init();

    Ok(())
}

/// Map `-v` repetitions onto a default filter directive.
///
pub fn filter_from_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

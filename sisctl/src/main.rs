//! Main driver for the Sisyphus workflow manager.
//!
//! Usage:
//!
//! ```text
//! Command line driver for the Sisyphus workflow manager.
//
// Usage: sis [OPTIONS] <COMMAND>
//
// Commands:
//   manager  Run the manager loop over the configured workflows
//   worker   Run a single task instance (internal usage)
//   console  Print a verbose state listing and exit
//   cleanup  Archive finished jobs, sweep unused directories
//   version  List all package versions
//   help     Print this message or the help of the given subcommand(s)
//
// Options:
//   -c, --config <CONFIG>  settings file
//   -v, --verbose...       Verbose mode
//   -h, --help             Print help
//! ```
//!
//! The bare binary ships without compiled-in recipes; pipelines link
//! against the `sisctl` library, register their recipe and workflow
//! tables and reuse this entry point.

use clap::{crate_authors, crate_description, crate_version, Parser};
use eyre::Result;
use tracing::trace;

use sisyphus_common::{filter_from_verbosity, init_logging};

use sisctl::{handle_subcmd, Opts, WorkflowSet};

/// Binary name.
pub const NAME: &str = env!("CARGO_BIN_NAME");
/// Binary version.
pub const VERSION: &str = crate_version!();
/// Authors.
pub const AUTHORS: &str = crate_authors!();

fn main() -> Result<()> {
    let opts = Opts::parse();
    let cfn = opts.config.clone();

    // Initialise tracing.
    //
    init_logging(NAME, filter_from_verbosity(opts.verbose), None)?;

    // Settings are rooted at the invocation directory so workers may
    // change into their scratch dir later.
    //
    let cwd = std::env::current_dir()?;
    let settings = sisyphus_common::Settings::load(cfn)?.rooted_at(&cwd);

    banner()?;

    trace!("sis starting.");
    // No recipes are compiled into the bare driver.
    //
    let workflows = WorkflowSet::new();

    handle_subcmd(settings, &workflows, &|_session| {}, &opts.subcmd)
}

/// Display banner
///
fn banner() -> Result<()> {
    Ok(eprintln!(
        r##"
{}/{} by {}
{}
"##,
        NAME,
        VERSION,
        AUTHORS,
        crate_description!()
    ))
}

//! Library part of the `sis` driver.
//!
//! Recipe crates embed this: they register their recipes and workflow
//! functions and hand control to [`handle_subcmd`], so their binary
//! doubles as the manager and the worker for their own jobs.
//!

pub use cli::*;
pub use loader::*;

mod cli;
mod loader;

use std::sync::Arc;

use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::{info, trace};

use sisyphus_common::Settings;
use sisyphus_core::{Session, SisGraph, TaskState};
use sisyphus_engines::{
    cleanup_jobs, cleanup_keep_value, cleanup_unused, run_worker, EngineSelector, Manager,
    WorkerArgs,
};

/// Hook registering the compiled-in recipes with a session, so workers
/// can rebuild jobs from their `job.save` files.
pub type RecipeHook<'a> = &'a dyn Fn(&Arc<Session>);

#[tracing::instrument(skip_all)]
pub fn handle_subcmd(
    settings: Settings,
    workflows: &WorkflowSet,
    register_recipes: RecipeHook,
    subcmd: &SubCommand,
) -> eyre::Result<()> {
    let session = Session::new(settings);
    register_recipes(&session);

    match subcmd {
        // Load the workflows and drive the graph.
        //
        SubCommand::Manager(mopts) => {
            trace!("manager");

            let graph = Arc::new(SisGraph::new(session.clone()));
            load_configs(&mopts.configs, workflows, &session, &graph)?;
            let engine = Arc::new(EngineSelector::from_settings(session.settings())?);
            let mut manager = Manager::new(
                graph,
                engine,
                mopts.run,
                mopts.clear_errors_once || mopts.clear_interrupts_once,
                mopts.ignore_once,
                mopts.run,
                mopts.interactive,
            );
            manager.run()
        }

        // Run one task instance; not called by users directly.
        //
        SubCommand::Worker(wopts) => {
            trace!("worker");

            let engine = EngineSelector::from_settings(session.settings())?;
            let args = WorkerArgs {
                jobdir: wopts.jobdir.clone(),
                task_name: wopts.task_name.clone(),
                task_id: wopts.task_id,
                engine: Some(wopts.engine.clone()),
                redirect_output: wopts.redirect_output,
                force_resume: wopts.force_resume,
            };
            run_worker(&session, &engine, &args)
        }

        // Verbose state listing.
        //
        SubCommand::Console(copts) => {
            trace!("console");

            let graph = SisGraph::new(session.clone());
            load_configs(&copts.configs, workflows, &session, &graph)?;
            let str = status_listing(&graph)?;
            eprintln!("{}", str);
            Ok(())
        }

        // Archive finished jobs, apply keep values, sweep strays.
        //
        SubCommand::Cleanup(clopts) => {
            trace!("cleanup");

            let graph = SisGraph::new(session.clone());
            load_configs(&clopts.configs, workflows, &session, &graph)?;
            let settings = session.settings().clone();
            if let Some(keep) = clopts.keep_value {
                cleanup_keep_value(&graph, &settings, keep, clopts.mode, clopts.force)?;
            }
            if clopts.unused {
                cleanup_unused(&graph, &settings, clopts.mode, clopts.force)?;
            }
            if clopts.keep_value.is_none() && !clopts.unused {
                cleanup_jobs(&graph);
            }
            Ok(())
        }

        // Standalone `version` command.
        //
        SubCommand::Version => {
            eprintln!(
                "Modules: \t{} {} {}",
                sisyphus_common::version(),
                sisyphus_core::version(),
                sisyphus_engines::version(),
            );
            Ok(())
        }
    }
}

/// Render all reachable jobs in a table, one row per job.
///
pub fn status_listing(graph: &SisGraph) -> eyre::Result<String> {
    let states = graph.get_jobs_by_status(None, false);

    let mut builder = Builder::default();
    builder.push_record(["State", "Job", "Targets"]);
    for (state, jobs) in &states.jobs {
        for job in jobs {
            let targets: Vec<String> = job.needed_for_targets().into_iter().collect();
            builder.push_record([
                state.to_string(),
                job.id().to_string(),
                targets.join(", "),
            ]);
        }
    }
    for path in &states.input_missing {
        builder.push_record([
            TaskState::InputMissing.to_string(),
            path.clone(),
            String::new(),
        ]);
    }
    let table = builder.build().with(Style::modern()).to_string();
    info!("{}", states.overview().join(" "));
    Ok(format!("Current graph state:\n{table}"))
}

/// Return our version number
///
#[inline]
pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_listing_empty_graph() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(Settings::immediate().rooted_at(dir.path()));
        let graph = SisGraph::new(session);
        let listing = status_listing(&graph).unwrap();
        assert!(listing.contains("State"));
    }
}

//! Command-line entry point: thin wrapper wiring the CLI surface (spec.md
//! §6) onto the C1 -> C2 -> C3 -> C4 -> C6 pipeline. Parsing of the global
//! and application configuration into typed records, and the external
//! build/run toolchain itself, are treated as opaque collaborators —
//! everything here is plumbing.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ukharness::config::{AppConfig, GlobalConfig};
use ukharness::error::{ExitCode, UkError};
use ukharness::executor::{DEFAULT_BUILD_TIMEOUT, DEFAULT_GRACE, DEFAULT_RUN_TIMEOUT};
use ukharness::materializer::{write_common_sh, Materializer};
use ukharness::matrix::{self, AXIS_NETWORKING};
use ukharness::orchestrator::{bridge_name_for, SessionOrchestrator};
use ukharness::probe;
use ukharness::selection::SelectionFilter;
use ukharness::workspace;

/// Environment variables forwarded into every subprocess invocation.
/// Nothing else is inherited (spec.md §6).
const ENV_ALLOWLIST: &[&str] = &["KRAFTKIT_NO_CHECK_UPDATES", "DOCKER_HOST", "TERM"];

#[derive(Parser)]
#[command(
    name = "ukharness",
    about = "Configuration-matrix generator and executor for unikernel test suites",
    version
)]
struct Cli {
    /// Absolute path to the application directory under test.
    app_dir: PathBuf,

    /// Session label; also the name of the on-disk session directory.
    #[arg(short = 'n', long = "session-name", default_value = "session")]
    session_name: String,

    /// Selection filter over case indices (e.g. "1,3:5,7").
    #[arg(short = 't', long = "targets")]
    targets: Option<String>,

    /// Raise log verbosity to debug.
    #[arg(short, long)]
    verbose: bool,

    /// Stop after materialization (C4); do not execute.
    #[arg(long)]
    generate_only: bool,

    /// Root directory under which session directories are created.
    #[arg(long, default_value = "./tests")]
    tests_dir: PathBuf,

    /// Name of the staged application directory inside the session root.
    #[arg(long, default_value = "app")]
    app_dir_name: String,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// The global matrix config is expected at `<tests_dir>/matrix.yaml`; the
/// application manifest at `<app_dir>/uktest.yaml`. Neither path is part
/// of the CLI surface the spec names — this is the resolution of an open
/// question, recorded in DESIGN.md.
fn config_paths(cli: &Cli) -> (PathBuf, PathBuf) {
    (
        cli.tests_dir.join("matrix.yaml"),
        cli.app_dir.join("uktest.yaml"),
    )
}

async fn run(cli: Cli) -> Result<ExitCode, UkError> {
    let (global_path, app_path) = config_paths(&cli);
    let global = GlobalConfig::load(&global_path)?;
    let app = AppConfig::load(&app_path)?;

    let host = probe::probe(&global.tools)?;
    let cases = matrix::build_target_cases(&global, &host, &app)?;

    let workspace = workspace::create(
        &cli.tests_dir,
        &cli.session_name,
        &cli.app_dir,
        &cli.app_dir_name,
        &cases,
    )?;
    write_common_sh(&workspace.common_sh_path())?;

    let app_name = cli
        .app_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "app".to_string());

    let materializer = Materializer::new()?;
    for case in &cases {
        let case_dir = workspace.case_dir(case.index);
        let bridge = bridge_name_for(case.index);
        materializer.materialize(
            case,
            &case_dir,
            &workspace.app_staging,
            &app_name,
            &app,
            &host,
            &cli.session_name,
            &workspace.common_sh_path(),
            &bridge,
        )?;
    }

    if cli.generate_only {
        info!(count = cases.len(), "materialization complete (--generate-only)");
        return Ok(ExitCode::Success);
    }

    let filter = match &cli.targets {
        Some(raw) => SelectionFilter::parse(raw)?,
        None => SelectionFilter::all(),
    };

    let env_allowlist: Vec<(String, String)> = ENV_ALLOWLIST
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
        .collect();

    let orchestrator = SessionOrchestrator::new(
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        cli.session_name.clone(),
        DEFAULT_BUILD_TIMEOUT,
        DEFAULT_RUN_TIMEOUT,
        DEFAULT_GRACE,
        env_allowlist,
        (18100..18200).collect(),
    );

    let ws_for_dirs = workspace;
    let app_for_marker = app.clone();
    let summary = orchestrator
        .run(
            &cases,
            &filter,
            {
                let ws = ws_for_dirs.root.clone();
                move |index| ws.join(index.to_string())
            },
            move |_case| app_for_marker.runtime.success_marker.clone(),
            move |case| case.value(AXIS_NETWORKING).map(|n| n != "none").unwrap_or(false),
            app.runtime.ports.len(),
        )
        .await;

    std::fs::write(ws_for_dirs.summary_path(), summary.render())
        .map_err(|e| UkError::Layout(format!("writing summary: {e}")))?;

    if summary.all_passed() {
        Ok(ExitCode::Success)
    } else {
        Ok(ExitCode::CaseFailure)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "session aborted");
            e.exit_code()
        }
    };

    std::process::exit(i32::from(code));
}

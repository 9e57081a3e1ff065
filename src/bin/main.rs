use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use steprun::{EngineContext, RunOptions, demo};
use tracing::info;

#[derive(Parser)]
#[command(name = "steprun")]
#[command(about = "Step-wise asynchronous test runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command. They override `steprun.json`.
#[derive(clap::Args)]
struct RunArgs {
    /// Directory containing `<kind>/<app>/` test directories (repeatable)
    #[arg(long = "test-dir", env = "STEPRUN_TEST_DIR")]
    test_dirs: Vec<PathBuf>,
    /// Kind of tests to run
    #[arg(long)]
    kind: Option<String>,
    /// Application names or class tags to exclude (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Class tags to include (repeatable)
    #[arg(long = "include-tag")]
    include_tags: Vec<String>,
    /// 1 errors only, 2 info, 3 debug
    #[arg(short, long)]
    verbosity: Option<u8>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in suites
    Run {
        #[command(flatten)]
        args: RunArgs,
        /// Stop at the first failure or error
        #[arg(long, default_value_t = false)]
        failfast: bool,
        /// Run the test worker in a separate process instead of a thread
        #[arg(long, default_value_t = false)]
        process: bool,
    },
    /// List the test modules a run would load
    Discover {
        #[command(flatten)]
        args: RunArgs,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            args,
            failfast,
            process,
        } => {
            let mut options = build_options(args)?;
            options.failfast |= failfast;
            if process {
                options.use_thread_isolation = false;
            }
            let context = EngineContext::init(options.into_config()?, demo::registry(), demo::functions())?;
            info!("Running tests with {:?}", context.config());

            let report = context.run_tests(Map::<String, Value>::new()).await;
            context.teardown().await?;
            let report = report?;

            if !report.was_successful() {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Discover { args } => {
            let options = build_options(args)?;
            let context = EngineContext::init(options.into_config()?, demo::registry(), demo::functions())?;
            let modules = context.discover();

            println!("Found {} test modules:", modules.len());
            for found in &modules {
                println!("  {:<30} (app: {})", found.module, found.app);
            }
            context.teardown().await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Merge CLI flags over the config file, if there is one.
fn build_options(args: RunArgs) -> Result<RunOptions> {
    let mut options = RunOptions::load()?.unwrap_or_default();

    if !args.test_dirs.is_empty() {
        options.test_dirs = args.test_dirs;
    }
    if let Some(kind) = args.kind {
        options.kind = Some(kind);
    }
    options.tags.extend(args.tags);
    options.include_tags.extend(args.include_tags);
    if let Some(verbosity) = args.verbosity {
        options.verbosity = verbosity;
    }
    if options.test_dirs.is_empty() {
        options.test_dirs.push(PathBuf::from("demos"));
    }

    Ok(options)
}

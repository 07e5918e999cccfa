use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use repos::emit::{ContainerConfigEmitter, Emitter, WorkspaceFileEmitter};
use repos::forge::{ForgeClient, discover_credentials};
use repos::listfile::{Visibility, parse_list_file};
use repos::logging::Logger;
use repos::pipeline::{self, PipelineOptions};
use repos::planner::{self, Plan, WorkspaceContext};
use repos::reconciler::Reconciler;

#[derive(Debug, Parser)]
#[command(
    name = "repos",
    version,
    about = "Reconcile a workspace of related Git repositories against a declarative list"
)]
enum Cli {
    /// Clone and configure every repository listed in the plan file.
    ///
    /// Missing remote repositories and branches are created on the forge when
    /// credentials allow; local directories become clones or linked worktrees.
    #[command(name = "setup")]
    Setup(SetupArgs),
    /// Execute a script inside each reconciled repository directory.
    #[command(name = "run")]
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct SetupArgs {
    /// Plan file to reconcile.
    ///
    /// Defaults to `repos.list`, falling back to `repos-to-clone.list`.
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,
    /// Create missing forge repositories as public instead of private.
    #[arg(short = 'p', long = "public", action = ArgAction::SetTrue)]
    public: bool,
    /// Inject per-repository permission grants into container-config files.
    #[arg(long = "codespaces", action = ArgAction::SetTrue)]
    codespaces: bool,
    /// Container-config file(s) to update. Implies --codespaces.
    ///
    /// Pass multiple times to update several files.
    #[arg(short = 'd', long = "devcontainer")]
    devcontainer: Vec<PathBuf>,
    /// Permission token written into each injected repository grant.
    #[arg(long = "permissions", default_value = "write-all")]
    permissions: String,
    /// Accepted for compatibility; JSON rewriting happens in-process.
    #[arg(short = 't', long = "tool")]
    tool: Option<String>,
    /// Echo diagnostic output to stderr.
    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,
    /// Also append diagnostics to a file (default `repos-debug.log`).
    #[arg(long = "debug-file", num_args = 0..=1, default_missing_value = "repos-debug.log")]
    debug_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Plan file naming the directories to visit.
    ///
    /// Accepts the full plan grammar or the concise one-directory-per-line
    /// form with an optional per-entry script name.
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,
    /// Script file to execute inside each repository.
    #[arg(long = "script", default_value = "run.sh")]
    script: String,
    /// Only visit directories with these base names (comma separated).
    #[arg(short = 'i', long = "include", value_delimiter = ',')]
    include: Vec<String>,
    /// Skip directories with these base names (comma separated).
    #[arg(short = 'e', long = "exclude", value_delimiter = ',')]
    exclude: Vec<String>,
    /// Reconcile the workspace before running the pipeline.
    #[arg(long = "ensure-setup", action = ArgAction::SetTrue)]
    ensure_setup: bool,
    /// Export REPOS_SKIP_DEPS=1 so scripts can skip dependency installs.
    #[arg(long = "skip-deps", action = ArgAction::SetTrue)]
    skip_deps: bool,
    /// Print the planned invocations without executing anything.
    #[arg(short = 'n', long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Echo each command before it runs.
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    verbose: bool,
    /// Process every entry and fail at the end instead of stopping at the
    /// first failing script.
    #[arg(long = "continue-on-error", action = ArgAction::SetTrue)]
    continue_on_error: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("repos: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    match Cli::parse() {
        Cli::Setup(args) => run_setup(args),
        Cli::Run(args) => run_run(args),
    }
}

fn run_setup(args: SetupArgs) -> Result<i32> {
    let logger = build_logger(args.debug, args.debug_file.as_deref())?;
    let working_dir = env::current_dir().context("failed to resolve working directory")?;
    let ctx = WorkspaceContext::discover(&working_dir)?;

    let plan_path = resolve_plan_file(args.file.as_deref(), &ctx.working_dir)?;
    logger.debug(&format!("plan file: {}", plan_path.display()));
    let plan = load_plan(&plan_path, &ctx)?;

    if let Some(tool) = &args.tool {
        logger.debug(&format!("--tool {tool} accepted; JSON handled in-process"));
    }

    let forge = ForgeClient::new(discover_credentials());
    if forge.read_only_local() {
        logger.warn("no forge credentials found; remote creation is disabled for this run");
    }

    let invocation_visibility = args.public.then_some(Visibility::Public);
    let mut reconciler = Reconciler::new(&forge, &logger, invocation_visibility);
    let tally = reconciler.reconcile(&plan)?;

    WorkspaceFileEmitter {
        working_dir: ctx.working_dir.clone(),
    }
    .apply(&plan)?;

    let inject = args.codespaces || !args.devcontainer.is_empty() || plan.flags.enable_codespaces;
    if inject {
        let files = if args.devcontainer.is_empty() {
            vec![ctx.working_dir.join(".devcontainer/devcontainer.json")]
        } else {
            args.devcontainer
                .iter()
                .map(|path| resolve_against(&ctx.working_dir, path))
                .collect()
        };
        ContainerConfigEmitter {
            files,
            permissions: args.permissions.clone(),
        }
        .apply(&plan)?;
    }

    Ok(if tally.errors == 0 { 0 } else { 1 })
}

fn run_run(args: RunArgs) -> Result<i32> {
    let logger = Logger::new(false);
    let working_dir = env::current_dir().context("failed to resolve working directory")?;
    let ctx = WorkspaceContext::discover(&working_dir)?;
    let plan_path = resolve_plan_file(args.file.as_deref(), &ctx.working_dir)?;

    if args.ensure_setup {
        let plan = load_plan(&plan_path, &ctx)?;
        let forge = ForgeClient::new(discover_credentials());
        let mut reconciler = Reconciler::new(&forge, &logger, None);
        let tally = reconciler.reconcile(&plan)?;
        if tally.errors > 0 {
            bail!("setup reported {} failed repositories", tally.errors);
        }
    }

    let targets = pipeline::load_targets(&plan_path, &ctx)?;
    let options = PipelineOptions {
        script: args.script,
        include: args.include,
        exclude: args.exclude,
        dry_run: args.dry_run,
        verbose: args.verbose,
        continue_on_error: args.continue_on_error,
        skip_deps: args.skip_deps,
    };
    let summary = pipeline::run_pipeline(&targets, &options, &logger)?;
    Ok(summary.exit_code(options.continue_on_error))
}

fn build_logger(debug: bool, debug_file: Option<&Path>) -> Result<Logger> {
    match debug_file {
        Some(path) => Logger::with_debug_file(path),
        None => Ok(Logger::new(debug)),
    }
}

fn load_plan(plan_path: &Path, ctx: &WorkspaceContext) -> Result<Plan> {
    let text = std::fs::read_to_string(plan_path)
        .with_context(|| format!("failed to read {}", plan_path.display()))?;
    let list = parse_list_file(&text)?;
    planner::plan(&list, ctx)
}

const DEFAULT_PLAN_FILES: [&str; 2] = ["repos.list", "repos-to-clone.list"];

fn resolve_plan_file(explicit: Option<&Path>, working_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let resolved = resolve_against(working_dir, path);
        if !resolved.is_file() {
            bail!("plan file does not exist: {}", resolved.display());
        }
        return Ok(resolved);
    }

    for candidate in DEFAULT_PLAN_FILES {
        let resolved = working_dir.join(candidate);
        if resolved.is_file() {
            return Ok(resolved);
        }
    }
    bail!(
        "no plan file found in {} (looked for {})",
        working_dir.display(),
        DEFAULT_PLAN_FILES.join(", ")
    );
}

fn resolve_against(base: &Path, candidate: &Path) -> PathBuf {
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

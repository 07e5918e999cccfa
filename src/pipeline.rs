use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::logging::Logger;
use crate::planner::Plan;

/// One directory the pipeline will visit, with an optional per-entry script
/// override from the concise plan format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTarget {
    pub dir: PathBuf,
    pub script: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub script: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub dry_run: bool,
    pub verbose: bool,
    pub continue_on_error: bool,
    pub skip_deps: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Success,
    Failed(i32),
    NoScript,
    Missing,
    Filtered,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryResult {
    pub dir: PathBuf,
    pub script: String,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub results: Vec<EntryResult>,
}

impl PipelineSummary {
    pub fn succeeded(&self) -> usize {
        self.count(|status| matches!(status, EntryStatus::Success))
    }

    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, EntryStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.results.len() - self.succeeded() - self.failed()
    }

    pub fn exit_code(&self, continue_on_error: bool) -> i32 {
        let first_failure = self.results.iter().find_map(|entry| match entry.status {
            EntryStatus::Failed(code) => Some(code),
            _ => None,
        });
        match first_failure {
            None => 0,
            Some(_) if continue_on_error => 1,
            Some(code) => code,
        }
    }

    fn count(&self, matches: impl Fn(&EntryStatus) -> bool) -> usize {
        self.results
            .iter()
            .filter(|entry| matches(&entry.status))
            .count()
    }
}

pub fn targets_from_plan(plan: &Plan) -> Vec<PipelineTarget> {
    plan.targets()
        .into_iter()
        .map(|dir| PipelineTarget { dir, script: None })
        .collect()
}

/// The concise plan format: one directory name per line, optionally followed
/// by a script name. Comments and blank lines are skipped.
pub fn parse_concise(text: &str, parent_dir: &Path) -> Vec<PipelineTarget> {
    let mut targets = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut tokens = trimmed.split_whitespace();
        let Some(dir) = tokens.next() else {
            continue;
        };
        targets.push(PipelineTarget {
            dir: parent_dir.join(dir),
            script: tokens.next().map(ToOwned::to_owned),
        });
    }
    targets
}

/// A file qualifies as concise when every entry line's first token is a plain
/// directory name; anything with a remote shape is a full plan file.
pub fn is_concise_format(text: &str) -> bool {
    let mut saw_entry = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        saw_entry = true;
        let first = trimmed.split_whitespace().next().unwrap_or("");
        if first.contains('/') || first.contains(':') || first.contains('@') {
            return false;
        }
    }
    saw_entry
}

/// Visit each target in order, dispatch its script, and collect per-entry
/// results. The first failure stops the walk unless `continue_on_error`.
pub fn run_pipeline(
    targets: &[PipelineTarget],
    options: &PipelineOptions,
    logger: &Logger,
) -> Result<PipelineSummary> {
    let mut summary = PipelineSummary::default();

    for target in targets {
        let script = target.script.clone().unwrap_or_else(|| options.script.clone());
        let basename = target
            .dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let status = if filtered_out(&basename, options) {
            EntryStatus::Filtered
        } else if !target.dir.is_dir() {
            EntryStatus::Missing
        } else if !target.dir.join(&script).is_file() {
            EntryStatus::NoScript
        } else if options.dry_run {
            logger.info(&format!(
                "would run {}/{script}",
                target.dir.display()
            ));
            EntryStatus::DryRun
        } else {
            execute_script(&target.dir, &script, options, logger)?
        };

        let failed = matches!(status, EntryStatus::Failed(_));
        summary.results.push(EntryResult {
            dir: target.dir.clone(),
            script,
            status,
        });
        if failed && !options.continue_on_error {
            break;
        }
    }

    print_summary(&summary, logger);
    Ok(summary)
}

fn filtered_out(basename: &str, options: &PipelineOptions) -> bool {
    if !options.include.is_empty() && !options.include.iter().any(|name| name == basename) {
        return true;
    }
    options.exclude.iter().any(|name| name == basename)
}

fn execute_script(
    dir: &Path,
    script: &str,
    options: &PipelineOptions,
    logger: &Logger,
) -> Result<EntryStatus> {
    let script_path = dir.join(script);
    make_executable(&script_path);

    if options.verbose {
        logger.info(&format!("+ {}", script_path.display()));
    }

    let mut command = Command::new(&script_path);
    command.current_dir(dir);
    if options.skip_deps {
        command.env("REPOS_SKIP_DEPS", "1");
    }

    let status = match command.status() {
        Ok(status) => status,
        Err(err) => {
            logger.warn(&format!(
                "could not execute {}: {err}",
                script_path.display()
            ));
            return Ok(EntryStatus::Failed(126));
        }
    };

    if status.success() {
        Ok(EntryStatus::Success)
    } else {
        Ok(EntryStatus::Failed(status.code().unwrap_or(1)))
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o755);
        let _ = std::fs::set_permissions(path, permissions);
    }
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

fn print_summary(summary: &PipelineSummary, logger: &Logger) {
    logger.info("=== Pipeline Summary ===");
    for entry in &summary.results {
        let dir = entry.dir.display();
        match &entry.status {
            EntryStatus::Success => {
                logger.info(&format!("✅ {dir}/{} — success", entry.script));
            }
            EntryStatus::Failed(code) => {
                logger.info(&format!(
                    "❌ {dir}/{} — failed (exit code {code})",
                    entry.script
                ));
            }
            EntryStatus::NoScript => {
                logger.info(&format!("⏭ {dir} — no {} found", entry.script));
            }
            EntryStatus::Missing => {
                logger.info(&format!("⏭ {dir} — directory missing"));
            }
            EntryStatus::Filtered => {
                logger.info(&format!("⏭ {dir} — filtered"));
            }
            EntryStatus::DryRun => {
                logger.info(&format!("⏭ {dir}/{} — dry run", entry.script));
            }
        }
    }
    logger.info(&format!(
        "Total: {} repositories | {} succeeded | {} failed | {} skipped",
        summary.results.len(),
        summary.succeeded(),
        summary.failed(),
        summary.skipped()
    ));
}

/// Read targets for the `run` subcommand from either format.
pub fn load_targets(
    path: &Path,
    ctx: &crate::planner::WorkspaceContext,
) -> Result<Vec<PipelineTarget>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if is_concise_format(&text) {
        return Ok(parse_concise(&text, &ctx.parent_dir));
    }
    let list = crate::listfile::parse_list_file(&text)?;
    let plan = crate::planner::plan(&list, ctx)?;
    Ok(targets_from_plan(&plan))
}

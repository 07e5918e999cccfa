use std::fmt::{Display, Formatter};
use std::path::Path;
use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitErrorKind {
    AuthRequired,
    NotEmpty,
    StaleWorktree,
    RemoteUnreachable,
    RefNotFound,
    Other,
}

/// A failed git operation with the classified cause. The reconciler branches
/// on `kind`; `message` carries the trimmed stderr for reporting.
#[derive(Debug)]
pub struct GitError {
    pub kind: GitErrorKind,
    pub message: String,
}

impl GitError {
    fn from_output(output: &Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Self {
            kind: classify_stderr(&stderr),
            message: stderr,
        }
    }

    fn invocation(err: std::io::Error) -> Self {
        Self {
            kind: GitErrorKind::Other,
            message: format!("failed to execute git: {err}"),
        }
    }
}

impl Display for GitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GitError {}

pub fn classify_stderr(stderr: &str) -> GitErrorKind {
    if stderr.contains("could not read Username")
        || stderr.contains("Authentication failed")
        || stderr.contains("terminal prompts disabled")
    {
        return GitErrorKind::AuthRequired;
    }
    if stderr.contains("already exists and is not an empty directory") {
        return GitErrorKind::NotEmpty;
    }
    if stderr.contains("missing but already registered") || stderr.contains("missing but locked") {
        return GitErrorKind::StaleWorktree;
    }
    if (stderr.contains("Remote branch") && stderr.contains("not found"))
        || stderr.contains("couldn't find remote ref")
        || stderr.contains("is not a commit and a branch")
        || stderr.contains("invalid reference:")
    {
        return GitErrorKind::RefNotFound;
    }
    if stderr.contains("Could not resolve host")
        || stderr.contains("unable to access")
        || stderr.contains("Connection refused")
        || stderr.contains("does not appear to be a git repository")
    {
        return GitErrorKind::RemoteUnreachable;
    }
    GitErrorKind::Other
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch_ref: Option<String>,
}

pub fn clone_full(url: &str, target: &Path, fetch_all_refs: bool) -> Result<(), GitError> {
    let target_str = target.to_string_lossy();
    let mut args = vec!["clone"];
    if fetch_all_refs {
        args.push("--no-single-branch");
    }
    args.push(url);
    args.push(&target_str);
    expect_success(run_git(None, &args)?)
}

pub fn clone_single_branch(
    url: &str,
    branch: &str,
    target: &Path,
    fetch_all_refs: bool,
) -> Result<(), GitError> {
    let target_str = target.to_string_lossy();
    let mut args = vec!["clone", "--branch", branch];
    if !fetch_all_refs {
        args.push("--single-branch");
    }
    args.push(url);
    args.push(&target_str);
    expect_success(run_git(None, &args)?)
}

/// A single-branch clone leaves `remote.origin.fetch` pinned to one ref,
/// which breaks later worktree adds for other branches. Widening is
/// best-effort; callers only log a failure.
pub fn widen_fetch_refspec(repo: &Path) -> Result<()> {
    let output = run_git(Some(repo), &["config", "--get", "remote.origin.fetch"])
        .map_err(anyhow::Error::from)?;
    let refspec = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || refspec.contains("refs/heads/*") {
        return Ok(());
    }
    let output = run_git(
        Some(repo),
        &[
            "config",
            "--add",
            "remote.origin.fetch",
            "+refs/heads/*:refs/remotes/origin/*",
        ],
    )
    .map_err(anyhow::Error::from)?;
    if !output.status.success() {
        anyhow::bail!(
            "failed to widen fetch refspec in {}: {}",
            repo.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Add a worktree of `branch` at `target`. The base is always pruned first to
/// purge stale registrations; a stale failure triggers one more
/// prune-and-retry before propagating.
pub fn worktree_add(base: &Path, branch: &str, target: &Path) -> Result<(), GitError> {
    worktree_prune(base)?;

    if !branch_exists_local(base, branch)? {
        // The branch may only exist on the remote, possibly created moments
        // ago by the forge client.
        let _ = fetch_origin(base);
    }

    match try_worktree_add(base, branch, target) {
        Err(err) if err.kind == GitErrorKind::StaleWorktree => {
            worktree_prune(base)?;
            try_worktree_add(base, branch, target)
        }
        other => other,
    }
}

fn try_worktree_add(base: &Path, branch: &str, target: &Path) -> Result<(), GitError> {
    let target_str = target.to_string_lossy();
    if branch_exists_local(base, branch)? {
        return expect_success(run_git(
            Some(base),
            &["worktree", "add", &target_str, branch],
        )?);
    }
    let tracking = format!("origin/{branch}");
    expect_success(run_git(
        Some(base),
        &[
            "worktree", "add", "--track", "-b", branch, &target_str, &tracking,
        ],
    )?)
}

pub fn worktree_list(base: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
    let output = run_git(Some(base), &["worktree", "list", "--porcelain"])?;
    if !output.status.success() {
        return Err(GitError::from_output(&output));
    }
    Ok(parse_worktree_list(&String::from_utf8_lossy(
        &output.stdout,
    )))
}

pub fn worktree_prune(base: &Path) -> Result<(), GitError> {
    expect_success(run_git(Some(base), &["worktree", "prune"])?)
}

pub fn fetch_origin(repo: &Path) -> Result<(), GitError> {
    expect_success(run_git(Some(repo), &["fetch", "origin", "--prune"])?)
}

pub fn branch_exists_local(repo: &Path, branch: &str) -> Result<bool, GitError> {
    let output = run_git(
        Some(repo),
        &[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ],
    )?;
    Ok(output.status.success())
}

/// Probe a remote for a branch without a local clone. Used when the forge
/// client is degraded to read-only-local mode.
pub fn branch_exists_on_remote(url: &str, branch: &str) -> Result<bool, GitError> {
    let refspec = format!("refs/heads/{branch}");
    let output = run_git(None, &["ls-remote", "--heads", url, &refspec])?;
    if !output.status.success() {
        return Err(GitError::from_output(&output));
    }
    Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
}

pub fn is_repo(dir: &Path) -> bool {
    run_git(Some(dir), &["rev-parse", "--is-inside-work-tree"])
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn remote_origin_url(repo: &Path) -> Result<Option<String>> {
    let output = run_git(Some(repo), &["config", "--get", "remote.origin.url"])
        .map_err(anyhow::Error::from)
        .with_context(|| format!("failed to query origin of {}", repo.display()))?;
    if !output.status.success() {
        return Ok(None);
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!url.is_empty()).then_some(url))
}

pub fn default_branch(repo: &Path) -> Result<String, GitError> {
    let output = run_git(
        Some(repo),
        &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
    )?;
    if output.status.success() {
        let full = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if let Some(branch) = full.strip_prefix("origin/") {
            return Ok(branch.to_string());
        }
    }

    let output = run_git(Some(repo), &["branch", "--show-current"])?;
    if !output.status.success() {
        return Err(GitError::from_output(&output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .map_err(GitError::invocation)
}

fn expect_success(output: Output) -> Result<(), GitError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(GitError::from_output(&output))
    }
}

fn parse_worktree_list(raw: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch_ref: Option<String> = None;

    let flush = |entries: &mut Vec<WorktreeEntry>,
                 current_path: &mut Option<PathBuf>,
                 current_branch_ref: &mut Option<String>| {
        if let Some(path) = current_path.take() {
            entries.push(WorktreeEntry {
                path,
                branch_ref: current_branch_ref.take(),
            });
        } else {
            current_branch_ref.take();
        }
    };

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush(&mut entries, &mut current_path, &mut current_branch_ref);
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            flush(&mut entries, &mut current_path, &mut current_branch_ref);
            current_path = Some(PathBuf::from(path));
            continue;
        }

        if let Some(branch_ref) = line.strip_prefix("branch ") {
            current_branch_ref = Some(branch_ref.to_string());
        }
    }

    flush(&mut entries, &mut current_path, &mut current_branch_ref);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_porcelain_output() {
        let raw = r#"worktree /repo/main
HEAD 1111111
branch refs/heads/main

worktree /repo/wt/feature-x
HEAD 2222222
branch refs/heads/feature/x
"#;

        let parsed = parse_worktree_list(raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].path, PathBuf::from("/repo/main"));
        assert_eq!(parsed[0].branch_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(parsed[1].path, PathBuf::from("/repo/wt/feature-x"));
        assert_eq!(
            parsed[1].branch_ref.as_deref(),
            Some("refs/heads/feature/x")
        );
    }

    #[test]
    fn parses_detached_worktree_without_branch_line() {
        let raw = r#"worktree /repo/main
HEAD 1111111
detached
"#;
        let parsed = parse_worktree_list(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].path, PathBuf::from("/repo/main"));
        assert_eq!(parsed[0].branch_ref, None);
    }

    #[test]
    fn classifies_auth_failures() {
        assert_eq!(
            classify_stderr("fatal: could not read Username for 'https://github.com'"),
            GitErrorKind::AuthRequired
        );
    }

    #[test]
    fn classifies_non_empty_target() {
        assert_eq!(
            classify_stderr(
                "fatal: destination path 'x' already exists and is not an empty directory."
            ),
            GitErrorKind::NotEmpty
        );
    }

    #[test]
    fn classifies_stale_worktree() {
        assert_eq!(
            classify_stderr("fatal: '/p/w-dev' is a missing but already registered worktree;"),
            GitErrorKind::StaleWorktree
        );
    }

    #[test]
    fn classifies_missing_ref() {
        assert_eq!(
            classify_stderr("fatal: Remote branch topic not found in upstream origin"),
            GitErrorKind::RefNotFound
        );
        assert_eq!(
            classify_stderr("fatal: invalid reference: topic"),
            GitErrorKind::RefNotFound
        );
    }

    #[test]
    fn classifies_unreachable_remote() {
        assert_eq!(
            classify_stderr(
                "fatal: unable to access 'https://github.com/a/b/': Could not resolve host: github.com"
            ),
            GitErrorKind::RemoteUnreachable
        );
    }

    #[test]
    fn unknown_stderr_is_other() {
        assert_eq!(classify_stderr("something else"), GitErrorKind::Other);
    }

    #[test]
    fn clone_reports_origin_and_default_branch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        std::fs::create_dir_all(&origin).expect("create origin");
        for args in [
            vec!["init", "-b", "main"],
            vec!["commit", "--allow-empty", "-m", "seed"],
        ] {
            let output = Command::new("git")
                .current_dir(&origin)
                .args(["-c", "user.email=test@example.com", "-c", "user.name=test"])
                .args(&args)
                .output()
                .expect("git should run");
            assert!(
                output.status.success(),
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let clone = temp.path().join("clone");
        clone_full(&origin.display().to_string(), &clone, false).expect("clone");

        assert!(is_repo(&clone));
        assert_eq!(default_branch(&clone).expect("default branch"), "main");
        let url = remote_origin_url(&clone).expect("origin query").expect("origin set");
        assert!(url.ends_with("origin"));
    }
}

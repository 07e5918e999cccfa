use std::path::Path;

use anyhow::{Result, bail};

use crate::forge::{BranchProbe, ForgeClient, OwnerKind, RepoProbe, TokenCheck};
use crate::git::{self, GitErrorKind};
use crate::listfile::{Remote, Visibility};
use crate::logging::Logger;
use crate::planner::{ActionKind, Plan, ResolvedAction};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub created: usize,
    pub already_existed: usize,
    pub errors: usize,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.created + self.already_existed + self.errors
    }
}

/// Executes a plan in order: per-entry forge steps, then the git operation,
/// accumulating a created/existing/error tally. Failed actions never abort
/// the run; an invalid token does, because it would fail identically for
/// every remaining action.
pub struct Reconciler<'a> {
    forge: &'a ForgeClient,
    logger: &'a Logger,
    invocation_visibility: Option<Visibility>,
    token_checked: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        forge: &'a ForgeClient,
        logger: &'a Logger,
        invocation_visibility: Option<Visibility>,
    ) -> Self {
        Self {
            forge,
            logger,
            invocation_visibility,
            token_checked: false,
        }
    }

    pub fn reconcile(&mut self, plan: &Plan) -> Result<Tally> {
        let mut tally = Tally::default();

        for error in &plan.line_errors {
            self.logger
                .error(&format!("line {}: {}: {}", error.line, error.message, error.raw));
            tally.errors += 1;
        }

        for action in &plan.actions {
            match self.apply(plan, action) {
                Ok(Outcome::Created) => {
                    tally.created += 1;
                    self.logger.info(&format!("✅ {} — ready", action.target.display()));
                }
                Ok(Outcome::AlreadyExisted) => {
                    tally.already_existed += 1;
                    self.logger
                        .info(&format!("• {} — already present", action.target.display()));
                }
                Err(err) => {
                    tally.errors += 1;
                    self.logger
                        .error(&format!("❌ {} — {err:#}", action.target.display()));
                }
            }
        }

        self.logger.info(&format!(
            "Total: {} repositories | {} created | {} existing | {} failed",
            tally.total(),
            tally.created,
            tally.already_existed,
            tally.errors
        ));
        Ok(tally)
    }

    fn apply(&mut self, plan: &Plan, action: &ResolvedAction) -> Result<Outcome> {
        match &action.kind {
            ActionKind::FullClone {
                remote,
                fetch_all_refs,
            } => {
                self.ensure_remote_repo(plan, action, remote, None)?;
                self.materialize_clone(remote, &action.target, None, *fetch_all_refs)
            }
            ActionKind::SingleBranchClone { remote, branch } => {
                self.ensure_remote_repo(plan, action, remote, Some(branch))?;
                self.ensure_remote_branch(remote, branch);
                self.materialize_clone(remote, &action.target, Some(branch), false)
            }
            ActionKind::WorktreeAdd {
                base,
                branch,
                clone_fallback,
            } => {
                if let Ok(Some(url)) = git::remote_origin_url(base) {
                    if let Some(origin) = Remote::from_origin_url(&url) {
                        self.ensure_remote_branch(&origin, branch);
                    }
                }
                self.materialize_worktree(base, branch, &action.target, clone_fallback.as_ref())
            }
        }
    }

    /// Probe the forge for an owner/repo remote and create it when missing.
    /// Non-forge remotes and read-only-local mode proceed straight to git.
    fn ensure_remote_repo(
        &mut self,
        plan: &Plan,
        action: &ResolvedAction,
        remote: &Remote,
        branch: Option<&str>,
    ) -> Result<()> {
        let Some((owner, repo)) = remote.owner_repo() else {
            return Ok(());
        };

        match self.forge.repo_exists(owner, repo) {
            RepoProbe::Exists => Ok(()),
            RepoProbe::NetworkError => {
                self.logger.warn(&format!(
                    "forge unreachable; assuming {owner}/{repo} exists"
                ));
                Ok(())
            }
            RepoProbe::Error(code, message) => {
                self.logger.warn(&format!(
                    "forge probe for {owner}/{repo} failed (status {code}): {message}"
                ));
                Ok(())
            }
            RepoProbe::NotFound => {
                self.check_token_once()?;
                if self.forge.read_only_local() {
                    self.logger
                        .warn(&format!("cannot create {owner}/{repo} without credentials"));
                    bail!("repository {owner}/{repo} does not exist on the forge");
                }
                let kind = match self.forge.classify_owner(owner) {
                    // GH_USER pins the authenticated login; an owner matching
                    // it is the user even when classification is unavailable.
                    OwnerKind::Unknown
                        if self.forge.authenticated_login().as_deref() == Some(owner) =>
                    {
                        OwnerKind::User
                    }
                    kind => kind,
                };
                if kind == OwnerKind::Unknown {
                    bail!("owner type of {owner} is unknown; not creating {owner}/{repo}");
                }
                let visibility = self.effective_visibility(plan, action);
                // A ref on the entry needs an initial commit to branch from.
                let auto_init = branch.is_some();
                self.forge
                    .create_repo(owner, repo, kind, visibility, auto_init)?;
                self.logger
                    .info(&format!("created {owner}/{repo} ({visibility})"));
                Ok(())
            }
        }
    }

    /// Branch creation failures are reported but never fatal; the git step
    /// surfaces the definitive error if the ref stays missing.
    fn ensure_remote_branch(&mut self, remote: &Remote, branch: &str) {
        let Some((owner, repo)) = remote.owner_repo() else {
            return;
        };
        match self.forge.branch_exists(owner, repo, branch) {
            BranchProbe::Exists => {}
            BranchProbe::NotFound => {
                if let Err(err) = self.forge.create_branch(owner, repo, branch) {
                    self.logger
                        .warn(&format!("could not create branch {branch} on {owner}/{repo}: {err:#}"));
                } else {
                    self.logger
                        .info(&format!("created branch {branch} on {owner}/{repo}"));
                }
            }
            BranchProbe::Error(message) => {
                self.logger
                    .warn(&format!("branch probe for {owner}/{repo}@{branch} failed: {message}"));
            }
            BranchProbe::NetworkError => {
                match git::branch_exists_on_remote(&remote.clone_url(), branch) {
                    Ok(true) => {}
                    Ok(false) => self.logger.warn(&format!(
                        "branch {branch} missing on {owner}/{repo} and no credentials to create it"
                    )),
                    Err(err) => self.logger.debug(&format!(
                        "ls-remote probe for {owner}/{repo}@{branch} failed: {err}"
                    )),
                }
            }
        }
    }

    fn materialize_clone(
        &mut self,
        remote: &Remote,
        target: &Path,
        branch: Option<&str>,
        fetch_all_refs: bool,
    ) -> Result<Outcome> {
        match existing_state(target) {
            TargetState::Missing | TargetState::EmptyDir => {}
            TargetState::Repo => {
                let actual = git::remote_origin_url(target)?;
                let matches = actual
                    .as_deref()
                    .and_then(Remote::from_origin_url)
                    .map(|origin| origin.canonical_key() == remote.canonical_key())
                    .unwrap_or(false);
                if matches {
                    return Ok(Outcome::AlreadyExisted);
                }
                bail!(
                    "target exists with unexpected origin {}",
                    actual.unwrap_or_else(|| "(none)".to_string())
                );
            }
            TargetState::NonEmpty => {
                bail!("target directory is non-empty and not a repository");
            }
        }

        let url = remote.clone_url();
        let result = match branch {
            Some(branch) => git::clone_single_branch(&url, branch, target, fetch_all_refs),
            None => git::clone_full(&url, target, fetch_all_refs),
        };
        result.map_err(|err| anyhow::anyhow!("git clone failed ({:?}): {err}", err.kind))?;

        if branch.is_some() && !fetch_all_refs {
            if let Err(err) = git::widen_fetch_refspec(target) {
                self.logger.debug(&format!("{err:#}"));
            }
        }
        Ok(Outcome::Created)
    }

    fn materialize_worktree(
        &mut self,
        base: &Path,
        branch: &str,
        target: &Path,
        clone_fallback: Option<&Remote>,
    ) -> Result<Outcome> {
        if !base.is_dir() || !git::is_repo(base) {
            bail!("worktree base {} is not a repository", base.display());
        }

        match existing_state(target) {
            TargetState::Missing => {}
            TargetState::EmptyDir => {
                // git refuses to add a worktree over an existing directory.
                bail!("target directory already exists but is not a worktree");
            }
            TargetState::Repo | TargetState::NonEmpty => {
                if is_live_worktree(base, branch, target) {
                    return Ok(Outcome::AlreadyExisted);
                }
                bail!("target directory is non-empty and not a worktree of {}", base.display());
            }
        }

        match git::worktree_add(base, branch, target) {
            Ok(()) => Ok(Outcome::Created),
            Err(err) if err.kind == GitErrorKind::RefNotFound => {
                if let Some(remote) = clone_fallback {
                    self.logger.warn(&format!(
                        "branch {branch} not reachable from {}; falling back to a single-branch clone",
                        base.display()
                    ));
                    return self.materialize_clone(remote, target, Some(branch), false);
                }
                bail!("branch {branch} not found ({err})");
            }
            Err(err) => bail!("git worktree add failed ({:?}): {err}", err.kind),
        }
    }

    fn effective_visibility(&self, plan: &Plan, action: &ResolvedAction) -> Visibility {
        action
            .visibility
            .or(plan.flags.default_visibility)
            .or(self.invocation_visibility)
            .unwrap_or(Visibility::Private)
    }

    /// Validate credentials before the first creation attempt. Hard-invalid
    /// aborts the run; a network failure only degrades the client.
    fn check_token_once(&mut self) -> Result<()> {
        if self.token_checked {
            return Ok(());
        }
        self.token_checked = true;
        match self.forge.validate_token() {
            TokenCheck::Valid => Ok(()),
            TokenCheck::Invalid(reason) => bail!("forge token is invalid: {reason}"),
            TokenCheck::NetworkError => {
                self.logger
                    .warn("could not validate forge token; continuing in read-only-local mode");
                Ok(())
            }
        }
    }
}

enum Outcome {
    Created,
    AlreadyExisted,
}

enum TargetState {
    Missing,
    EmptyDir,
    Repo,
    NonEmpty,
}

fn existing_state(target: &Path) -> TargetState {
    if !target.exists() {
        return TargetState::Missing;
    }
    if target.join(".git").exists() {
        return TargetState::Repo;
    }
    let occupied = std::fs::read_dir(target)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(true);
    if occupied {
        TargetState::NonEmpty
    } else {
        TargetState::EmptyDir
    }
}

fn is_live_worktree(base: &Path, branch: &str, target: &Path) -> bool {
    let expected_ref = format!("refs/heads/{branch}");
    let Ok(entries) = git::worktree_list(base) else {
        return false;
    };
    let canonical_target = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
    entries.iter().any(|entry| {
        let entry_path = entry
            .path
            .canonicalize()
            .unwrap_or_else(|_| entry.path.clone());
        entry_path == canonical_target && entry.branch_ref.as_deref() == Some(expected_ref.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::process::Command;

    use tempfile::tempdir;

    use crate::listfile::parse_list_file;
    use crate::planner::{self, WorkspaceContext};

    fn run_git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .expect("git should run");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// An origin repository with an initial commit on `main` plus any extra
    /// branches, usable as an absolute-path remote.
    fn seed_origin(root: &Path, name: &str, branches: &[&str]) -> PathBuf {
        let origin = root.join(name);
        fs::create_dir_all(&origin).expect("create origin dir");
        run_git(&origin, &["init", "-b", "main"]);
        fs::write(origin.join("README.md"), "seed\n").expect("write seed file");
        run_git(&origin, &["add", "."]);
        run_git(
            &origin,
            &[
                "-c",
                "user.email=test@example.com",
                "-c",
                "user.name=test",
                "commit",
                "-m",
                "seed",
            ],
        );
        for branch in branches {
            run_git(&origin, &["branch", branch]);
        }
        origin
    }

    fn workspace(root: &Path) -> WorkspaceContext {
        let working_dir = root.join("parent").join("w");
        fs::create_dir_all(&working_dir).expect("create working dir");
        WorkspaceContext::new(working_dir, None).expect("context")
    }

    fn reconcile_list(text: &str, ctx: &WorkspaceContext) -> Tally {
        let list = parse_list_file(text).expect("parse");
        let plan = planner::plan(&list, ctx).expect("plan");
        let forge = ForgeClient::new(None);
        let logger = Logger::new(false);
        Reconciler::new(&forge, &logger, None)
            .reconcile(&plan)
            .expect("reconcile")
    }

    #[test]
    fn clones_and_adds_worktree() {
        let temp = tempdir().expect("tempdir");
        let origin = seed_origin(temp.path(), "origins/alpha", &["dev"]);
        let ctx = workspace(temp.path());

        let tally = reconcile_list(&format!("{}\n@dev\n", origin.display()), &ctx);
        assert_eq!(tally.errors, 0);
        assert_eq!(tally.created, 2);

        let clone = ctx.parent_dir.join("alpha");
        assert!(clone.join(".git").is_dir());
        let worktree = ctx.parent_dir.join("w-dev");
        assert!(worktree.join(".git").is_file());
    }

    #[test]
    fn second_run_is_a_no_op() {
        let temp = tempdir().expect("tempdir");
        let origin = seed_origin(temp.path(), "origins/alpha", &["dev"]);
        let ctx = workspace(temp.path());
        let text = format!("{}\n@dev\n", origin.display());

        let first = reconcile_list(&text, &ctx);
        assert_eq!(first.errors, 0);

        let second = reconcile_list(&text, &ctx);
        assert_eq!(second.errors, 0);
        assert_eq!(second.created, 0);
        assert_eq!(second.already_existed, 2);
    }

    #[test]
    fn single_branch_clone_checks_out_named_branch() {
        let temp = tempdir().expect("tempdir");
        let origin = seed_origin(temp.path(), "origins/gamma", &["release"]);
        let ctx = workspace(temp.path());

        let tally = reconcile_list(&format!("{}@release\n", origin.display()), &ctx);
        assert_eq!(tally.errors, 0);

        let clone = ctx.parent_dir.join("gamma");
        assert!(clone.join(".git").is_dir());
        let output = Command::new("git")
            .current_dir(&clone)
            .args(["branch", "--show-current"])
            .output()
            .expect("git should run");
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            "release"
        );
        assert!(!ctx.parent_dir.join("gamma-release").exists());
    }

    #[test]
    fn recovers_from_stale_worktree_registration() {
        let temp = tempdir().expect("tempdir");
        let origin = seed_origin(temp.path(), "origins/epsilon", &["topic"]);
        let ctx = workspace(temp.path());
        let text = format!("{}\n@topic\n", origin.display());

        let first = reconcile_list(&text, &ctx);
        assert_eq!(first.errors, 0);

        let worktree = ctx.parent_dir.join("w-topic");
        fs::remove_dir_all(&worktree).expect("remove worktree dir");

        let second = reconcile_list(&text, &ctx);
        assert_eq!(second.errors, 0);
        assert!(worktree.join(".git").is_file());
    }

    #[test]
    fn slashed_branch_sanitizes_directory_only() {
        let temp = tempdir().expect("tempdir");
        let origin = seed_origin(temp.path(), "origins/epsilon", &["feature/x"]);
        let ctx = workspace(temp.path());

        let tally = reconcile_list(&format!("{}\n@feature/x\n", origin.display()), &ctx);
        assert_eq!(tally.errors, 0);

        let worktree = ctx.parent_dir.join("w-feature-x");
        assert!(worktree.join(".git").is_file());
        let output = Command::new("git")
            .current_dir(&worktree)
            .args(["branch", "--show-current"])
            .output()
            .expect("git should run");
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            "feature/x"
        );
    }

    #[test]
    fn non_empty_target_is_an_error_not_a_crash() {
        let temp = tempdir().expect("tempdir");
        let origin = seed_origin(temp.path(), "origins/alpha", &[]);
        let ctx = workspace(temp.path());

        let squatter = ctx.parent_dir.join("alpha");
        fs::create_dir_all(&squatter).expect("create squatter");
        fs::write(squatter.join("occupied.txt"), "here first\n").expect("write file");

        let tally = reconcile_list(&format!("{}\n", origin.display()), &ctx);
        assert_eq!(tally.errors, 1);
        assert_eq!(tally.created, 0);
        assert!(squatter.join("occupied.txt").exists());
    }

    #[test]
    fn fallback_with_custom_targets_skips_extra_base_clone() {
        let temp = tempdir().expect("tempdir");
        let origin = seed_origin(temp.path(), "origins/delta", &["slides", "data"]);
        let ctx = workspace(temp.path());

        let tally = reconcile_list(
            &format!("{}@slides slides\n@data data\n", origin.display()),
            &ctx,
        );
        assert_eq!(tally.errors, 0);

        assert!(ctx.parent_dir.join("slides").join(".git").is_dir());
        assert!(ctx.parent_dir.join("data").join(".git").is_file());
        assert!(!ctx.parent_dir.join("delta").exists());
    }

    #[test]
    fn line_errors_count_toward_tally() {
        let temp = tempdir().expect("tempdir");
        let ctx = workspace(temp.path());

        let tally = reconcile_list("@orphan\n", &ctx);
        assert_eq!(tally.errors, 1);
        assert_eq!(tally.created, 0);
    }

    #[test]
    fn empty_plan_reconciles_to_zero_tally() {
        let temp = tempdir().expect("tempdir");
        let ctx = workspace(temp.path());
        let tally = reconcile_list("# nothing\n", &ctx);
        assert_eq!(tally, Tally::default());
    }
}

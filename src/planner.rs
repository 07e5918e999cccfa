use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::git;
use crate::listfile::{Entry, GlobalFlags, ListFile, Remote, Visibility};

/// Replace every `/` in a branch name with `-` to produce a filesystem-safe
/// directory segment. Git commands always receive the branch verbatim.
pub fn sanitize_branch(branch: &str) -> String {
    branch.replace('/', "-")
}

/// The concrete operation resolved for one plan entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    FullClone {
        remote: Remote,
        fetch_all_refs: bool,
    },
    SingleBranchClone {
        remote: Remote,
        branch: String,
    },
    /// `clone_fallback` carries the entry's own remote when the worktree was
    /// requested via `--worktree` on a `remote@ref` line; the reconciler
    /// falls back to a single-branch clone of it at the same target when the
    /// branch cannot be materialized from the base.
    WorktreeAdd {
        base: PathBuf,
        branch: String,
        clone_fallback: Option<Remote>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAction {
    pub line: usize,
    pub raw: String,
    pub target: PathBuf,
    pub kind: ActionKind,
    pub visibility: Option<Visibility>,
}

/// A per-line failure that does not abort planning; the reconciler reports it
/// and the run exits non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    pub line: usize,
    pub raw: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub flags: GlobalFlags,
    pub actions: Vec<ResolvedAction>,
    pub line_errors: Vec<LineError>,
}

impl Plan {
    /// Target directories in plan order, for the emitters and the pipeline.
    pub fn targets(&self) -> Vec<PathBuf> {
        self.actions.iter().map(|action| action.target.clone()).collect()
    }
}

/// Where the run is anchored: all targets resolve against the OS parent of
/// the working directory.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    pub working_dir: PathBuf,
    pub parent_dir: PathBuf,
    pub origin: Option<Remote>,
}

impl WorkspaceContext {
    pub fn new(working_dir: PathBuf, origin: Option<Remote>) -> Result<Self> {
        let parent_dir = working_dir
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| {
                format!("working directory has no parent: {}", working_dir.display())
            })?;
        Ok(Self {
            working_dir,
            parent_dir,
            origin,
        })
    }

    /// Build the context for a real working directory, picking up its origin
    /// remote when it is a git repository.
    pub fn discover(working_dir: &Path) -> Result<Self> {
        let working_dir = working_dir
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", working_dir.display()))?;
        let origin = git::remote_origin_url(&working_dir)
            .ok()
            .flatten()
            .and_then(|url| Remote::from_origin_url(&url));
        Self::new(working_dir, origin)
    }

    fn basename(&self) -> String {
        self.working_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "workspace".to_string())
    }
}

#[derive(Debug, Clone)]
struct FallbackRepo {
    remote: Remote,
    path: PathBuf,
}

/// Resolve the parsed list into a plan. Pure with respect to the filesystem:
/// identical input and context always yield identical target paths.
pub fn plan(list: &ListFile, ctx: &WorkspaceContext) -> Result<Plan> {
    let reference_counts = count_references(list);
    let workdir_name = ctx.basename();

    let mut fallback: Option<FallbackRepo> = ctx.origin.clone().map(|remote| FallbackRepo {
        remote,
        path: ctx.working_dir.clone(),
    });
    let mut actions: Vec<ResolvedAction> = Vec::new();
    let mut line_errors = Vec::new();

    for parsed in &list.entries {
        match &parsed.entry {
            Entry::Clone {
                remote,
                branch: None,
                target,
                fetch_all_refs,
                visibility,
                ..
            } => {
                let name = explicit_or(target.as_deref(), || remote.basename(), parsed)?;
                let target = ctx.parent_dir.join(name);
                actions.push(ResolvedAction {
                    line: parsed.number,
                    raw: parsed.raw.clone(),
                    target: target.clone(),
                    kind: ActionKind::FullClone {
                        remote: remote.clone(),
                        fetch_all_refs: *fetch_all_refs,
                    },
                    visibility: *visibility,
                });
                fallback = Some(FallbackRepo {
                    remote: remote.clone(),
                    path: target,
                });
            }
            Entry::Clone {
                remote,
                branch: Some(branch),
                target,
                visibility,
                worktree,
                ..
            } => {
                let in_worktree_path = *worktree == Some(true)
                    || (list.flags.force_worktree && *worktree != Some(false));
                let referenced_twice =
                    reference_counts.get(&remote.canonical_key()).copied().unwrap_or(0) >= 2;
                let name = explicit_or(
                    target.as_deref(),
                    || {
                        if referenced_twice || in_worktree_path {
                            format!("{}-{}", remote.basename(), sanitize_branch(branch))
                        } else {
                            remote.basename()
                        }
                    },
                    parsed,
                )?;
                let target = ctx.parent_dir.join(name);

                let kind = match (&fallback, in_worktree_path) {
                    (Some(base), true) => ActionKind::WorktreeAdd {
                        base: base.path.clone(),
                        branch: branch.clone(),
                        clone_fallback: Some(remote.clone()),
                    },
                    _ => ActionKind::SingleBranchClone {
                        remote: remote.clone(),
                        branch: branch.clone(),
                    },
                };
                actions.push(ResolvedAction {
                    line: parsed.number,
                    raw: parsed.raw.clone(),
                    target: target.clone(),
                    kind,
                    visibility: *visibility,
                });
                fallback = Some(FallbackRepo {
                    remote: remote.clone(),
                    path: target,
                });
            }
            Entry::Worktree {
                branch,
                target,
                no_worktree,
            } => {
                let Some(base) = &fallback else {
                    line_errors.push(LineError {
                        line: parsed.number,
                        raw: parsed.raw.clone(),
                        message: "no repository precedes this branch line".to_string(),
                    });
                    continue;
                };

                if *no_worktree {
                    let name = explicit_or(
                        target.as_deref(),
                        || format!("{}-{}", base.remote.basename(), sanitize_branch(branch)),
                        parsed,
                    )?;
                    actions.push(ResolvedAction {
                        line: parsed.number,
                        raw: parsed.raw.clone(),
                        target: ctx.parent_dir.join(name),
                        kind: ActionKind::SingleBranchClone {
                            remote: base.remote.clone(),
                            branch: branch.clone(),
                        },
                        visibility: None,
                    });
                } else {
                    let name = explicit_or(
                        target.as_deref(),
                        || format!("{workdir_name}-{}", sanitize_branch(branch)),
                        parsed,
                    )?;
                    actions.push(ResolvedAction {
                        line: parsed.number,
                        raw: parsed.raw.clone(),
                        target: ctx.parent_dir.join(name),
                        kind: ActionKind::WorktreeAdd {
                            base: base.path.clone(),
                            branch: branch.clone(),
                            clone_fallback: None,
                        },
                        visibility: None,
                    });
                }
            }
        }
    }

    check_duplicate_targets(&actions)?;
    check_worktree_bases(&actions, &ctx.working_dir)?;

    Ok(Plan {
        flags: list.flags,
        actions,
        line_errors,
    })
}

fn count_references(list: &ListFile) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for parsed in &list.entries {
        if let Entry::Clone { remote, .. } = &parsed.entry {
            *counts.entry(remote.canonical_key()).or_insert(0) += 1;
        }
    }
    counts
}

fn explicit_or(
    target: Option<&str>,
    default: impl FnOnce() -> String,
    parsed: &crate::listfile::ParsedLine,
) -> Result<String> {
    let Some(name) = target else {
        return Ok(default());
    };
    if name.contains('/') || name == "." || name == ".." {
        bail!(
            "line {}: target must be a plain directory name: {}",
            parsed.number,
            parsed.raw
        );
    }
    Ok(name.to_string())
}

fn check_duplicate_targets(actions: &[ResolvedAction]) -> Result<()> {
    let mut seen: HashMap<&Path, usize> = HashMap::new();
    for action in actions {
        if let Some(first_line) = seen.insert(action.target.as_path(), action.line) {
            bail!(
                "line {}: target {} already produced by line {}: {}",
                action.line,
                action.target.display(),
                first_line,
                action.raw
            );
        }
    }
    Ok(())
}

/// Every worktree base must either already exist on disk or be materialized
/// by an earlier action in the same plan.
fn check_worktree_bases(actions: &[ResolvedAction], working_dir: &Path) -> Result<()> {
    let mut produced: HashSet<&Path> = HashSet::new();
    for action in actions {
        if let ActionKind::WorktreeAdd { base, .. } = &action.kind {
            let known = produced.contains(base.as_path())
                || base == working_dir
                || base.is_dir();
            if !known {
                bail!(
                    "line {}: worktree base {} is neither an existing repository nor created by an earlier line: {}",
                    action.line,
                    base.display(),
                    action.raw
                );
            }
        }
        produced.insert(action.target.as_path());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listfile::parse_list_file;

    fn ctx() -> WorkspaceContext {
        WorkspaceContext::new(PathBuf::from("/p/w"), None).expect("context")
    }

    fn ctx_with_origin(origin: &str) -> WorkspaceContext {
        WorkspaceContext::new(
            PathBuf::from("/p/w"),
            Some(Remote::parse(origin).expect("origin")),
        )
        .expect("context")
    }

    fn plan_str(text: &str, ctx: &WorkspaceContext) -> Plan {
        plan(&parse_list_file(text).expect("parse"), ctx).expect("plan")
    }

    #[test]
    fn clone_then_worktree_uses_workdir_name() {
        let plan = plan_str("acme/alpha\n@dev\n", &ctx());
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].target, PathBuf::from("/p/alpha"));
        assert!(matches!(plan.actions[0].kind, ActionKind::FullClone { .. }));
        assert_eq!(plan.actions[1].target, PathBuf::from("/p/w-dev"));
        match &plan.actions[1].kind {
            ActionKind::WorktreeAdd {
                base,
                branch,
                clone_fallback,
            } => {
                assert_eq!(base, &PathBuf::from("/p/alpha"));
                assert_eq!(branch, "dev");
                assert!(clone_fallback.is_none());
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn multi_reference_remotes_are_suffixed() {
        let plan = plan_str("acme/beta@main\nacme/beta@experimental\n", &ctx());
        assert_eq!(plan.actions[0].target, PathBuf::from("/p/beta-main"));
        assert_eq!(
            plan.actions[1].target,
            PathBuf::from("/p/beta-experimental")
        );
    }

    #[test]
    fn single_reference_remote_is_not_suffixed() {
        let plan = plan_str("acme/gamma@release\n", &ctx());
        assert_eq!(plan.actions[0].target, PathBuf::from("/p/gamma"));
        match &plan.actions[0].kind {
            ActionKind::SingleBranchClone { branch, .. } => assert_eq!(branch, "release"),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn explicit_targets_anchor_fallback() {
        let plan = plan_str("acme/delta@slides slides\n@data data\n", &ctx());
        assert_eq!(plan.actions[0].target, PathBuf::from("/p/slides"));
        assert_eq!(plan.actions[1].target, PathBuf::from("/p/data"));
        match &plan.actions[1].kind {
            ActionKind::WorktreeAdd { base, .. } => {
                assert_eq!(base, &PathBuf::from("/p/slides"));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn slashed_branch_is_sanitized_in_target_only() {
        let plan = plan_str("acme/epsilon\n@feature/x\n", &ctx());
        assert_eq!(plan.actions[1].target, PathBuf::from("/p/w-feature-x"));
        match &plan.actions[1].kind {
            ActionKind::WorktreeAdd { branch, .. } => assert_eq!(branch, "feature/x"),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn bare_branch_without_fallback_is_recorded_not_fatal() {
        let plan = plan_str("@orphan\nacme/alpha\n", &ctx());
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.line_errors.len(), 1);
        assert_eq!(plan.line_errors[0].line, 1);
    }

    #[test]
    fn working_dir_repo_seeds_fallback() {
        let plan = plan_str("@dev\n", &ctx_with_origin("acme/w"));
        assert_eq!(plan.actions.len(), 1);
        match &plan.actions[0].kind {
            ActionKind::WorktreeAdd { base, .. } => {
                assert_eq!(base, &PathBuf::from("/p/w"));
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(plan.actions[0].target, PathBuf::from("/p/w-dev"));
    }

    #[test]
    fn no_worktree_branch_line_clones_fallback_remote() {
        let plan = plan_str("acme/alpha\n@dev --no-worktree\n", &ctx());
        match &plan.actions[1].kind {
            ActionKind::SingleBranchClone { remote, branch } => {
                assert_eq!(remote.canonical_key(), "acme/alpha");
                assert_eq!(branch, "dev");
            }
            other => panic!("unexpected kind {other:?}"),
        }
        // Suffixed so it cannot collide with the base clone.
        assert_eq!(plan.actions[1].target, PathBuf::from("/p/alpha-dev"));
    }

    #[test]
    fn force_worktree_converts_ref_clones() {
        let plan = plan_str("force-worktree\nacme/alpha\nacme/alpha@dev\n", &ctx());
        match &plan.actions[1].kind {
            ActionKind::WorktreeAdd {
                base,
                clone_fallback,
                ..
            } => {
                assert_eq!(base, &PathBuf::from("/p/alpha"));
                assert_eq!(
                    clone_fallback.as_ref().map(Remote::canonical_key).as_deref(),
                    Some("acme/alpha")
                );
            }
            other => panic!("unexpected kind {other:?}"),
        }
        // Worktree-path targets keep the suffixed single-branch name.
        assert_eq!(plan.actions[1].target, PathBuf::from("/p/alpha-dev"));
    }

    #[test]
    fn no_worktree_overrides_global_force() {
        let plan = plan_str("force-worktree\nacme/alpha\nacme/alpha@dev --no-worktree\n", &ctx());
        assert!(matches!(
            plan.actions[1].kind,
            ActionKind::SingleBranchClone { .. }
        ));
    }

    #[test]
    fn ref_clone_without_fallback_stays_single_branch_under_force() {
        let plan = plan_str("force-worktree\nacme/gamma@release\n", &ctx());
        assert!(matches!(
            plan.actions[0].kind,
            ActionKind::SingleBranchClone { .. }
        ));
        assert_eq!(plan.actions[0].target, PathBuf::from("/p/gamma-release"));
    }

    #[test]
    fn fallback_updates_only_on_clone_entries() {
        let plan = plan_str("acme/alpha\n@dev\n@topic\n", &ctx());
        for action in &plan.actions[1..] {
            match &action.kind {
                ActionKind::WorktreeAdd { base, .. } => {
                    assert_eq!(base, &PathBuf::from("/p/alpha"));
                }
                other => panic!("unexpected kind {other:?}"),
            }
        }
    }

    #[test]
    fn duplicate_targets_abort_planning() {
        let err = plan(
            &parse_list_file("acme/alpha\nother/alpha\n").expect("parse"),
            &ctx(),
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("already produced by line 1"));
    }

    #[test]
    fn rejects_nested_explicit_target() {
        let err = plan(
            &parse_list_file("acme/alpha nested/dir\n").expect("parse"),
            &ctx(),
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("plain directory name"));
    }

    #[test]
    fn plans_are_deterministic() {
        let text = "acme/alpha\nacme/beta@main\nacme/beta@dev\n@topic\n";
        let first = plan_str(text, &ctx());
        let second = plan_str(text, &ctx());
        assert_eq!(first.actions, second.actions);
    }

    #[test]
    fn sanitize_is_identity_without_slashes() {
        assert_eq!(sanitize_branch("main"), "main");
        assert_eq!(sanitize_branch("feature/x/y"), "feature-x-y");
    }

    #[test]
    fn empty_list_produces_empty_plan() {
        let plan = plan_str("# nothing here\n", &ctx());
        assert!(plan.actions.is_empty());
        assert!(plan.line_errors.is_empty());
    }
}

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use tempfile::NamedTempFile;

use crate::planner::{ActionKind, Plan};

/// A post-reconciliation output: the multi-root workspace file or a
/// container-config injection. One method, applied to the finished plan.
pub trait Emitter {
    fn apply(&self, plan: &Plan) -> Result<()>;
}

pub const WORKSPACE_FILE_NAME: &str = "entire-project.code-workspace";

/// Writes the multi-root editor workspace file: the current directory first,
/// then every reconciled target as a `../<dir>` relative path in plan order.
pub struct WorkspaceFileEmitter {
    pub working_dir: PathBuf,
}

impl Emitter for WorkspaceFileEmitter {
    fn apply(&self, plan: &Plan) -> Result<()> {
        let document = workspace_document(plan);
        let path = self.working_dir.join(WORKSPACE_FILE_NAME);
        write_atomic(&path, &format!("{:#}\n", document))
    }
}

fn workspace_document(plan: &Plan) -> Value {
    let mut folders = vec![json!({"path": "."})];
    for target in plan.targets() {
        if let Some(name) = target.file_name() {
            folders.push(json!({"path": format!("../{}", name.to_string_lossy())}));
        }
    }
    json!({"folders": folders})
}

/// Injects per-repository permission grants into container-config files at
/// `$.customizations.codespaces.repositories["owner/repo"]`. Files are read
/// tolerantly (comments and trailing commas allowed) and rewritten as plain
/// JSON; re-running produces the same document.
pub struct ContainerConfigEmitter {
    pub files: Vec<PathBuf>,
    pub permissions: String,
}

impl Emitter for ContainerConfigEmitter {
    fn apply(&self, plan: &Plan) -> Result<()> {
        let repos = forge_repositories(plan);
        for file in &self.files {
            inject_into_file(file, &repos, &self.permissions)?;
        }
        Ok(())
    }
}

/// Every GitHub-addressable remote in the plan, in plan order, deduplicated.
fn forge_repositories(plan: &Plan) -> Vec<String> {
    let mut repos = Vec::new();
    for action in &plan.actions {
        let remote = match &action.kind {
            ActionKind::FullClone { remote, .. } => Some(remote),
            ActionKind::SingleBranchClone { remote, .. } => Some(remote),
            ActionKind::WorktreeAdd { clone_fallback, .. } => clone_fallback.as_ref(),
        };
        if let Some((owner, repo)) = remote.and_then(|remote| remote.owner_repo()) {
            let key = format!("{owner}/{repo}");
            if !repos.contains(&key) {
                repos.push(key);
            }
        }
    }
    repos
}

fn inject_into_file(path: &Path, repos: &[String], permissions: &str) -> Result<()> {
    let mut document = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let stripped = strip_jsonc(&raw);
        serde_json::from_str::<Value>(&stripped)
            .with_context(|| format!("failed to parse {}", path.display()))?
    } else {
        Value::Object(Map::new())
    };

    let Value::Object(root) = &mut document else {
        bail!("{} does not contain a JSON object", path.display());
    };

    let repositories = root
        .entry("customizations")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .with_context(|| format!("customizations is not an object in {}", path.display()))?
        .entry("codespaces")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .with_context(|| format!("codespaces is not an object in {}", path.display()))?
        .entry("repositories")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .with_context(|| format!("repositories is not an object in {}", path.display()))?;

    for repo in repos {
        repositories.insert(repo.clone(), json!({"permissions": permissions}));
    }

    write_atomic(path, &format!("{:#}\n", document))
}

/// Remove `//` and `/* */` comments, then trailing commas, without touching
/// string contents. Comment stripping runs a small scanner; trailing commas
/// are located on a copy with string literals masked out.
pub fn strip_jsonc(text: &str) -> String {
    let without_comments = strip_comments(text);
    strip_trailing_commas(&without_comments)
}

fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;
    let mut escaped = false;

    while i < bytes.len() {
        let byte = bytes[i];
        if in_string {
            output.push(byte);
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match byte {
            b'"' => {
                in_string = true;
                output.push(byte);
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            _ => {
                output.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8(output).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

fn strip_trailing_commas(text: &str) -> String {
    let masked = mask_string_literals(text.as_bytes());
    let mut drop = vec![false; masked.len()];

    for (i, &byte) in masked.iter().enumerate() {
        if byte != b',' {
            continue;
        }
        let next = masked[i + 1..].iter().find(|&&b| !b.is_ascii_whitespace());
        if matches!(next, Some(b'}') | Some(b']')) {
            drop[i] = true;
        }
    }

    let kept: Vec<u8> = text
        .bytes()
        .enumerate()
        .filter(|(i, _)| !drop[*i])
        .map(|(_, byte)| byte)
        .collect();
    String::from_utf8(kept).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

/// Blank out string contents byte-for-byte so structural scans cannot match
/// characters inside literals. The output length always equals the input.
fn mask_string_literals(bytes: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut escaped = false;
    for &byte in bytes {
        if in_string {
            if escaped {
                escaped = false;
                output.push(b' ');
            } else if byte == b'\\' {
                escaped = true;
                output.push(b' ');
            } else if byte == b'"' {
                in_string = false;
                output.push(b'"');
            } else {
                output.push(if byte == b'\n' { b'\n' } else { b' ' });
            }
        } else {
            if byte == b'"' {
                in_string = true;
            }
            output.push(byte);
        }
    }
    output
}

/// Rewrites go through a randomly named temp file in the destination
/// directory followed by an atomic rename.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    temp.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    temp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use anyhow::{Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Display for Visibility {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Private => f.write_str("private"),
        }
    }
}

/// Flags recognized on their own line at any point in the plan file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalFlags {
    pub default_visibility: Option<Visibility>,
    pub force_worktree: bool,
    pub enable_codespaces: bool,
}

/// A validated remote specifier. Only the GitHub-addressable forms
/// (`OwnerRepo`, `HttpsGithub`, `SshGithub`) are ever passed to the forge
/// client; the rest are local or opaque and skip forge interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remote {
    OwnerRepo { owner: String, repo: String },
    FileUrl { path: PathBuf },
    AbsolutePath { path: PathBuf },
    HttpsGithub { owner: String, repo: String },
    SshGithub { owner: String, repo: String },
    OtherUrl { url: String },
}

impl Remote {
    pub fn parse(token: &str) -> Result<Self> {
        if let Some(rest) = token.strip_prefix("file://") {
            if !rest.starts_with('/') {
                bail!("file:// remote must carry an absolute path: {token}");
            }
            return Ok(Self::FileUrl {
                path: PathBuf::from(rest),
            });
        }

        if token.starts_with("https://") || token.starts_with("http://") {
            if let Some((owner, repo)) = github_https_owner_repo(token) {
                return Ok(Self::HttpsGithub { owner, repo });
            }
            return Ok(Self::OtherUrl {
                url: token.to_string(),
            });
        }

        if let Some(rest) = token.strip_prefix("git@") {
            if let Some(path) = rest.strip_prefix("github.com:") {
                if let Some((owner, repo)) = split_owner_repo(path.trim_end_matches(".git")) {
                    return Ok(Self::SshGithub { owner, repo });
                }
            }
            return Ok(Self::OtherUrl {
                url: token.to_string(),
            });
        }

        if token.starts_with('/') {
            return Ok(Self::AbsolutePath {
                path: PathBuf::from(token),
            });
        }

        let owner_repo_re = Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").unwrap();
        if owner_repo_re.is_match(token) {
            if let Some((owner, repo)) = split_owner_repo(token) {
                return Ok(Self::OwnerRepo { owner, repo });
            }
        }

        if token.contains('/') {
            bail!("local path remotes must be absolute: {token}");
        }
        bail!("unrecognized remote specifier: {token}");
    }

    /// The `owner/repo` pair when this remote is GitHub-addressable.
    pub fn owner_repo(&self) -> Option<(&str, &str)> {
        match self {
            Self::OwnerRepo { owner, repo }
            | Self::HttpsGithub { owner, repo }
            | Self::SshGithub { owner, repo } => Some((owner, repo)),
            _ => None,
        }
    }

    /// Default directory name for a clone of this remote.
    pub fn basename(&self) -> String {
        match self {
            Self::OwnerRepo { repo, .. }
            | Self::HttpsGithub { repo, .. }
            | Self::SshGithub { repo, .. } => repo.clone(),
            Self::FileUrl { path } | Self::AbsolutePath { path } => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "repo".to_string()),
            Self::OtherUrl { url } => url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("repo")
                .trim_end_matches(".git")
                .to_string(),
        }
    }

    /// URL handed to `git clone`.
    pub fn clone_url(&self) -> String {
        match self {
            Self::OwnerRepo { owner, repo } => format!("https://github.com/{owner}/{repo}.git"),
            Self::FileUrl { path } => format!("file://{}", path.display()),
            Self::AbsolutePath { path } => path.display().to_string(),
            Self::HttpsGithub { owner, repo } => format!("https://github.com/{owner}/{repo}.git"),
            Self::SshGithub { owner, repo } => format!("git@github.com:{owner}/{repo}.git"),
            Self::OtherUrl { url } => url.clone(),
        }
    }

    /// Canonical identity used by the planner's reference-counting pass.
    pub fn canonical_key(&self) -> String {
        match self.owner_repo() {
            Some((owner, repo)) => format!("{owner}/{repo}"),
            None => match self {
                Self::FileUrl { path } | Self::AbsolutePath { path } => path.display().to_string(),
                Self::OtherUrl { url } => url.clone(),
                _ => unreachable!("owner_repo covers the github forms"),
            },
        }
    }

    /// Parse a remote back out of an `origin` URL reported by git.
    pub fn from_origin_url(url: &str) -> Option<Self> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return None;
        }
        Remote::parse(trimmed).ok()
    }
}

/// One parsed plan directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Clone {
        remote: Remote,
        branch: Option<String>,
        target: Option<String>,
        fetch_all_refs: bool,
        visibility: Option<Visibility>,
        worktree: Option<bool>,
    },
    Worktree {
        branch: String,
        target: Option<String>,
        no_worktree: bool,
    },
}

/// An entry with its provenance, kept for error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub number: usize,
    pub raw: String,
    pub entry: Entry,
}

#[derive(Debug, Clone, Default)]
pub struct ListFile {
    pub flags: GlobalFlags,
    pub entries: Vec<ParsedLine>,
}

const GLOBAL_FLAG_TOKENS: [&str; 4] = [
    "default-public",
    "default-private",
    "force-worktree",
    "enable-codespaces",
];

pub fn parse_list_file(text: &str) -> Result<ListFile> {
    let mut flags = GlobalFlags::default();
    let mut entries = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let number = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let tokens = tokenize_line(trimmed);
        if tokens.is_empty() {
            continue;
        }

        if GLOBAL_FLAG_TOKENS.contains(&tokens[0].as_str()) {
            if tokens.len() > 1 {
                bail!(
                    "line {number}: global flag '{}' must stand alone: {trimmed}",
                    tokens[0]
                );
            }
            match tokens[0].as_str() {
                "default-public" => flags.default_visibility = Some(Visibility::Public),
                "default-private" => flags.default_visibility = Some(Visibility::Private),
                "force-worktree" => flags.force_worktree = true,
                "enable-codespaces" => flags.enable_codespaces = true,
                _ => unreachable!(),
            }
            continue;
        }

        let entry = parse_entry(&tokens)
            .map_err(|err| anyhow::anyhow!("line {number}: {err}: {trimmed}"))?;
        entries.push(ParsedLine {
            number,
            raw: trimmed.to_string(),
            entry,
        });
    }

    Ok(ListFile { flags, entries })
}

fn parse_entry(tokens: &[String]) -> Result<Entry> {
    let head = tokens[0].as_str();
    let mut target: Option<String> = None;
    let mut visibility: Option<Visibility> = None;
    let mut worktree: Option<bool> = None;
    let mut fetch_all_refs = false;

    for token in &tokens[1..] {
        match token.as_str() {
            "--public" => visibility = Some(Visibility::Public),
            "--private" => visibility = Some(Visibility::Private),
            "--worktree" => worktree = Some(true),
            "--no-worktree" => worktree = Some(false),
            "-a" => fetch_all_refs = true,
            // Unknown flags may be meaningful to downstream emitters.
            flag if flag.starts_with('-') => {}
            positional if target.is_none() => target = Some(positional.to_string()),
            extra => bail!("unexpected token '{extra}'"),
        }
    }

    if let Some(branch) = head.strip_prefix('@') {
        if branch.is_empty() {
            bail!("missing branch name after '@'");
        }
        return Ok(Entry::Worktree {
            branch: branch.to_string(),
            target,
            no_worktree: worktree == Some(false),
        });
    }

    let (remote_token, branch) = split_ref_suffix(head);
    let remote = Remote::parse(remote_token)?;
    Ok(Entry::Clone {
        remote,
        branch,
        target,
        fetch_all_refs,
        visibility,
        worktree,
    })
}

/// Split a `remote@branch` token, leaving scheme userinfo and the `git@` ssh
/// prefix intact.
fn split_ref_suffix(token: &str) -> (&str, Option<String>) {
    let search_from = if let Some(scheme_end) = token.find("://") {
        // '@' inside the URL authority is userinfo, not a ref suffix.
        let after_scheme = scheme_end + 3;
        match token[after_scheme..].find('/') {
            Some(path_start) => after_scheme + path_start,
            None => return (token, None),
        }
    } else if token.starts_with("git@") {
        4
    } else {
        0
    };

    match token[search_from..].find('@') {
        Some(offset) => {
            let at = search_from + offset;
            let branch = &token[at + 1..];
            if branch.is_empty() {
                (token, None)
            } else {
                (&token[..at], Some(branch.to_string()))
            }
        }
        None => (token, None),
    }
}

/// Whitespace-split a line, dropping everything from the first `#` token on.
fn tokenize_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for token in line.split_whitespace() {
        if token.starts_with('#') {
            break;
        }
        tokens.push(token.to_string());
    }
    tokens
}

fn github_https_owner_repo(url: &str) -> Option<(String, String)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let (host, path) = rest.split_once('/')?;
    let host = host.rsplit('@').next()?;
    if host != "github.com" {
        return None;
    }
    split_owner_repo(path.trim_end_matches('/').trim_end_matches(".git"))
}

fn split_owner_repo(path: &str) -> Option<(String, String)> {
    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

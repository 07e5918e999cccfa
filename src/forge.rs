use std::cell::Cell;
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde_json::json;

use crate::listfile::Visibility;

const API_ROOT: &str = "https://api.github.com";
const CLIENT_USER_AGENT: &str = "repos-cli";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    User,
    Organization,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoProbe {
    Exists,
    NotFound,
    Error(u16, String),
    /// No credentials or the forge is unreachable; the caller decides whether
    /// the entry proceeds locally or is skipped with a warning.
    NetworkError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchProbe {
    Exists,
    NotFound,
    Error(String),
    NetworkError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCheck {
    Valid,
    Invalid(String),
    NetworkError,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: String,
    pub username: Option<String>,
}

/// Read a forge token once per run: environment first, then the git
/// credential helper in non-interactive mode. `None` puts the client in
/// read-only-local mode.
pub fn discover_credentials() -> Option<Credentials> {
    let username = env::var("GH_USER").ok().filter(|value| !value.is_empty());

    for var in ["GH_TOKEN", "GITHUB_TOKEN"] {
        if let Ok(token) = env::var(var) {
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Some(Credentials { token, username });
            }
        }
    }

    credential_helper_fill().map(|mut creds| {
        if creds.username.is_none() {
            creds.username = username;
        }
        creds
    })
}

fn credential_helper_fill() -> Option<Credentials> {
    let mut child = Command::new("git")
        .args(["credential", "fill"])
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    child
        .stdin
        .take()?
        .write_all(b"protocol=https\nhost=github.com\n\n")
        .ok()?;
    let output = child.wait_with_output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_credential_fill(&String::from_utf8_lossy(&output.stdout))
}

/// Some credential helpers emit CRLF line endings; carriage returns must be
/// stripped before the token is usable.
fn parse_credential_fill(raw: &str) -> Option<Credentials> {
    let mut username = None;
    let mut password = None;
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("username=") {
            username = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("password=") {
            password = Some(value.to_string());
        }
    }
    let token = password?.trim().to_string();
    if token.is_empty() {
        return None;
    }
    Some(Credentials {
        token,
        username: username.filter(|value| !value.is_empty()),
    })
}

pub struct ForgeClient {
    http: Client,
    credentials: Option<Credentials>,
    degraded: Cell<bool>,
}

impl ForgeClient {
    pub fn new(credentials: Option<Credentials>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            credentials,
            degraded: Cell::new(false),
        }
    }

    /// True when no usable credentials are available or a network failure
    /// switched the client to read-only-local mode for the rest of the run.
    pub fn read_only_local(&self) -> bool {
        self.credentials.is_none() || self.degraded.get()
    }

    pub fn validate_token(&self) -> TokenCheck {
        if self.read_only_local() {
            return TokenCheck::NetworkError;
        }
        match self.get(&format!("{API_ROOT}/user")) {
            Ok(response) => {
                let success = response.status().is_success();
                let body = response.text().unwrap_or_default();
                interpret_token_response(success, &body)
            }
            Err(_) => {
                self.degraded.set(true);
                TokenCheck::NetworkError
            }
        }
    }

    pub fn classify_owner(&self, owner: &str) -> OwnerKind {
        if self.read_only_local() {
            return OwnerKind::Unknown;
        }
        match self.get(&format!("{API_ROOT}/users/{owner}")) {
            Ok(response) if response.status().is_success() => {
                let body = response.text().unwrap_or_default();
                owner_kind_from_body(&body)
            }
            Ok(_) => OwnerKind::Unknown,
            Err(_) => {
                self.degraded.set(true);
                OwnerKind::Unknown
            }
        }
    }

    pub fn repo_exists(&self, owner: &str, repo: &str) -> RepoProbe {
        if self.read_only_local() {
            return RepoProbe::NetworkError;
        }
        match self.get(&format!("{API_ROOT}/repos/{owner}/{repo}")) {
            Ok(response) => match response.status() {
                status if status.is_success() => RepoProbe::Exists,
                StatusCode::NOT_FOUND => RepoProbe::NotFound,
                status => RepoProbe::Error(
                    status.as_u16(),
                    response.text().unwrap_or_default().trim().to_string(),
                ),
            },
            Err(_) => {
                self.degraded.set(true);
                RepoProbe::NetworkError
            }
        }
    }

    /// Create a repository under `owner`. The endpoint depends on whether the
    /// owner is the authenticated user or an organization.
    pub fn create_repo(
        &self,
        owner: &str,
        repo: &str,
        kind: OwnerKind,
        visibility: Visibility,
        auto_init: bool,
    ) -> Result<()> {
        if self.read_only_local() {
            anyhow::bail!("no forge credentials available");
        }
        let url = match kind {
            OwnerKind::User => format!("{API_ROOT}/user/repos"),
            OwnerKind::Organization => format!("{API_ROOT}/orgs/{owner}/repos"),
            OwnerKind::Unknown => anyhow::bail!("owner type of {owner} is unknown"),
        };
        let body = json!({
            "name": repo,
            "private": visibility == Visibility::Private,
            "auto_init": auto_init,
        });
        let response = self
            .post(&url, &body)
            .with_context(|| format!("failed to reach forge creating {owner}/{repo}"))
            .inspect_err(|_| self.degraded.set(true))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        anyhow::bail!(
            "forge rejected creation of {owner}/{repo} (status {}): {}",
            status.as_u16(),
            response.text().unwrap_or_default().trim()
        );
    }

    pub fn branch_exists(&self, owner: &str, repo: &str, branch: &str) -> BranchProbe {
        if self.read_only_local() {
            return BranchProbe::NetworkError;
        }
        match self.get(&format!("{API_ROOT}/repos/{owner}/{repo}/branches/{branch}")) {
            Ok(response) => match response.status() {
                status if status.is_success() => BranchProbe::Exists,
                StatusCode::NOT_FOUND => BranchProbe::NotFound,
                status => BranchProbe::Error(format!(
                    "status {}: {}",
                    status.as_u16(),
                    response.text().unwrap_or_default().trim()
                )),
            },
            Err(_) => {
                self.degraded.set(true);
                BranchProbe::NetworkError
            }
        }
    }

    /// Create `branch` anchored at the tip of the repository's default
    /// branch. The default-branch probe must succeed before any write is
    /// attempted.
    pub fn create_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<()> {
        if self.read_only_local() {
            anyhow::bail!("no forge credentials available");
        }

        #[derive(Deserialize)]
        struct RepoInfo {
            default_branch: String,
        }
        #[derive(Deserialize)]
        struct RefInfo {
            object: RefObject,
        }
        #[derive(Deserialize)]
        struct RefObject {
            sha: String,
        }

        let response = self
            .get(&format!("{API_ROOT}/repos/{owner}/{repo}"))
            .with_context(|| format!("failed to probe default branch of {owner}/{repo}"))
            .inspect_err(|_| self.degraded.set(true))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "default branch probe for {owner}/{repo} failed (status {})",
                response.status().as_u16()
            );
        }
        let info: RepoInfo = response
            .json()
            .with_context(|| format!("malformed repository response for {owner}/{repo}"))?;

        let response = self
            .get(&format!(
                "{API_ROOT}/repos/{owner}/{repo}/git/ref/heads/{}",
                info.default_branch
            ))
            .with_context(|| format!("failed to read tip of {owner}/{repo}"))
            .inspect_err(|_| self.degraded.set(true))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "tip probe for {}/{} default branch '{}' failed (status {})",
                owner,
                repo,
                info.default_branch,
                response.status().as_u16()
            );
        }
        let tip: RefInfo = response
            .json()
            .with_context(|| format!("malformed ref response for {owner}/{repo}"))?;

        let body = json!({
            "ref": format!("refs/heads/{branch}"),
            "sha": tip.object.sha,
        });
        let response = self
            .post(&format!("{API_ROOT}/repos/{owner}/{repo}/git/refs"), &body)
            .with_context(|| format!("failed to reach forge creating branch {branch}"))
            .inspect_err(|_| self.degraded.set(true))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        anyhow::bail!(
            "forge rejected branch {branch} on {owner}/{repo} (status {}): {}",
            status.as_u16(),
            response.text().unwrap_or_default().trim()
        );
    }

    pub fn authenticated_login(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .and_then(|creds| creds.username.clone())
    }

    fn get(&self, url: &str) -> reqwest::Result<Response> {
        self.request(self.http.get(url))
    }

    fn post(&self, url: &str, body: &serde_json::Value) -> reqwest::Result<Response> {
        self.request(self.http.post(url).json(body))
    }

    fn request(
        &self,
        builder: reqwest::blocking::RequestBuilder,
    ) -> reqwest::Result<Response> {
        let mut builder = builder
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(creds) = &self.credentials {
            builder = builder.header(AUTHORIZATION, format!("token {}", creds.token));
        }
        builder.send()
    }
}

/// An empty or malformed response is a network problem worth retrying; a body
/// naming bad credentials is hard-invalid and will fail identically for every
/// later call.
fn interpret_token_response(success: bool, body: &str) -> TokenCheck {
    if body.contains("Bad credentials") || body.contains("Requires authentication") {
        return TokenCheck::Invalid("forge rejected the token".to_string());
    }
    if !success {
        return TokenCheck::NetworkError;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) if value.get("login").is_some() => TokenCheck::Valid,
        _ => TokenCheck::NetworkError,
    }
}

fn owner_kind_from_body(body: &str) -> OwnerKind {
    #[derive(Deserialize)]
    struct UserInfo {
        #[serde(rename = "type")]
        kind: Option<String>,
    }
    match serde_json::from_str::<UserInfo>(body) {
        Ok(info) => match info.kind.as_deref() {
            Some("User") => OwnerKind::User,
            Some("Organization") => OwnerKind::Organization,
            _ => OwnerKind::Unknown,
        },
        Err(_) => OwnerKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_credential_fill_output() {
        let creds = parse_credential_fill("username=octocat\npassword=tok123\n").expect("creds");
        assert_eq!(creds.token, "tok123");
        assert_eq!(creds.username.as_deref(), Some("octocat"));
    }

    #[test]
    fn strips_carriage_returns_from_helper_output() {
        let creds =
            parse_credential_fill("username=octocat\r\npassword=tok123\r\n").expect("creds");
        assert_eq!(creds.token, "tok123");
        assert_eq!(creds.username.as_deref(), Some("octocat"));
    }

    #[test]
    fn missing_password_yields_no_credentials() {
        assert!(parse_credential_fill("username=octocat\n").is_none());
        assert!(parse_credential_fill("password=\n").is_none());
    }

    #[test]
    fn token_check_flags_bad_credentials_as_invalid() {
        assert!(matches!(
            interpret_token_response(false, r#"{"message":"Bad credentials"}"#),
            TokenCheck::Invalid(_)
        ));
        assert!(matches!(
            interpret_token_response(false, r#"{"message":"Requires authentication"}"#),
            TokenCheck::Invalid(_)
        ));
    }

    #[test]
    fn token_check_treats_empty_body_as_network_error() {
        assert_eq!(interpret_token_response(true, ""), TokenCheck::NetworkError);
        assert_eq!(
            interpret_token_response(false, "<html>gateway timeout</html>"),
            TokenCheck::NetworkError
        );
    }

    #[test]
    fn token_check_accepts_login_payload() {
        assert_eq!(
            interpret_token_response(true, r#"{"login":"octocat","type":"User"}"#),
            TokenCheck::Valid
        );
    }

    #[test]
    fn owner_kind_requires_type_field() {
        assert_eq!(
            owner_kind_from_body(r#"{"login":"octocat","type":"User"}"#),
            OwnerKind::User
        );
        assert_eq!(
            owner_kind_from_body(r#"{"login":"acme","type":"Organization"}"#),
            OwnerKind::Organization
        );
        assert_eq!(owner_kind_from_body(r#"{"login":"acme"}"#), OwnerKind::Unknown);
        assert_eq!(owner_kind_from_body("not json"), OwnerKind::Unknown);
    }

    #[test]
    fn client_without_credentials_is_read_only_local() {
        let client = ForgeClient::new(None);
        assert!(client.read_only_local());
        assert_eq!(client.validate_token(), TokenCheck::NetworkError);
        assert_eq!(client.repo_exists("acme", "alpha"), RepoProbe::NetworkError);
        assert_eq!(
            client.branch_exists("acme", "alpha", "dev"),
            BranchProbe::NetworkError
        );
        assert_eq!(client.classify_owner("acme"), OwnerKind::Unknown);
    }
}

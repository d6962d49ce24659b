//! Scan targets and Git repository URL parsing
//!
//! Only public repositories on github.com and gitlab.com are accepted, in
//! HTTPS form (`www.` optional, trailing `.git` or `/` optional) or SSH
//! form (`git@host:owner/repo.git`). Every accepted form normalizes to the
//! canonical HTTPS clone URL.

use crate::error::{ErrorCode, ScanError, ScanResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// The forms the parser accepts, returned in `unsupported-url` details.
pub const ACCEPTED_URL_FORMS: &[&str] = &[
    "https://github.com/<owner>/<repo>",
    "https://github.com/<owner>/<repo>.git",
    "https://www.github.com/<owner>/<repo>",
    "git@github.com:<owner>/<repo>.git",
    "https://gitlab.com/<owner>/<repo>",
    "https://gitlab.com/<owner>/<repo>.git",
    "https://www.gitlab.com/<owner>/<repo>",
    "git@gitlab.com:<owner>/<repo>.git",
];

static HTTPS_FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https://(?:www\.)?(github\.com|gitlab\.com)/([A-Za-z0-9._-]+)/([A-Za-z0-9._-]+?)(?:\.git)?/?$",
    )
    .expect("https repo url regex")
});

static SSH_FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^git@(github\.com|gitlab\.com):([A-Za-z0-9._-]+)/([A-Za-z0-9._-]+?)(?:\.git)?$")
        .expect("ssh repo url regex")
});

/// Hosting platform of a repository target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Github,
    Gitlab,
}

impl Platform {
    pub fn host(&self) -> &'static str {
        match self {
            Platform::Github => "github.com",
            Platform::Gitlab => "gitlab.com",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.host())
    }
}

/// A parsed repository reference with its canonical clone URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoUrl {
    pub platform: Platform,
    pub owner: String,
    pub repo: String,
    pub clone_url: String,
}

impl RepoUrl {
    /// Parse any accepted repository URL form into its canonical shape.
    pub fn parse(input: &str) -> ScanResult<Self> {
        let trimmed = input.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ScanError::new(ErrorCode::InvalidUrl, "empty repository URL"));
        }

        let captures = HTTPS_FORM
            .captures(trimmed)
            .or_else(|| SSH_FORM.captures(trimmed));
        let Some(captures) = captures else {
            return Err(unsupported(trimmed));
        };

        let platform = match &captures[1] {
            "github.com" => Platform::Github,
            "gitlab.com" => Platform::Gitlab,
            _ => return Err(unsupported(trimmed)),
        };
        let owner = captures[2].to_string();
        let repo = captures[3].to_string();
        if repo.is_empty() || owner.is_empty() || repo == ".git" {
            return Err(unsupported(trimmed));
        }

        let clone_url = format!("https://{}/{}/{}.git", platform.host(), owner, repo);
        Ok(Self {
            platform,
            owner,
            repo,
            clone_url,
        })
    }

    /// Rate-limiter key for this repository.
    pub fn limiter_key(&self) -> &str {
        &self.clone_url
    }
}

impl fmt::Display for RepoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clone_url)
    }
}

fn unsupported(input: &str) -> ScanError {
    ScanError::new(
        ErrorCode::UnsupportedUrl,
        format!("unsupported repository URL: {input}"),
    )
    .with_details(serde_json::json!({ "acceptedFormats": ACCEPTED_URL_FORMS }))
}

/// What a scan runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Target {
    Url(String),
    Repository(RepoUrl),
}

impl Target {
    /// Build a target from caller input, validating repository URLs up
    /// front so malformed input never becomes a scan failure.
    pub fn parse(kind: &str, value: &str) -> ScanResult<Self> {
        match kind {
            "url" => Self::url(value),
            "repository" => Ok(Target::Repository(RepoUrl::parse(value)?)),
            other => Err(ScanError::new(
                ErrorCode::InvalidUrl,
                format!("unknown target kind: {other}"),
            )),
        }
    }

    pub fn url(value: &str) -> ScanResult<Self> {
        let trimmed = value.trim();
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(ScanError::new(
                ErrorCode::InvalidUrl,
                format!("not an absolute HTTP(S) URL: {trimmed}"),
            ));
        }
        Ok(Target::Url(trimmed.to_string()))
    }

    /// Guess the target kind from a bare string: anything that parses as a
    /// repository URL is a repository, anything else absolute is a URL.
    pub fn infer(value: &str) -> ScanResult<Self> {
        match RepoUrl::parse(value) {
            Ok(repo) => Ok(Target::Repository(repo)),
            Err(_) => Self::url(value),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Target::Url(url) => url.clone(),
            Target::Repository(repo) => repo.clone_url.clone(),
        }
    }

    /// Host component used as the rate-limiter key for URL targets.
    pub fn limiter_key(&self) -> String {
        match self {
            Target::Url(url) => host_of(url).unwrap_or_else(|| url.clone()),
            Target::Repository(repo) => repo.clone_url.clone(),
        }
    }
}

/// Extract the host portion of an absolute URL without a full URL parser.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    // Drop userinfo and port.
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_with_whitespace_and_git_suffix() {
        let repo = RepoUrl::parse(" https://github.com/Owner/My-Repo.git/ ").unwrap();
        assert_eq!(repo.platform, Platform::Github);
        assert_eq!(repo.owner, "Owner");
        assert_eq!(repo.repo, "My-Repo");
        assert_eq!(repo.clone_url, "https://github.com/Owner/My-Repo.git");
    }

    #[test]
    fn parses_all_accepted_forms_to_same_canonical_url() {
        let forms = [
            "https://github.com/rust-lang/cargo",
            "https://github.com/rust-lang/cargo.git",
            "https://github.com/rust-lang/cargo/",
            "https://www.github.com/rust-lang/cargo",
            "git@github.com:rust-lang/cargo.git",
            "git@github.com:rust-lang/cargo",
        ];
        for form in forms {
            let repo = RepoUrl::parse(form).unwrap();
            assert_eq!(
                repo.clone_url, "https://github.com/rust-lang/cargo.git",
                "form: {form}"
            );
        }
    }

    #[test]
    fn canonical_url_reparses_identically() {
        let repo = RepoUrl::parse("git@gitlab.com:group/project.git").unwrap();
        let reparsed = RepoUrl::parse(&repo.clone_url).unwrap();
        assert_eq!(repo, reparsed);
    }

    #[test]
    fn rejects_other_hosts() {
        let err = RepoUrl::parse("https://bitbucket.org/a/b").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedUrl);
        assert!(err.details["acceptedFormats"].is_array());
    }

    #[test]
    fn rejects_non_urls() {
        assert_eq!(
            RepoUrl::parse("not a url").unwrap_err().code,
            ErrorCode::UnsupportedUrl
        );
        assert_eq!(RepoUrl::parse("   ").unwrap_err().code, ErrorCode::InvalidUrl);
    }

    #[test]
    fn rejects_extra_path_segments() {
        let err = RepoUrl::parse("https://github.com/owner/repo/tree/main").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedUrl);
    }

    #[test]
    fn url_target_requires_absolute_url() {
        assert!(Target::url("https://example.com/app").is_ok());
        assert_eq!(
            Target::url("example.com").unwrap_err().code,
            ErrorCode::InvalidUrl
        );
    }

    #[test]
    fn infer_prefers_repository() {
        match Target::infer("https://github.com/a/b").unwrap() {
            Target::Repository(repo) => assert_eq!(repo.owner, "a"),
            other => panic!("expected repository target, got {other:?}"),
        }
        match Target::infer("https://example.com/x").unwrap() {
            Target::Url(url) => assert_eq!(url, "https://example.com/x"),
            other => panic!("expected url target, got {other:?}"),
        }
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://Example.com/a/b"), Some("example.com".into()));
        assert_eq!(
            host_of("https://user:pw@example.com:8443/x"),
            Some("example.com".into())
        );
        assert_eq!(host_of("ftp://example.com"), None);
    }
}

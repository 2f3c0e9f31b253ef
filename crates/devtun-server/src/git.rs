//! Git repository sources: parsing `repo@ref` strings and cloning them.

use devtun_core::{ResultExt, TunnelError, TunnelResult};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const COMMIT_DELIMITER: &str = "@sha256:";
const SUBPATH_DELIMITER: &str = "@subpath:";
const KNOWN_PREFIXES: [&str; 5] = ["ssh://", "git@", "http://", "https://", "file://"];

/// A repository plus the revision and subdirectory to materialize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitSource {
    pub repository: String,
    pub branch: String,
    pub commit: String,
    /// `pull/<n>/head`
    pub pr: String,
    pub subpath: String,
}

fn is_ref_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '-' | '_')
}

/// True when `repo` has a host followed by at least one path segment.
fn looks_like_repository(repo: &str) -> bool {
    let rest = repo.split_once("://").map_or(repo, |(_, rest)| rest);
    let rest = rest.trim_start_matches('/');
    let rest = rest.split_once('@').map_or(rest, |(_, host)| host);
    match rest.find([':', '/']) {
        Some(idx) => idx > 0 && rest.len() > idx + 1,
        None => false,
    }
}

/// Split `s` at the last occurrence of `delimiter` when what follows is
/// non-empty and satisfies `valid`.
fn split_suffix<'a>(
    s: &'a str,
    delimiter: &str,
    valid: impl Fn(&str) -> bool,
) -> Option<(&'a str, &'a str)> {
    let idx = s.rfind(delimiter)?;
    let (repo, suffix) = (&s[..idx], &s[idx + delimiter.len()..]);
    (!suffix.is_empty() && valid(suffix) && looks_like_repository(repo)).then_some((repo, suffix))
}

fn pr_number(reference: &str) -> Option<&str> {
    let n = reference.strip_prefix("pull/")?.strip_suffix("/head")?;
    (!n.is_empty() && n.chars().all(|c| c.is_ascii_digit())).then_some(n)
}

impl GitSource {
    /// Normalize a source string such as `github.com/org/repo.git@main`.
    ///
    /// Repositories without a known scheme get `https://`. A pull-request
    /// reference excludes every other suffix; otherwise `@subpath:` is
    /// resolved first, then `@branch`, then `@sha256:commit`.
    pub fn parse(source: &str) -> Self {
        let mut repo = if KNOWN_PREFIXES.iter().any(|p| source.starts_with(p)) {
            source.to_string()
        } else {
            format!("https://{source}")
        };
        let mut out = GitSource::default();

        if let Some((base, reference)) = split_suffix(&repo, "@", |r| pr_number(r).is_some()) {
            out.pr = reference.to_string();
            out.repository = base.to_string();
            return out;
        }

        if let Some((base, subpath)) =
            split_suffix(&repo, SUBPATH_DELIMITER, |s| s.chars().all(is_ref_char))
        {
            out.subpath = subpath.trim_end_matches('/').to_string();
            repo = base.to_string();
        }

        if let Some((base, branch)) = split_suffix(&repo, "@", |s| s.chars().all(is_ref_char)) {
            out.branch = branch.to_string();
            repo = base.to_string();
        }

        if let Some((base, commit)) = split_suffix(&repo, COMMIT_DELIMITER, |s| {
            s.chars().all(|c| c.is_ascii_alphanumeric())
        }) {
            out.commit = commit.to_string();
            repo = base.to_string();
        }

        out.repository = repo;
        out
    }

    /// Local branch name a pull request is fetched into, e.g. `PR996`.
    pub fn pr_branch(&self) -> Option<String> {
        pr_number(&self.pr).map(|n| format!("PR{n}"))
    }

    /// Host and path of the repository URL, for matching credential requests.
    pub fn host_and_path(&self) -> Option<(String, String)> {
        let rest = self
            .repository
            .split_once("://")
            .map_or(self.repository.as_str(), |(_, rest)| rest);
        let rest = rest.split_once('@').map_or(rest, |(_, host)| host);
        let idx = rest.find([':', '/'])?;
        let (host, path) = (&rest[..idx], &rest[idx + 1..]);
        // drop a port, keep the path
        let path = if rest[idx..].starts_with(':') {
            path.split_once('/')
                .filter(|(p, _)| p.chars().all(|c| c.is_ascii_digit()))
                .map_or(path, |(_, p)| p)
        } else {
            path
        };
        Some((host.to_string(), path.trim_start_matches('/').to_string()))
    }

    /// Clone into `target`, then check out the PR or commit.
    pub async fn clone_into(&self, target: &Path) -> TunnelResult<()> {
        let mut args = vec!["clone".to_string()];
        if !self.branch.is_empty() {
            args.push("--branch".into());
            args.push(self.branch.clone());
        }
        args.push(self.repository.clone());
        args.push(target.to_string_lossy().into_owned());
        git(None, &args).await.context("clone repository")?;

        if let Some(pr_branch) = self.pr_branch() {
            debug!(pr = %self.pr, "fetching pull request");
            git(
                Some(target),
                &["fetch".into(), "origin".into(), format!("{}:{pr_branch}", self.pr)],
            )
            .await
            .context("fetch pull request reference")?;
            git(Some(target), &["switch".into(), pr_branch])
                .await
                .context("switch to branch")?;
            return Ok(());
        }

        if !self.commit.is_empty() {
            git(
                Some(target),
                &["reset".into(), "--hard".into(), self.commit.clone()],
            )
            .await
            .context("reset head to commit")?;
        }
        Ok(())
    }
}

async fn git(dir: Option<&Path>, args: &[String]) -> TunnelResult<()> {
    debug!(?args, "running git");
    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let output = cmd.output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(TunnelError::Transport(format!(
            "git {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(input: &str) -> (String, String, String, String, String) {
        let s = GitSource::parse(input);
        (s.repository, s.pr, s.branch, s.commit, s.subpath)
    }

    fn repo(r: &str) -> (String, String, String, String, String) {
        (r.into(), String::new(), String::new(), String::new(), String::new())
    }

    #[test]
    fn plain_repositories() {
        for r in [
            "ssh://github.com/loft-sh/devpod.git",
            "ssh://git@github.com/loft-sh/devpod.git",
            "git@github.com/loft-sh/devpod-without-branch.git",
            "https://github.com/loft-sh/devpod.git",
        ] {
            assert_eq!(parsed(r), repo(r));
        }
        assert_eq!(
            parsed("github.com/loft-sh/devpod.git"),
            repo("https://github.com/loft-sh/devpod.git")
        );
    }

    #[test]
    fn branches() {
        let s = GitSource::parse("github.com/loft-sh/devpod.git@test-branch");
        assert_eq!(s.repository, "https://github.com/loft-sh/devpod.git");
        assert_eq!(s.branch, "test-branch");

        let s = GitSource::parse("ssh://git@github.com/loft-sh/devpod.git@test_branch");
        assert_eq!(s.repository, "ssh://git@github.com/loft-sh/devpod.git");
        assert_eq!(s.branch, "test_branch");

        let s = GitSource::parse("git@github.com/loft-sh/devpod-with-slash.git@user/branch");
        assert_eq!(s.repository, "git@github.com/loft-sh/devpod-with-slash.git");
        assert_eq!(s.branch, "user/branch");
    }

    #[test]
    fn commits_prs_and_subpaths() {
        let s = GitSource::parse("git@github.com:loft-sh/devpod.git@sha256:905ffb0");
        assert_eq!(s.repository, "git@github.com:loft-sh/devpod.git");
        assert_eq!(s.commit, "905ffb0");
        assert!(s.branch.is_empty());

        let s = GitSource::parse("github.com/loft-sh/devpod.git@pull/996/head");
        assert_eq!(s.repository, "https://github.com/loft-sh/devpod.git");
        assert_eq!(s.pr, "pull/996/head");
        assert_eq!(s.pr_branch().as_deref(), Some("PR996"));

        let s = GitSource::parse("github.com/loft-sh/devpod.git@subpath:/test/path/");
        assert_eq!(s.repository, "https://github.com/loft-sh/devpod.git");
        assert_eq!(s.subpath, "/test/path");
    }

    #[test]
    fn host_and_path() {
        let s = GitSource::parse("github.com/loft-sh/devpod.git");
        assert_eq!(
            s.host_and_path(),
            Some(("github.com".into(), "loft-sh/devpod.git".into()))
        );
        let s = GitSource::parse("git@github.com:loft-sh/devpod.git");
        assert_eq!(
            s.host_and_path(),
            Some(("github.com".into(), "loft-sh/devpod.git".into()))
        );
        let s = GitSource::parse("https://git.example.com:8443/team/app.git");
        assert_eq!(
            s.host_and_path(),
            Some(("git.example.com".into(), "team/app.git".into()))
        );
    }
}

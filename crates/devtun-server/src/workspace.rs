//! The workspace a host-side server is bound to, and the mounts it may serve.

use crate::archive::{self, IgnoreRules};
use crate::git::GitSource;
use devtun_core::{ChunkStream, TunnelError, TunnelResult};
use futures::StreamExt;
use std::fmt;
use std::path::PathBuf;
use tracing::info;

/// Where the workspace content comes from.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub local_folder: Option<PathBuf>,
    pub git: Option<GitSource>,
}

impl Workspace {
    pub fn local(folder: impl Into<PathBuf>) -> Self {
        Self {
            local_folder: Some(folder.into()),
            git: None,
        }
    }

    pub fn git(source: GitSource) -> Self {
        Self {
            local_folder: None,
            git: Some(source),
        }
    }

    /// Ignore rules from the local folder, if there is one.
    pub fn ignore_rules(&self) -> IgnoreRules {
        self.local_folder
            .as_deref()
            .map(IgnoreRules::load)
            .unwrap_or_default()
    }

    /// Archive the local folder.
    pub fn stream_local(&self) -> TunnelResult<ChunkStream> {
        let folder = self
            .local_folder
            .clone()
            .ok_or_else(|| TunnelError::Unavailable("workspace has no local folder".into()))?;
        Ok(archive::archive_dir(folder, self.ignore_rules()))
    }

    /// Clone the repository into a temporary directory and archive it.
    /// The directory lives until the returned stream is dropped.
    pub async fn stream_git_clone(&self) -> TunnelResult<ChunkStream> {
        let source = self
            .git
            .as_ref()
            .ok_or_else(|| TunnelError::Unavailable("workspace has no git repository".into()))?;

        let dir = tempfile::tempdir()?;
        info!(repository = %source.repository, "cloning repository");
        source.clone_into(dir.path()).await?;

        let mut root = dir.path().to_path_buf();
        let subpath = source.subpath.trim_start_matches('/');
        if !subpath.is_empty() {
            root = root.join(subpath);
        }
        let rules = IgnoreRules::load(&root);
        Ok(archive::archive_dir(root, rules)
            .map(move |chunk| {
                let _clone_dir = &dir;
                chunk
            })
            .boxed())
    }
}

/// A bind mount as `type=…,src=…,dst=…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: String,
    pub source: String,
    pub target: String,
}

impl Mount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: "bind".into(),
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if !self.kind.is_empty() {
            parts.push(format!("type={}", self.kind));
        }
        if !self.source.is_empty() {
            parts.push(format!("src={}", self.source));
        }
        if !self.target.is_empty() {
            parts.push(format!("dst={}", self.target));
        }
        f.write_str(&parts.join(","))
    }
}

//! Credential lookups on the machine that owns the secrets.
//!
//! [`LocalCredentialBroker`] shells out to the docker credential helpers and
//! to `git`, the same programs the docker and git CLIs would use. Commit
//! signing goes through `ssh-keygen -Y sign` and `gpg --export`.

use async_trait::async_trait;
use base64::Engine as _;
use devtun_core::credentials::{
    DockerCredentialList, DockerCredentials, GitCredentials, GitSshSignatureRequest,
    GitSshSignatureResponse, GitUser,
};
use devtun_core::{Message, TunnelError, TunnelResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Which credentials a server variant may hand out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialPolicy {
    pub allow_git: bool,
    pub allow_docker: bool,
}

impl CredentialPolicy {
    pub fn new(allow_git: bool, allow_docker: bool) -> Self {
        Self {
            allow_git,
            allow_docker,
        }
    }

    pub fn check_docker(&self) -> TunnelResult<()> {
        if self.allow_docker {
            Ok(())
        } else {
            Err(TunnelError::PermissionDenied("docker credentials forbidden".into()))
        }
    }

    pub fn check_git(&self) -> TunnelResult<()> {
        if self.allow_git {
            Ok(())
        } else {
            Err(TunnelError::PermissionDenied("git credentials forbidden".into()))
        }
    }
}

/// Fixed git credentials that answer every request without asking a helper.
#[derive(Debug, Clone, Default)]
pub struct GitOverride {
    pub username: String,
    pub token: String,
}

impl GitOverride {
    /// `None` unless a token is configured.
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        (!token.is_empty()).then(|| Self {
            username: username.into(),
            token,
        })
    }

    /// Fill the request's username and password from the override.
    pub fn answer(&self, request: &Message) -> TunnelResult<Message> {
        let mut creds: GitCredentials = request
            .decode()
            .map_err(|e| e.context("decode git credentials request"))?;
        creds.username = self.username.clone();
        creds.password = self.token.clone();
        Message::encode(&creds)
    }
}

/// Source of docker and git credentials for the credential RPCs.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn docker_credentials(&self, server_url: &str) -> TunnelResult<DockerCredentials>;

    async fn docker_credential_list(&self) -> TunnelResult<DockerCredentialList>;

    async fn git_credentials(&self, request: &GitCredentials) -> TunnelResult<GitCredentials>;

    async fn git_user(&self) -> TunnelResult<GitUser>;

    /// Armored SSH signature over `request.content`.
    async fn git_ssh_signature(&self, _request: &GitSshSignatureRequest) -> TunnelResult<String> {
        Err(TunnelError::Unavailable("ssh signing not available".into()))
    }

    /// ASCII-armored GPG public keys.
    async fn gpg_public_keys(&self) -> TunnelResult<String> {
        Err(TunnelError::Unavailable("gpg keys not available".into()))
    }
}

/// Wrap an armored signature in its wire response.
pub(crate) fn signature_message(armored: &str) -> TunnelResult<Message> {
    Message::encode(&GitSshSignatureResponse {
        signature: base64::engine::general_purpose::STANDARD.encode(armored),
    })
}

/// Armored public keys as a base64 message.
pub(crate) fn gpg_keys_message(armored: &str) -> Message {
    Message::new(base64::engine::general_purpose::STANDARD.encode(armored))
}

/// Broker backed by the local docker config and git installation.
#[derive(Debug, Clone)]
pub struct LocalCredentialBroker {
    docker_config: PathBuf,
}

impl Default for LocalCredentialBroker {
    fn default() -> Self {
        let docker_config = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".docker")))
            .unwrap_or_else(|| PathBuf::from(".docker"))
            .join("config.json");
        Self { docker_config }
    }
}

impl LocalCredentialBroker {
    pub fn with_docker_config(path: impl Into<PathBuf>) -> Self {
        Self {
            docker_config: path.into(),
        }
    }

    async fn docker_config(&self) -> TunnelResult<serde_json::Value> {
        match tokio::fs::read(&self.docker_config).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::json!({})),
            Err(e) => Err(e.into()),
        }
    }
}

/// Which credential helper serves `server_url`, if any.
fn helper_for(config: &serde_json::Value, server_url: &str) -> Option<String> {
    config["credHelpers"][server_url]
        .as_str()
        .or_else(|| config["credsStore"].as_str())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

/// Credentials stored inline under `auths` as base64 `user:password`.
fn inline_auth(config: &serde_json::Value, server_url: &str) -> Option<DockerCredentials> {
    let encoded = config["auths"][server_url]["auth"].as_str()?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some(DockerCredentials {
        server_url: server_url.to_string(),
        username: username.to_string(),
        password: password.to_string(),
        ..Default::default()
    })
}

/// Run a helper program, feeding `input` on stdin, and return its stdout.
async fn run_helper(program: &str, args: &[&str], input: Option<&str>) -> TunnelResult<String> {
    debug!(program, ?args, "running credential helper");
    let mut child = Command::new(program)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(input) = input {
            stdin.write_all(input.as_bytes()).await?;
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TunnelError::Transport(format!(
            "{program} {}: {} {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl CredentialBroker for LocalCredentialBroker {
    async fn docker_credentials(&self, server_url: &str) -> TunnelResult<DockerCredentials> {
        let config = self.docker_config().await?;
        if let Some(helper) = helper_for(&config, server_url) {
            let out = run_helper(
                &format!("docker-credential-{helper}"),
                &["get"],
                Some(server_url),
            )
            .await?;
            let mut creds: DockerCredentials = serde_json::from_str(&out)?;
            if creds.server_url.is_empty() {
                creds.server_url = server_url.to_string();
            }
            return Ok(creds);
        }

        inline_auth(&config, server_url).ok_or_else(|| {
            TunnelError::Unavailable(format!("no docker credentials for {server_url}"))
        })
    }

    async fn docker_credential_list(&self) -> TunnelResult<DockerCredentialList> {
        let config = self.docker_config().await?;
        let mut list = DockerCredentialList::default();

        if let Some(store) = config["credsStore"].as_str().filter(|s| !s.is_empty()) {
            let out = run_helper(&format!("docker-credential-{store}"), &["list"], None).await?;
            let servers: BTreeMap<String, String> = serde_json::from_str(&out)?;
            for server_url in servers.keys() {
                match self.docker_credentials(server_url).await {
                    Ok(creds) => list.registries.push(creds),
                    Err(e) => debug!(server_url = %server_url, error = %e, "skipping registry"),
                }
            }
        }

        if let Some(auths) = config["auths"].as_object() {
            for server_url in auths.keys() {
                if list.registries.iter().any(|r| &r.server_url == server_url) {
                    continue;
                }
                if let Some(creds) = inline_auth(&config, server_url) {
                    list.registries.push(creds);
                }
            }
        }
        Ok(list)
    }

    async fn git_credentials(&self, request: &GitCredentials) -> TunnelResult<GitCredentials> {
        let input = format!("{}\n", request.to_helper_input());
        let out = run_helper("git", &["credential", "fill"], Some(&input)).await?;
        Ok(GitCredentials::from_helper_output(&out))
    }

    async fn git_user(&self) -> TunnelResult<GitUser> {
        // unset keys make git exit non-zero; treat them as empty
        let name = run_helper("git", &["config", "--global", "user.name"], None)
            .await
            .unwrap_or_default();
        let email = run_helper("git", &["config", "--global", "user.email"], None)
            .await
            .unwrap_or_default();
        Ok(GitUser {
            name: name.trim().to_string(),
            email: email.trim().to_string(),
        })
    }

    async fn git_ssh_signature(&self, request: &GitSshSignatureRequest) -> TunnelResult<String> {
        if request.key_path.is_empty() {
            return Err(TunnelError::Protocol("missing signing key path".into()));
        }
        // no file argument: sign stdin, write the signature to stdout
        run_helper(
            "ssh-keygen",
            &["-Y", "sign", "-f", &request.key_path, "-n", "git"],
            Some(&request.content),
        )
        .await
    }

    async fn gpg_public_keys(&self) -> TunnelResult<String> {
        run_helper("gpg", &["--armor", "--export"], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_selection_prefers_specific_helper() {
        let config = serde_json::json!({
            "credsStore": "desktop",
            "credHelpers": { "gcr.io": "gcloud" }
        });
        assert_eq!(helper_for(&config, "gcr.io").as_deref(), Some("gcloud"));
        assert_eq!(helper_for(&config, "docker.io").as_deref(), Some("desktop"));
        assert_eq!(helper_for(&serde_json::json!({}), "docker.io"), None);
    }

    #[test]
    fn inline_auth_is_decoded() {
        // "u:p:x" -> password may contain colons
        let config = serde_json::json!({
            "auths": { "registry.example.com": { "auth": "dTpwOng=" } }
        });
        let creds = inline_auth(&config, "registry.example.com").unwrap();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p:x");
        assert!(inline_auth(&config, "other.example.com").is_none());
    }

    #[test]
    fn policy_denials_name_the_credential() {
        let policy = CredentialPolicy::new(false, true);
        assert!(policy.check_docker().is_ok());
        let err = policy.check_git().unwrap_err();
        assert_eq!(err.to_string(), "git credentials forbidden");
        assert_eq!(err.code(), devtun_core::Code::PermissionDenied);
        assert_eq!(
            CredentialPolicy::default().check_docker().unwrap_err().to_string(),
            "docker credentials forbidden"
        );
    }

    #[test]
    fn git_override_answers_from_token() {
        assert!(GitOverride::new("me", "").is_none());
        let over = GitOverride::new("me", "secret").unwrap();
        let req = Message::new(r#"{"protocol":"https","host":"github.com"}"#);
        let creds: GitCredentials = over.answer(&req).unwrap().decode().unwrap();
        assert_eq!(creds.host, "github.com");
        assert_eq!(creds.username, "me");
        assert_eq!(creds.password, "secret");

        let err = over.answer(&Message::new("not json")).unwrap_err();
        assert!(err.to_string().starts_with("decode git credentials request: "));
    }

    #[tokio::test]
    async fn signing_needs_a_key_path() {
        let broker = LocalCredentialBroker::default();
        let err = broker
            .git_ssh_signature(&GitSshSignatureRequest {
                content: "tree abc\n".into(),
                key_path: String::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), devtun_core::Code::Protocol);
    }

    #[test]
    fn signature_is_base64_on_the_wire() {
        let msg = signature_message("-----BEGIN SSH SIGNATURE-----").unwrap();
        let resp: GitSshSignatureResponse = msg.decode().unwrap();
        assert_eq!(resp.signature, "LS0tLS1CRUdJTiBTU0ggU0lHTkFUVVJFLS0tLS0=");
        assert_eq!(gpg_keys_message("k").message, "aw==");
    }

    #[tokio::test]
    async fn missing_docker_config_means_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LocalCredentialBroker::with_docker_config(dir.path().join("config.json"));
        let err = broker.docker_credentials("registry.example.com").await.unwrap_err();
        assert_eq!(err.code(), devtun_core::Code::Unavailable);
        let list = broker.docker_credential_list().await.unwrap();
        assert!(list.registries.is_empty());
    }
}

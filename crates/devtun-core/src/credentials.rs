//! JSON payloads brokered through the credential calls.

use serde::{Deserialize, Serialize};

/// Docker credential lookup. An empty `server_url` asks for the full list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerCredentialsRequest {
    #[serde(rename = "serverURL", default)]
    pub server_url: String,
}

/// One credential set, in the docker credential-helper shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerCredentials {
    #[serde(rename = "ServerURL", default, skip_serializing_if = "String::is_empty")]
    pub server_url: String,
    #[serde(rename = "Username", default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(rename = "Password", default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(rename = "Secret", default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerCredentialList {
    #[serde(rename = "Registries", default)]
    pub registries: Vec<DockerCredentials>,
}

/// Git credential-helper request/response. Empty fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitCredentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl GitCredentials {
    /// Render in git's credential-helper `key=value` format.
    pub fn to_helper_input(&self) -> String {
        let mut out = String::new();
        for (key, value) in [
            ("protocol", &self.protocol),
            ("url", &self.url),
            ("host", &self.host),
            ("path", &self.path),
            ("username", &self.username),
            ("password", &self.password),
        ] {
            if !value.is_empty() {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }
        out
    }

    /// Parse git's credential-helper output. Unknown keys are ignored.
    pub fn from_helper_output(text: &str) -> Self {
        let mut creds = GitCredentials::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.to_string();
            match key {
                "protocol" => creds.protocol = value,
                "url" => creds.url = value,
                "host" => creds.host = value,
                "path" => creds.path = value,
                "username" => creds.username = value,
                "password" => creds.password = value,
                _ => {}
            }
        }
        creds
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Sign `content` with the private key at `key_path`, as git's
/// `gpg.ssh.program` would.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitSshSignatureRequest {
    #[serde(rename = "Content", default)]
    pub content: String,
    #[serde(rename = "KeyPath", default)]
    pub key_path: String,
}

/// The armored signature, base64 encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitSshSignatureResponse {
    #[serde(rename = "Signature", default)]
    pub signature: String,
}

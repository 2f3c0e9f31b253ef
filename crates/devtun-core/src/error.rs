use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the tunnel layers.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Credential policy refused the call. The message is the full reason.
    #[error("{0}")]
    PermissionDenied(String),

    /// Capability not configured on this end (e.g. no forwarder).
    #[error("{0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// An error reported by the peer over the wire.
    #[error("{message}")]
    Remote { code: Code, message: String },

    /// A labelled wrapper, used to mark which hop or operation failed.
    #[error("{label}: {source}")]
    Context {
        label: String,
        #[source]
        source: Box<TunnelError>,
    },
}

impl TunnelError {
    /// Wrap this error with a label.
    pub fn context(self, label: impl Into<String>) -> Self {
        TunnelError::Context {
            label: label.into(),
            source: Box::new(self),
        }
    }

    /// The deepest wrapped error.
    pub fn root(&self) -> &TunnelError {
        match self {
            TunnelError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Taxonomy class of the underlying error.
    pub fn code(&self) -> Code {
        match self.root() {
            TunnelError::PermissionDenied(_) => Code::PermissionDenied,
            TunnelError::Unavailable(_) => Code::Unavailable,
            TunnelError::Transport(_) | TunnelError::Io(_) => Code::Transport,
            TunnelError::Protocol(_) | TunnelError::Codec(_) => Code::Protocol,
            TunnelError::Cancelled => Code::Cancelled,
            TunnelError::Unimplemented(_) => Code::Unimplemented,
            TunnelError::Remote { code, .. } => *code,
            TunnelError::Join(_) | TunnelError::Context { .. } => Code::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.code() == Code::Cancelled
    }
}

impl From<ciborium::de::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<ciborium::value::Error> for TunnelError {
    fn from(e: ciborium::value::Error) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        TunnelError::Protocol(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

/// Adds `.context(label)` to results carrying a [`TunnelError`].
pub trait ResultExt<T> {
    fn context(self, label: impl Into<String>) -> TunnelResult<T>;
}

impl<T, E: Into<TunnelError>> ResultExt<T> for Result<T, E> {
    fn context(self, label: impl Into<String>) -> TunnelResult<T> {
        self.map_err(|e| e.into().context(label))
    }
}

/// Error class carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    PermissionDenied,
    Unavailable,
    Transport,
    Protocol,
    Cancelled,
    Unimplemented,
    Internal,
}

/// Wire form of a failed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl From<&TunnelError> for Status {
    fn from(e: &TunnelError) -> Self {
        Status {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<Status> for TunnelError {
    fn from(status: Status) -> Self {
        TunnelError::Remote {
            code: status.code,
            message: status.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_root_code() {
        let err = TunnelError::PermissionDenied("git credentials forbidden".into())
            .context("run agent command")
            .context("tunnel to container");
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(
            err.to_string(),
            "tunnel to container: run agent command: git credentials forbidden"
        );
        assert!(matches!(err.root(), TunnelError::PermissionDenied(_)));
    }

    #[test]
    fn status_round_trip_keeps_message() {
        let err = TunnelError::PermissionDenied("docker credentials forbidden".into());
        let remote: TunnelError = Status::from(&err).into();
        assert_eq!(remote.code(), Code::PermissionDenied);
        assert_eq!(remote.to_string(), "docker credentials forbidden");
    }

    #[test]
    fn io_errors_are_transport() {
        let err: TunnelError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.code(), Code::Transport);
    }

    #[test]
    fn result_ext_wraps() {
        let res: Result<(), std::io::Error> =
            Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        let err = res.context("create ssh client").unwrap_err();
        assert!(err.to_string().starts_with("create ssh client: io error"));
    }
}

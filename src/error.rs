use thiserror::Error;

use crate::protocol::DecodeError;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to dial connector socket {path}: {source}")]
    Dial {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("mount helper exited with code {code}")]
    MountFailed { code: i32 },

    #[error("connection closed before the mount helper terminated")]
    ConnectionClosed,

    #[error("cannot find command {name}: {source}")]
    MissingHelper {
        name: String,
        source: which::Error,
    },

    #[error(transparent)]
    Param(#[from] crate::params::ParamError),

    #[error(transparent)]
    Api(#[from] crate::api::ApiError),
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

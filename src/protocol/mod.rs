//! Wire protocol between the CSI plugin and the connector daemon.
//!
//! Every message is a single JSON envelope per line:
//! `{"version":"v2","cmd":"<name>","payload":{...}}`. The payload shape
//! is dispatched on the `cmd` tag; the version string is matched
//! exactly and any mismatch terminates the connection.

pub mod builders;
pub mod commands;

pub use builders::{filesystem_mount_args, object_store_mount_args, MountContext};
pub use commands::{
    Command, InitFilesystemMount, InitObjectStoreMount, RequestData, ResponseData, Terminate,
    Umount,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version carried in every envelope.
pub const VERSION: &str = "v2";

pub const INIT_OBJECT_STORE_MOUNT: &str = "init_stratus_mount";
pub const INIT_FILESYSTEM_MOUNT: &str = "init_stratofs_mount";
pub const UMOUNT: &str = "umount_stratus";
pub const REQUEST_DATA: &str = "request_data";
pub const RESPONSE_DATA: &str = "response_data";
pub const TERMINATE: &str = "terminate";

#[derive(Serialize, Deserialize, Debug)]
pub struct Envelope {
    pub version: String,
    pub cmd: String,
    pub payload: serde_json::Value,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unrecognized protocol version: {0}")]
    VersionMismatch(String),

    #[error("unrecognized request cmd: {0}")]
    UnknownCommand(String),

    #[error("{cmd} payload parse error: {source}")]
    Payload {
        cmd: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialize a command into a single envelope line (no trailing newline).
pub fn encode(command: &Command) -> Result<String, serde_json::Error> {
    let envelope = Envelope {
        version: VERSION.to_string(),
        cmd: command.name().to_string(),
        payload: command.payload()?,
    };
    serde_json::to_string(&envelope)
}

/// Parse one envelope line back into a command.
pub fn decode(line: &str) -> Result<Command, DecodeError> {
    let envelope: Envelope = serde_json::from_str(line).map_err(DecodeError::Malformed)?;
    if envelope.version != VERSION {
        return Err(DecodeError::VersionMismatch(envelope.version));
    }

    let payload = |source| DecodeError::Payload {
        cmd: envelope.cmd.clone(),
        source,
    };
    match envelope.cmd.as_str() {
        INIT_FILESYSTEM_MOUNT => serde_json::from_value(envelope.payload)
            .map(Command::InitFilesystemMount)
            .map_err(payload),
        INIT_OBJECT_STORE_MOUNT => serde_json::from_value(envelope.payload)
            .map(|cmd| Command::InitObjectStoreMount(Box::new(cmd)))
            .map_err(payload),
        UMOUNT => serde_json::from_value(envelope.payload)
            .map(Command::Umount)
            .map_err(payload),
        REQUEST_DATA => serde_json::from_value(envelope.payload)
            .map(Command::RequestData)
            .map_err(payload),
        RESPONSE_DATA => serde_json::from_value(envelope.payload)
            .map(Command::ResponseData)
            .map_err(payload),
        TERMINATE => serde_json::from_value(envelope.payload)
            .map(Command::Terminate)
            .map_err(payload),
        other => Err(DecodeError::UnknownCommand(other.to_string())),
    }
}

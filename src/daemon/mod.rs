//! Connector daemon and its client.
//!
//! The daemon listens on a Unix socket; each connection carries exactly
//! one mount conversation. The [`client`] side lives in the node plugin
//! process and speaks the same line protocol.

pub mod client;
pub mod connection;
pub mod paths;
pub mod server;
pub mod supervisor;

pub use client::{ConnectorClient, FilesystemCredentials};
pub use paths::RuntimeDirs;
pub use server::{DaemonConfig, DaemonServer};

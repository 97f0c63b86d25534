use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stratus-csi-connector")]
#[command(version)]
#[command(about = "Mount connector daemon for the Stratus CSI driver", long_about = None)]
pub(crate) struct Cli {
    /// Log filter (e.g. info, stratus_csi=debug). Can also be set via
    /// RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the connector daemon
    Run {
        /// Unix socket to listen on (default: $STRATUS_CSI_SOCKET or
        /// the well-known path)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Override the object store mount helper command
        #[arg(long)]
        object_store_cmd: Option<String>,

        /// Override the filesystem mount helper command
        #[arg(long)]
        filesystem_cmd: Option<String>,
    },

    /// Verify that the mount helpers are installed and resolvable
    Check,
}

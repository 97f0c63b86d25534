mod args;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stratus_csi::daemon::{DaemonConfig, DaemonServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let filter = match cli.log_level.as_deref() {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            socket,
            object_store_cmd,
            filesystem_cmd,
        } => {
            let mut config = DaemonConfig::default();
            if let Some(socket) = socket {
                config.socket_path = socket;
            }
            if let Some(cmd) = object_store_cmd {
                config.object_store_cmd = cmd;
            }
            if let Some(cmd) = filesystem_cmd {
                config.filesystem_cmd = cmd;
            }
            DaemonServer::new(config).await?.run().await?;
        }
        Commands::Check => {
            let config = DaemonConfig::default();
            config.dirs.ensure_exist().await?;
            // A failed resolution surfaces as the error, same as at
            // daemon startup.
            DaemonServer::new(config).await?;
            println!("all mount helpers resolved");
        }
    }

    Ok(())
}

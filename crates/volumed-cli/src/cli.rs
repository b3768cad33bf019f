use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "volumed", about = "Block volume lifecycle daemon and client", version)]
pub struct Cli {
    /// Talk to a remote daemon instead of the default local one.
    #[arg(long, env = "VOLUMED_URL", global = true)]
    pub remote: Option<String>,

    /// Bearer token for the daemon's HTTP API.
    #[arg(long, env = "VOLUMED_TOKEN", global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground.
    Serve {
        /// Path to the daemon's YAML configuration file.
        #[arg(long, default_value = "volumed.yml")]
        config: PathBuf,
    },

    /// Volume lifecycle operations.
    Volume {
        #[command(subcommand)]
        command: VolumeCommand,
    },

    /// Inspect submitted operations.
    Operation {
        #[command(subcommand)]
        command: OperationCommand,
    },

    /// Aggregate counts and last reconcile time.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum VolumeCommand {
    /// Create a new cloud volume.
    Create {
        /// Size in bytes.
        size: u64,
        name: String,
        pool: String,
    },
    /// Attach a volume to a host.
    Attach { volume_id: String, host_id: String },
    /// Attach a volume as the boot disk (slot 0).
    AttachRoot { volume_id: String, host_id: String },
    /// Detach a volume from its current host.
    Detach { volume_id: String },
    /// Move a volume's attachment to a new host.
    Reattach { volume_id: String, new_host_id: String },
    /// Delete a volume. Fails while it still has an active mapping.
    Delete { volume_id: String },
    /// List current volume-to-device mappings.
    List,
}

#[derive(Debug, Subcommand)]
pub enum OperationCommand {
    /// Fetch one operation by id.
    Get { operation_id: String },
    /// List operations, optionally filtered.
    List {
        #[arg(long)]
        volume_id: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
}

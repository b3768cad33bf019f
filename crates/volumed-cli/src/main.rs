mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command, OperationCommand, VolumeCommand};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => commands::serve(config).await,
        Command::Volume { command } => match command {
            VolumeCommand::Create { size, name, pool } => commands::volume_create(size, name, pool, cli.remote, cli.token).await,
            VolumeCommand::Attach { volume_id, host_id } => commands::volume_attach(volume_id, host_id, false, cli.remote, cli.token).await,
            VolumeCommand::AttachRoot { volume_id, host_id } => commands::volume_attach(volume_id, host_id, true, cli.remote, cli.token).await,
            VolumeCommand::Detach { volume_id } => commands::volume_detach(volume_id, cli.remote, cli.token).await,
            VolumeCommand::Reattach { volume_id, new_host_id } => commands::volume_reattach(volume_id, new_host_id, cli.remote, cli.token).await,
            VolumeCommand::Delete { volume_id } => commands::volume_delete(volume_id, cli.remote, cli.token).await,
            VolumeCommand::List => commands::volume_list(cli.remote, cli.token).await,
        },
        Command::Operation { command } => match command {
            OperationCommand::Get { operation_id } => commands::operation_get(operation_id, cli.remote, cli.token).await,
            OperationCommand::List { volume_id, status } => commands::operation_list(volume_id, status, cli.remote, cli.token).await,
        },
        Command::Status => commands::status(cli.remote, cli.token).await,
    }
}

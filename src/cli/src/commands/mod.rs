//! CLI command definitions and dispatch.

mod build;
mod list;

use clap::{Parser, Subcommand};

/// pxeforge — build bootable OCI system images for network boot.
#[derive(Parser)]
#[command(name = "pxeforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a system image from a recipe file
    Build(build::BuildArgs),
    /// List tagged images in a remote repository
    List(list::ListArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::List(args) => list::execute(args).await,
    }
}

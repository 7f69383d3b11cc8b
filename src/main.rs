// Main binary for the provisioning daemon
use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::io::stderr;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;

use cmd::plugins::{run_plugins, PluginCommands};
use cmd::serve::{run_serve, ServeArgs};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mayfly phone provisioning daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the TFTP and HTTP provisioning servers
    Serve(ServeArgs),
    /// Inspect plugin packages
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // RUST_LOG wins; otherwise our crates at info (or debug) and dependencies at warn
    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "mayfly={level},mayfly_server={level},mayfly_tftp={level},mayfly_plugins={level},tower=warn,hyper=warn",
        level = level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();
    debug!("Logger initialized");

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Plugins { command } => run_plugins(command),
    }
}

//! Command-line surface for the service binary.

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "papersift",
    version,
    author,
    about = "Papersift document extraction service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP API (embeds a worker pool unless --no-worker).
    Serve(ServeArgs),
    /// Run a standalone worker pool against the shared store.
    Worker(WorkerArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Serve the API only; workers run in separate processes.
    #[arg(long)]
    pub no_worker: bool,
}

#[derive(Debug, Args)]
pub struct WorkerArgs;

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    #[test]
    fn serve_defaults_to_embedded_worker() {
        let cli = Cli::try_parse_from(["papersift", "serve"]).expect("parses");
        match cli.command {
            Some(Commands::Serve(args)) => assert!(!args.no_worker),
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn verbosity_accumulates() {
        let cli = Cli::try_parse_from(["papersift", "-vv", "worker"]).expect("parses");
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Some(Commands::Worker(_))));
    }
}

pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::breaker::BreakerAction;

#[derive(Debug, Parser)]
#[command(
    name = "pricebot",
    about = "Pricebot operator CLI",
    long_about = "Inspect and operate the shared resilience state (circuits, rate windows, \
                  conversation slots) used by every pricebot worker.",
    after_help = "Examples:\n  pricebot doctor --json\n  pricebot status\n  \
                  pricebot breaker reset pricing_api"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Validate config, chat transport and store readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Show effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Apply pending store migrations")]
    Migrate,
    #[command(about = "Show circuit, rate limit and concurrency state from the shared store")]
    Status,
    #[command(about = "Force a circuit breaker open or closed for every worker")]
    Breaker {
        #[command(subcommand)]
        action: BreakerCommand,
    },
    #[command(about = "Manage registered conversation slots")]
    Conversations {
        #[command(subcommand)]
        action: ConversationsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum BreakerCommand {
    #[command(about = "Close the circuit and zero its counters")]
    Reset { name: String },
    #[command(about = "Open the circuit now; it half-opens after its cooldown")]
    Open { name: String },
}

#[derive(Debug, Subcommand)]
enum ConversationsCommand {
    #[command(about = "Evict every registered conversation slot")]
    Cleanup,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Doctor { json } => {
            let (passed, output) = commands::doctor::run(json);
            let exit_code = if passed { 0 } else { commands::EXIT_OPERATION };
            commands::CommandResult { exit_code, output }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Migrate => commands::migrate::run(),
        Command::Status => commands::status::run(),
        Command::Breaker { action: BreakerCommand::Reset { name } } => {
            commands::breaker::run(BreakerAction::Reset, &name)
        }
        Command::Breaker { action: BreakerCommand::Open { name } } => {
            commands::breaker::run(BreakerAction::Open, &name)
        }
        Command::Conversations { action: ConversationsCommand::Cleanup } => {
            commands::conversations::cleanup()
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

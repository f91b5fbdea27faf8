use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::abuse::AbuseCommands;
use util::Target;

#[derive(Parser)]
#[command(
    name = "tees",
    version,
    about = "Tees From The Past operator CLI: probe the API and manage abuse scores"
)]
struct Cli {
    /// API base URL
    #[arg(long, env = "TEES_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Bearer token (admin role required for abuse commands)
    #[arg(long, env = "TEES_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Print HTTP status and headers (including rate limit telemetry)
    #[arg(long, short = 'i', global = true)]
    include: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Liveness probe
    Health,
    /// Readiness probe (checks the counter store)
    Readiness,
    /// Abuse score operations
    Abuse {
        #[command(subcommand)]
        command: AbuseCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let target = Target {
        api_url: cli.api_url.trim_end_matches('/'),
        token: cli.token.as_deref(),
        include: cli.include,
    };

    let code = match cli.command {
        Commands::Health => commands::health::health(&target).await,
        Commands::Readiness => commands::health::readiness(&target).await,
        Commands::Abuse { command } => commands::abuse::run(&target, command).await,
    };

    std::process::exit(code);
}

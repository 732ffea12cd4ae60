//! Treasury Trader - self-custodial Solana trading treasury
//!
//! # WARNING
//! - This engine trades with real money in live mode. Only fund it with
//!   what you can afford to lose.
//! - TP/SL is best-effort: a fast enough crash can gap through a stop.
//! - Dry-run results do NOT predict live results.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use treasury_trader::cli::commands;
use treasury_trader::config::Config;

/// Treasury Trader - risk-gated Solana swaps with automatic TP/SL
#[derive(Parser)]
#[command(name = "treasury")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Acting identity, checked against the configured admin list
    #[arg(long, env = "TREASURY_ACTOR", default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: monitor positions and fire TP/SL exits
    Start,

    /// Open a position
    Open {
        /// Token mint address
        mint: String,

        /// Token symbol for display
        #[arg(long)]
        symbol: Option<String>,

        /// Notional in USD
        #[arg(long)]
        amount_usd: Option<f64>,

        /// Notional in SOL (converted at the current SOL price)
        #[arg(long)]
        amount_sol: Option<f64>,

        /// Sentiment grade (A, B, C...); D and F are refused
        #[arg(long)]
        grade: Option<String>,

        /// Custom take-profit fraction (0.30 = +30%)
        #[arg(long)]
        tp: Option<f64>,

        /// Custom stop-loss fraction (0.10 = -10%)
        #[arg(long)]
        sl: Option<f64>,
    },

    /// Close a position by id
    Close {
        position_id: String,

        /// Free-form reason recorded in the audit log
        #[arg(long)]
        reason: Option<String>,
    },

    /// Show engine status and performance
    Status,

    /// List open positions
    Positions,

    /// Show closed-trade history
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Reconcile the book against on-chain balances
    Reconcile {
        /// Close orphaned positions automatically
        #[arg(long)]
        auto_close: bool,
    },

    /// Activate an emergency stop (soft|hard|kill)
    EmergencyStop {
        level: String,

        #[arg(long, default_value = "operator action")]
        reason: String,

        /// Unwind strategy: immediate|graceful|scheduled|manual
        #[arg(long)]
        unwind: Option<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Resume trading after a stop
    Resume {
        /// Also reset the daily-loss circuit breaker
        #[arg(long)]
        reset_breaker: bool,
    },

    /// Pause trading of one mint
    PauseToken {
        mint: String,

        #[arg(long, default_value = "operator action")]
        reason: String,
    },

    /// Resume trading of a paused mint
    ResumeToken { mint: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("treasury_trader=info".parse().unwrap()),
        )
        .with_target(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let engine = match commands::bootstrap(config).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start engine: {}", e);
            std::process::exit(1);
        }
    };

    let actor = cli.actor;
    let result = match cli.command {
        Commands::Start => commands::run(engine.clone()).await,
        Commands::Open {
            mint,
            symbol,
            amount_usd,
            amount_sol,
            grade,
            tp,
            sl,
        } => {
            commands::open(
                &engine, &actor, mint, symbol, amount_usd, amount_sol, grade, tp, sl,
            )
            .await
        }
        Commands::Close {
            position_id,
            reason,
        } => commands::close(&engine, &actor, position_id, reason).await,
        Commands::Status => commands::status(&engine).await,
        Commands::Positions => commands::positions(&engine).await,
        Commands::History { limit } => commands::history(&engine, limit).await,
        Commands::Reconcile { auto_close } => commands::reconcile(&engine, auto_close).await,
        Commands::EmergencyStop {
            level,
            reason,
            unwind,
            force,
        } => commands::emergency_stop(&engine, &actor, level, reason, unwind, force).await,
        Commands::Resume { reset_breaker } => {
            commands::resume(&engine, &actor, reset_breaker).await
        }
        Commands::PauseToken { mint, reason } => {
            commands::pause_token(&engine, &actor, mint, reason).await
        }
        Commands::ResumeToken { mint } => commands::resume_token(&engine, mint).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

//! CLI command implementations
//!
//! Each command returns a result object printed to stdout, never a bare
//! process exit. The engine is constructed once at the process root and
//! passed down; there are no hidden singletons.

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregator::JupiterAggregator;
use crate::chain::history::{TxHistoryEntry, TxHistoryLog};
use crate::chain::ChainClient;
use crate::config::Config;
use crate::engine::{OpenRequest, TradingEngine};
use crate::monitor::TpSlMonitor;
use crate::oracle::PriceOracle;
use crate::stop::{EmergencyStop, StopLevel, UnwindStrategy};
use crate::store::types::CloseReason;
use crate::store::PositionStore;
use crate::wallet::LocalWallet;

/// Build the full engine from configuration. Every component is constructed
/// here and handed down; per-profile state directories keep live and
/// simulated books apart.
pub async fn bootstrap(config: Config) -> Result<Arc<TradingEngine>> {
    if config.trading.dry_run {
        warn!("Running in DRY-RUN mode - no real trades will be executed");
    }

    let store = Arc::new(PositionStore::open(&config.store)?);
    let profile_dir = store.profile_dir().to_path_buf();

    let wallet: Arc<dyn crate::wallet::WalletSigner> =
        match LocalWallet::load(&config.wallet.keypair_path) {
            Ok(wallet) => Arc::new(wallet),
            Err(e) if config.trading.dry_run => {
                warn!("No usable keypair ({}); using a throwaway wallet for dry-run", e);
                Arc::new(LocalWallet::generate())
            }
            Err(e) => return Err(e).context("treasury keypair required in live mode"),
        };

    let oracle = Arc::new(PriceOracle::new(config.oracle.clone())?);
    let aggregator = Arc::new(JupiterAggregator::new(config.aggregator.clone())?);
    let history = TxHistoryLog::open(profile_dir.join("transaction_history.json"))?;
    let chain = Arc::new(ChainClient::new(config.rpc.clone(), history)?);
    chain.set_alert_callback(Arc::new(|entry: TxHistoryEntry| {
        tracing::error!(
            "Transaction failed: {} position={:?} error={:?}",
            entry.signature,
            entry.position_id,
            entry.error
        );
    }));

    let stop = Arc::new(EmergencyStop::open(
        profile_dir.join("emergency_stop.json"),
        config.emergency.clone(),
    )?);
    if Config::kill_switch_env() && stop.level() < StopLevel::KillSwitch {
        stop.activate_kill_switch("KILL_SWITCH environment override", "env", UnwindStrategy::Manual);
    }

    let monitor = Arc::new(TpSlMonitor::open(
        profile_dir.join("trigger_orders.json"),
        config.monitor.clone(),
    )?);

    let engine = Arc::new(TradingEngine::new(
        config, store, oracle, aggregator, chain, wallet, stop, monitor,
    ));
    engine.start().await?;
    Ok(engine)
}

/// Run the engine until interrupted: the monitor poller does the work
pub async fn run(engine: Arc<TradingEngine>) -> Result<()> {
    info!("Treasury engine running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    engine.shutdown().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn open(
    engine: &TradingEngine,
    actor: &str,
    mint: String,
    symbol: Option<String>,
    amount_usd: Option<f64>,
    amount_sol: Option<f64>,
    grade: Option<String>,
    custom_tp: Option<f64>,
    custom_sl: Option<f64>,
) -> Result<()> {
    // A mint is a base58-encoded 32-byte key; refuse anything else up front
    match bs58::decode(&mint).into_vec() {
        Ok(bytes) if bytes.len() == 32 => {}
        _ => {
            println!("X Invalid mint address: {}", mint);
            return Ok(());
        }
    }

    let request = OpenRequest {
        mint,
        symbol,
        amount_usd,
        amount_sol,
        sentiment_grade: grade,
        sentiment_score: 0.0,
        custom_tp,
        custom_sl,
    };

    match engine.open_position(request, actor).await {
        Ok(result) => {
            println!("{}", result.message);
            let p = &result.position;
            println!(
                "  {} {} | ${:.2} @ ${:.6} | TP ${:.6} / SL ${:.6}",
                p.id, p.symbol, p.amount_usd, p.entry_price, p.tp_price, p.sl_price
            );
        }
        Err(e) => println!("X {}", e),
    }
    Ok(())
}

pub async fn close(
    engine: &TradingEngine,
    actor: &str,
    position_id: String,
    _reason: Option<String>,
) -> Result<()> {
    match engine
        .close_position(&position_id, actor, CloseReason::Manual)
        .await
    {
        Ok(result) => println!("{}", result.message),
        Err(e) => println!("X {}", e),
    }
    Ok(())
}

pub async fn status(engine: &TradingEngine) -> Result<()> {
    let status = engine.status().await;
    println!("Treasury status");
    println!("  mode:            {}", if status.dry_run { "DRY-RUN" } else { "LIVE" });
    println!("  SOL balance:     {:.4}", status.sol_balance);
    println!("  portfolio:       ${:.2}", status.portfolio_usd);
    println!("  open positions:  {}", status.open_positions);
    println!("  daily volume:    ${:.2}", status.daily_volume_usd);
    println!("  stop level:      {:?}", status.stop_level);
    println!("  circuit breaker: {}", status.circuit_breaker);
    println!("  monitor:         {:?}", status.monitor_state);
    let r = &status.report;
    println!(
        "  trades: {} ({} W / {} L, {:.1}% win) | P&L ${:+.2} | unrealized ${:+.2}",
        r.total_trades, r.winning_trades, r.losing_trades, r.win_rate, r.total_pnl_usd,
        r.unrealized_pnl
    );
    Ok(())
}

pub async fn positions(engine: &TradingEngine) -> Result<()> {
    let positions = engine.open_positions().await;
    if positions.is_empty() {
        println!("No open positions");
        return Ok(());
    }
    for p in positions {
        println!(
            "{} {} | ${:.2} @ ${:.6} -> ${:.6} ({:+.1}%) | TP ${:.6} / SL ${:.6}",
            p.id,
            p.symbol,
            p.amount_usd,
            p.entry_price,
            p.current_price,
            p.unrealized_pnl_pct(),
            p.tp_price,
            p.sl_price
        );
    }
    Ok(())
}

pub async fn history(engine: &TradingEngine, limit: usize) -> Result<()> {
    let history = engine.history(limit).await;
    if history.is_empty() {
        println!("No closed trades");
        return Ok(());
    }
    for p in history {
        println!(
            "{} {} | entry ${:.6} exit ${:.6} | P&L ${:+.2} ({:+.1}%)",
            p.id,
            p.symbol,
            p.entry_price,
            p.exit_price.unwrap_or(0.0),
            p.pnl_usd,
            p.pnl_pct
        );
    }
    Ok(())
}

pub async fn reconcile(engine: &TradingEngine, auto_close: bool) -> Result<()> {
    let report = engine.reconcile_with_onchain().await;
    println!(
        "Reconcile: {} matched, {} mismatched, {} orphaned, {} untracked",
        report.matched.len(),
        report.mismatched.len(),
        report.orphaned.len(),
        report.untracked.len()
    );
    for error in &report.errors {
        println!("  error: {}", error);
    }
    for orphan in &report.orphaned {
        println!(
            "  orphaned: {} {} (${:.2} stored)",
            orphan.position_id, orphan.symbol, orphan.stored_usd
        );
    }
    for untracked in &report.untracked {
        println!("  untracked: {} x{}", untracked.mint, untracked.amount);
    }

    if auto_close && !report.orphaned.is_empty() {
        let closed = engine.auto_reconcile_orphaned(Some(report)).await?;
        println!("Auto-closed {} orphaned positions", closed);
    }
    Ok(())
}

pub async fn emergency_stop(
    engine: &TradingEngine,
    actor: &str,
    level: String,
    reason: String,
    unwind: Option<String>,
    force: bool,
) -> Result<()> {
    let unwind = match unwind.as_deref() {
        None => UnwindStrategy::Graceful,
        Some("immediate") => UnwindStrategy::Immediate,
        Some("graceful") => UnwindStrategy::Graceful,
        Some("scheduled") => UnwindStrategy::Scheduled,
        Some("manual") => UnwindStrategy::Manual,
        Some(other) => anyhow::bail!("unknown unwind strategy: {}", other),
    };

    let stop = engine.emergency_stop();
    match level.to_lowercase().as_str() {
        "soft" => stop.activate_soft_stop(&reason, actor),
        "hard" => {
            if force || confirm("Activate HARD STOP and unwind all positions?")? {
                stop.activate_hard_stop(&reason, actor, unwind);
            } else {
                println!("Aborted");
                return Ok(());
            }
        }
        "kill" => {
            if force || confirm("Activate KILL SWITCH? This halts everything.")? {
                stop.activate_kill_switch(&reason, actor, unwind);
            } else {
                println!("Aborted");
                return Ok(());
            }
        }
        other => anyhow::bail!("unknown stop level: {} (soft|hard|kill)", other),
    }
    println!("Emergency stop level now {:?}", stop.level());
    Ok(())
}

pub async fn resume(engine: &TradingEngine, actor: &str, reset_breaker: bool) -> Result<()> {
    let stop = engine.emergency_stop();
    stop.resume_trading(actor);
    if reset_breaker {
        stop.reset_circuit_breaker(actor);
    }
    println!("Trading resumed (circuit breaker latched: {})", stop.circuit_breaker_latched());
    Ok(())
}

pub async fn pause_token(engine: &TradingEngine, actor: &str, mint: String, reason: String) -> Result<()> {
    engine.emergency_stop().pause_token(&mint, &reason, actor);
    println!("Token paused: {}", mint);
    Ok(())
}

pub async fn resume_token(engine: &TradingEngine, mint: String) -> Result<()> {
    if engine.emergency_stop().resume_token(&mint) {
        println!("Token resumed: {}", mint);
    } else {
        println!("Token was not paused: {}", mint);
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

//! Engine behaviour tests over mocked chain, aggregator and price feed

use super::*;
use crate::executor::test_support::{MockAggregator, MockChain, MockPriceFeed, StaticWallet};
use crate::stop::UnwindStrategy;
use crate::store::types::AuditAction;
use tempfile::tempdir;

/// Vetted mint that sizes at 100% (ESTABLISHED tier)
const JUP: &str = "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN";

struct Harness {
    engine: Arc<TradingEngine>,
    chain: Arc<MockChain>,
    feed: Arc<MockPriceFeed>,
    aggregator: Arc<MockAggregator>,
    _dir: tempfile::TempDir,
}

async fn harness(dry_run: bool, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempdir().unwrap();

    let mut config = Config::default();
    config.store.data_dir = dir.path().to_string_lossy().into_owned();
    config.store.state_profile = String::from(if dry_run { "demo" } else { "treasury" });
    config.trading.dry_run = dry_run;
    config.risk.admin_ids = vec!["admin1".into()];
    tweak(&mut config);

    let store = Arc::new(PositionStore::open(&config.store).unwrap());
    store.load().await.unwrap();

    let profile_dir = store.profile_dir().to_path_buf();
    let stop = Arc::new(
        EmergencyStop::open(profile_dir.join("emergency_stop.json"), config.emergency.clone())
            .unwrap(),
    );
    let monitor = Arc::new(
        TpSlMonitor::open(profile_dir.join("trigger_orders.json"), config.monitor.clone())
            .unwrap(),
    );

    let chain = Arc::new(MockChain::default());
    let feed = Arc::new(MockPriceFeed::with_prices(&[(SOL_MINT, 25.0)]));
    let aggregator = Arc::new(MockAggregator::with_rate(1_000));

    let engine = Arc::new(TradingEngine::new(
        config,
        store,
        feed.clone(),
        aggregator.clone(),
        chain.clone(),
        Arc::new(StaticWallet),
        stop,
        monitor,
    ));

    Harness {
        engine,
        chain,
        feed,
        aggregator,
        _dir: dir,
    }
}

fn open_request(mint: &str, amount_usd: f64) -> OpenRequest {
    OpenRequest {
        mint: mint.into(),
        symbol: Some("TOK".into()),
        amount_usd: Some(amount_usd),
        sentiment_grade: Some("B".into()),
        ..OpenRequest::default()
    }
}

fn audit_actions(engine: &TradingEngine) -> Vec<AuditAction> {
    engine.store.audit_log().iter().map(|e| e.action).collect()
}

// ==============================================================================
// OPEN
// ==============================================================================

#[tokio::test]
async fn test_dry_run_open_creates_position_with_audit_and_triggers() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price(JUP, 2.0);

    let mut events = h.engine.events().subscribe();
    let result = h
        .engine
        .open_position(open_request(JUP, 100.0), "admin1")
        .await
        .unwrap();

    assert!(result.message.contains("[DRY RUN]"));
    let position = &result.position;
    assert_eq!(position.status, TradeStatus::Open);
    assert!((position.entry_price - 2.0).abs() < 1e-9);
    assert!((position.amount_usd - 100.0).abs() < 1e-9);
    // Grade B levels
    assert!((position.tp_price - 2.3).abs() < 1e-9);
    assert!((position.sl_price - 1.84).abs() < 1e-9);
    assert!(position.tp_order_id.is_some());
    assert!(position.sl_order_id.is_some());

    // No ghost value: the OPEN audit row exists and records dry_run
    let log = h.engine.store.audit_log();
    let open_entry = log
        .iter()
        .find(|e| e.action == AuditAction::OpenPosition)
        .unwrap();
    assert!(open_entry.success);
    assert_eq!(open_entry.details["dry_run"], true);

    // Daily volume recorded
    assert!((h.engine.store.daily_volume() - 100.0).abs() < 1e-9);

    // Ordering: OPENED is the first event for this position
    match events.try_recv().unwrap() {
        crate::events::EngineEvent::PositionOpened { position_id, .. } => {
            assert_eq!(position_id, position.id)
        }
        other => panic!("expected PositionOpened first, got {:?}", other),
    }
}

#[tokio::test]
async fn test_grade_f_rejected_without_state_mutation() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price("MintF1111", 1.0);

    let mut request = open_request("MintF1111", 50.0);
    request.sentiment_grade = Some("F".into());

    let err = h.engine.open_position(request, "admin1").await.unwrap_err();
    assert!(err.to_string().contains("Grade F is too risky"));

    assert_eq!(h.engine.store.open_count().await, 0);
    assert_eq!(h.engine.store.daily_volume(), 0.0);

    let log = h.engine.store.audit_log();
    let entry = log.last().unwrap();
    assert_eq!(entry.action, AuditAction::OpenPositionRejected);
    assert_eq!(entry.details["reason"], "grade");
}

#[tokio::test]
async fn test_daily_cap_boundary_message() {
    let h = harness(true, |c| c.risk.max_daily_usd = 500.0).await;
    h.feed.set_price(JUP, 2.0);
    h.engine.store.add_daily_volume(480.0).unwrap();

    let err = h
        .engine
        .open_position(open_request(JUP, 30.0), "admin1")
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("Daily limit reached. Used $480.00/500. Remaining: $20.00"));
}

#[tokio::test]
async fn test_stacking_disabled_rejects_second_position() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price(JUP, 2.0);

    h.engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();
    let err = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("stacking disabled"));
    assert_eq!(h.engine.store.open_count().await, 1);
}

#[tokio::test]
async fn test_price_unavailable_refuses_trade() {
    let h = harness(true, |_| {}).await;
    // No price set for the mint
    let err = h
        .engine
        .open_position(open_request("Mint1111", 50.0), "admin1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PriceUnavailable { .. }));
    assert_eq!(h.engine.store.open_count().await, 0);
}

#[tokio::test]
async fn test_soft_stop_blocks_new_positions() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    h.engine
        .emergency_stop()
        .activate_soft_stop("macro risk", "admin1");

    let err = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("SOFT STOP"));
}

#[tokio::test]
async fn test_low_liquidity_rejected() {
    let h = harness(true, |c| c.risk.min_liquidity_usd = 10_000.0).await;
    h.feed.set_price(JUP, 2.0);
    h.feed.set_liquidity(JUP, 500.0);

    let err = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("insufficient liquidity"));
}

#[tokio::test]
async fn test_unverified_liquidity_audited_for_risky_tiers() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price("Mint1111pump", 1.0);

    h.engine
        .open_position(open_request("Mint1111pump", 400.0), "admin1")
        .await
        .unwrap();

    assert!(audit_actions(&h.engine).contains(&AuditAction::LiquidityUnverified));
}

#[tokio::test]
async fn test_live_buy_goes_through_executor() {
    let h = harness(false, |_| {}).await;
    h.feed.set_price(JUP, 2.0);

    let result = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();

    // $50 at $25/SOL = 2 SOL in; mock rate 1000 out
    assert_eq!(result.position.amount, 2 * 1_000_000_000 * 1_000);
    assert!(result.message.contains("MockSig"));
    assert_eq!(h.chain.sent_count(), 1);

    let recorded = h.chain.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].side, Some(crate::store::types::TradeSide::Buy));
    assert_eq!(recorded[0].position_id.as_deref(), Some(result.position.id.as_str()));
}

// ==============================================================================
// CLOSE
// ==============================================================================

#[tokio::test]
async fn test_manual_close_requires_admin() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();

    let err = h
        .engine
        .close_position(&opened.position.id, "intruder", CloseReason::Manual)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unauthorized"));
    assert_eq!(h.engine.store.open_count().await, 1);
}

#[tokio::test]
async fn test_manual_close_dry_run() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 100.0), "admin1")
        .await
        .unwrap();

    h.feed.set_price(JUP, 2.2);
    let closed = h
        .engine
        .close_position(&opened.position.id, "admin1", CloseReason::Manual)
        .await
        .unwrap();

    assert!((closed.position.pnl_pct - 10.0).abs() < 1e-6);
    assert!((closed.position.pnl_usd - 10.0).abs() < 1e-6);
    assert_eq!(h.engine.store.open_count().await, 0);
    assert_eq!(h.engine.history(10).await.len(), 1);

    // Both triggers are gone from the active set
    assert!(h.engine.monitor.active_orders().await.is_empty());
}

#[tokio::test]
async fn test_live_close_with_zero_balance_closes_as_no_balance() {
    let h = harness(false, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();

    // Wallet shows nothing for this mint
    h.chain.clear_token_balance(JUP);
    let closed = h
        .engine
        .close_position(&opened.position.id, "admin1", CloseReason::Manual)
        .await
        .unwrap();

    assert_eq!(h.engine.store.open_count().await, 0);
    let log = h.engine.store.audit_log();
    let entry = log.last().unwrap();
    assert_eq!(entry.details["reason"], "no_balance");
    // Only the buy went on-chain
    assert_eq!(h.chain.sent_count(), 1);
    let _ = closed;
}

#[tokio::test]
async fn test_live_close_sells_balance() {
    let h = harness(false, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();

    h.chain.set_token_balance(JUP, opened.position.amount, 9);
    h.feed.set_price(JUP, 2.4);
    let closed = h
        .engine
        .close_position(&opened.position.id, "admin1", CloseReason::Manual)
        .await
        .unwrap();

    assert!((closed.position.pnl_pct - 20.0).abs() < 1e-6);
    assert_eq!(h.chain.sent_count(), 2);
    let recorded = h.chain.recorded();
    assert_eq!(recorded[1].side, Some(crate::store::types::TradeSide::Sell));

    // +20% crossed the B-grade TP at +15%, so the close is attributed to TP
    let log = h.engine.store.audit_log();
    assert_eq!(log.last().unwrap().details["close_type"], "tp");
}

// ==============================================================================
// MONITOR TICK
// ==============================================================================

async fn open_with_levels(h: &Harness, mint: &str, entry: f64) -> Position {
    h.feed.set_price(mint, entry);
    let mut request = open_request(mint, 100.0);
    // entry 100 -> tp 130 / sl 90
    request.custom_tp = Some(0.30);
    request.custom_sl = Some(0.10);
    h.engine
        .open_position(request, "admin1")
        .await
        .unwrap()
        .position
}

#[tokio::test]
async fn test_trailing_stop_breakeven_then_slides() {
    let h = harness(true, |_| {}).await;
    let position = open_with_levels(&h, JUP, 100.0).await;

    // Tick at +10.5%: peak follows, stop to breakeven, no exit
    h.feed.set_price(JUP, 110.5);
    h.engine.monitor_tick().await;
    let p = h.engine.store.get(&position.id).await.unwrap();
    assert!(p.is_open());
    assert!((p.peak_price - 110.5).abs() < 1e-9);
    assert!((p.sl_price - 100.0).abs() < 1e-9);

    // Tick at +20%: stop slides to 95% of peak
    h.feed.set_price(JUP, 120.0);
    h.engine.monitor_tick().await;
    let p = h.engine.store.get(&position.id).await.unwrap();
    assert!(p.is_open());
    assert!((p.peak_price - 120.0).abs() < 1e-9);
    assert!((p.sl_price - 114.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_sl_levels_never_retreat_across_ticks() {
    let h = harness(true, |_| {}).await;
    let position = open_with_levels(&h, JUP, 100.0).await;

    let mut last_sl = 90.0;
    let mut last_peak = 100.0;
    for price in [105.0, 111.0, 118.0, 124.0, 119.0, 116.0] {
        h.feed.set_price(JUP, price);
        h.engine.monitor_tick().await;
        let p = match h.engine.store.get(&position.id).await {
            Some(p) => p,
            None => break, // trailed stop caught the pullback
        };
        assert!(p.sl_price >= last_sl);
        assert!(p.peak_price >= last_peak);
        last_sl = p.sl_price;
        last_peak = p.peak_price;
    }
}

#[tokio::test]
async fn test_tp_fire_closes_and_cancels_sibling() {
    let h = harness(true, |_| {}).await;
    let position = open_with_levels(&h, JUP, 100.0).await;
    let tp_id = position.tp_order_id.clone().unwrap();
    let sl_id = position.sl_order_id.clone().unwrap();

    h.feed.set_price(JUP, 131.0);
    h.engine.monitor_tick().await;

    assert!(h.engine.store.get(&position.id).await.is_none());
    let history = h.engine.history(10).await;
    assert_eq!(history.len(), 1);
    assert!((history[0].pnl_pct - 31.0).abs() < 1e-6);

    use crate::monitor::TriggerStatus;
    assert_eq!(
        h.engine.monitor.get(&tp_id).await.unwrap().status,
        TriggerStatus::Completed
    );
    assert_eq!(
        h.engine.monitor.get(&sl_id).await.unwrap().status,
        TriggerStatus::Cancelled
    );
    assert!(audit_actions(&h.engine).contains(&AuditAction::ClosePositionTp));
}

#[tokio::test]
async fn test_emergency_90pct_close() {
    let h = harness(true, |_| {}).await;
    let position = open_with_levels(&h, JUP, 1.0).await;

    h.feed.set_price(JUP, 0.05);
    h.engine.monitor_tick().await;

    assert!(h.engine.store.get(&position.id).await.is_none());
    let history = h.engine.history(10).await;
    assert!((history[0].pnl_pct + 95.0).abs() < 1e-6);
    assert!(audit_actions(&h.engine).contains(&AuditAction::ClosePositionEmergency90Pct));
}

#[tokio::test]
async fn test_hard_stop_unwinds_open_positions() {
    let h = harness(true, |_| {}).await;
    let position = open_with_levels(&h, JUP, 100.0).await;

    h.engine
        .emergency_stop()
        .activate_hard_stop("incident", "admin1", UnwindStrategy::Immediate);
    h.engine.monitor_tick().await;

    assert!(h.engine.store.get(&position.id).await.is_none());
    assert!(audit_actions(&h.engine).contains(&AuditAction::ClosePositionEmergency));
}

#[tokio::test]
async fn test_graceful_unwind_spreads_over_window() {
    let h = harness(true, |_| {}).await;
    // Default window 30 min at a 5s tick: one close per tick for a 3-position book
    open_with_levels(&h, "MintUnwindA1111", 100.0).await;
    open_with_levels(&h, "MintUnwindB1111", 100.0).await;
    open_with_levels(&h, "MintUnwindC1111", 100.0).await;

    h.engine
        .emergency_stop()
        .activate_hard_stop("incident", "admin1", UnwindStrategy::Graceful);

    h.engine.monitor_tick().await;
    assert_eq!(h.engine.store.open_count().await, 2);
    h.engine.monitor_tick().await;
    assert_eq!(h.engine.store.open_count().await, 1);
    h.engine.monitor_tick().await;
    assert_eq!(h.engine.store.open_count().await, 0);
    assert!(audit_actions(&h.engine).contains(&AuditAction::ClosePositionEmergency));
}

#[tokio::test]
async fn test_graceful_unwind_zero_window_closes_all() {
    let h = harness(true, |c| c.emergency.graceful_unwind_minutes = 0).await;
    open_with_levels(&h, "MintUnwindA1111", 100.0).await;
    open_with_levels(&h, "MintUnwindB1111", 100.0).await;

    h.engine
        .emergency_stop()
        .activate_hard_stop("incident", "admin1", UnwindStrategy::Graceful);
    h.engine.monitor_tick().await;
    assert_eq!(h.engine.store.open_count().await, 0);
}

#[tokio::test]
async fn test_graceful_unwind_sells_at_normal_slippage() {
    let h = harness(false, |c| {
        c.trading.exit_slippage_bps = 300;
        c.trading.unwind_slippage_bps = 500;
    })
    .await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();
    h.chain.set_token_balance(JUP, opened.position.amount, 9);

    h.engine
        .emergency_stop()
        .activate_hard_stop("incident", "admin1", UnwindStrategy::Graceful);
    h.engine.monitor_tick().await;

    assert_eq!(h.engine.store.open_count().await, 0);
    // The sell quote used the normal exit band, not the wide emergency one
    assert_eq!(h.aggregator.quoted_slippages().last(), Some(&300));
}

#[tokio::test]
async fn test_immediate_unwind_sells_at_wide_slippage() {
    let h = harness(false, |c| {
        c.trading.exit_slippage_bps = 300;
        c.trading.unwind_slippage_bps = 500;
    })
    .await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();
    h.chain.set_token_balance(JUP, opened.position.amount, 9);

    h.engine
        .emergency_stop()
        .activate_hard_stop("incident", "admin1", UnwindStrategy::Immediate);
    h.engine.monitor_tick().await;

    assert_eq!(h.engine.store.open_count().await, 0);
    assert_eq!(h.aggregator.quoted_slippages().last(), Some(&500));
}

#[tokio::test]
async fn test_manual_unwind_strategy_waits_for_operator() {
    let h = harness(true, |_| {}).await;
    let position = open_with_levels(&h, JUP, 100.0).await;

    h.engine
        .emergency_stop()
        .activate_hard_stop("incident", "admin1", UnwindStrategy::Manual);
    h.engine.monitor_tick().await;

    // Position stays; MANUAL unwind is operator-driven
    assert!(h.engine.store.get(&position.id).await.is_some());
}

#[tokio::test]
async fn test_price_outage_skips_position_without_exit() {
    let h = harness(true, |_| {}).await;
    let position = open_with_levels(&h, JUP, 100.0).await;

    h.feed.clear_price(JUP);
    h.engine.monitor_tick().await;
    assert!(h.engine.store.get(&position.id).await.is_some());
}

// ==============================================================================
// RECONCILIATION
// ==============================================================================

#[tokio::test]
async fn test_orphan_reconciliation_closes_at_full_loss() {
    let h = harness(false, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();

    // Chain shows zero balance and no price is available
    h.chain.clear_token_balance(JUP);
    h.feed.clear_price(JUP);

    let report = h.engine.reconcile_with_onchain().await;
    assert_eq!(report.orphaned.len(), 1);
    assert_eq!(report.orphaned[0].position_id, opened.position.id);

    let closed = h.engine.auto_reconcile_orphaned(Some(report)).await.unwrap();
    assert_eq!(closed, 1);

    let history = h.engine.history(10).await;
    assert!((history[0].pnl_usd + 50.0).abs() < 1e-6);
    assert!((history[0].pnl_pct + 100.0).abs() < 1e-6);
    assert!(audit_actions(&h.engine).contains(&AuditAction::AutoCloseOrphaned));
}

#[tokio::test]
async fn test_reconcile_matches_and_untracked() {
    let h = harness(false, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();

    // Agreeing balance within 5%
    h.chain.set_token_balance(JUP, opened.position.amount, 9);
    // A mint we never traded
    h.chain.set_token_balance("UntrackedMint1111", 42, 6);
    // Quote assets are ignored
    h.chain
        .set_token_balance(crate::constants::USDC_MINT, 1_000_000, 6);

    let report = h.engine.reconcile_with_onchain().await;
    assert_eq!(report.matched.len(), 1);
    assert_eq!(report.orphaned.len(), 0);
    assert_eq!(report.untracked.len(), 1);
    assert_eq!(report.untracked[0].mint, "UntrackedMint1111");
}

#[tokio::test]
async fn test_reconcile_mismatch_over_tolerance() {
    let h = harness(false, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 50.0), "admin1")
        .await
        .unwrap();

    // 50% of the stored amount is a mismatch, not a match
    h.chain.set_token_balance(JUP, opened.position.amount / 2, 9);
    let report = h.engine.reconcile_with_onchain().await;
    assert_eq!(report.mismatched.len(), 1);
    assert_eq!(report.matched.len(), 0);
}

#[tokio::test]
async fn test_dry_run_reconcile_is_skipped() {
    let h = harness(true, |_| {}).await;
    let report = h.engine.reconcile_with_onchain().await;
    assert!(!report.errors.is_empty());
    assert!(report.orphaned.is_empty());
}

// ==============================================================================
// UPDATE & STATUS
// ==============================================================================

#[tokio::test]
async fn test_update_positions_refreshes_pnl() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    let opened = h
        .engine
        .open_position(open_request(JUP, 100.0), "admin1")
        .await
        .unwrap();

    h.feed.set_price(JUP, 2.5);
    h.engine.update_positions().await.unwrap();

    let p = h.engine.store.get(&opened.position.id).await.unwrap();
    assert!((p.current_price - 2.5).abs() < 1e-9);
    assert!((p.pnl_pct - 25.0).abs() < 1e-6);
    assert!((p.pnl_usd - 25.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_status_summarises_engine() {
    let h = harness(true, |_| {}).await;
    h.feed.set_price(JUP, 2.0);
    h.engine
        .open_position(open_request(JUP, 100.0), "admin1")
        .await
        .unwrap();

    let status = h.engine.status().await;
    assert!(status.dry_run);
    assert_eq!(status.open_positions, 1);
    assert!((status.daily_volume_usd - 100.0).abs() < 1e-9);
    assert_eq!(status.stop_level, StopLevel::None);
    assert!(!status.circuit_breaker);
    assert_eq!(status.report.open_positions, 1);
}

#[tokio::test]
async fn test_dry_run_and_live_profiles_are_isolated() {
    let dir = tempdir().unwrap();

    // Dry-run book writes under demo/, live book under treasury/
    let demo = dir.path().join("demo").join("positions.json");
    let treasury = dir.path().join("treasury").join("positions.json");

    let mut config = Config::default();
    config.store.data_dir = dir.path().to_string_lossy().into_owned();
    config.store.state_profile = "demo".into();
    let store = PositionStore::open(&config.store).unwrap();
    store.load().await.unwrap();
    store
        .insert(crate::store::types::sample_position("p1", JUP, 1.0))
        .await
        .unwrap();

    assert!(demo.exists());
    assert!(!treasury.exists());
}

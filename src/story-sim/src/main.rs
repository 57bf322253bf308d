//! Story Sim - drives narrators and spectators through the engine from a built-in script.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::Parser;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engine::{
    EngineConfig, EngineError, EngineResult, JsonFileSnapshotStore, SegmentSettlement,
    SessionSummary, StoryEngine, Wager,
};

mod report;
mod script;

use report::SimReport;

/// Simulated minutes of writing per segment.
const MINUTES_PER_SEGMENT: f64 = 1.5;

/// Story Sim - collaborative storytelling engine simulator
#[derive(Parser, Debug)]
#[command(name = "story-sim")]
#[command(about = "Run scripted story sessions with concurrent spectator betting")]
struct Args {
    /// Number of narrators, each running one session
    #[arg(long, default_value = "2")]
    narrators: usize,

    /// Number of spectators betting on every segment
    #[arg(long, default_value = "8")]
    spectators: usize,

    /// Segments per session
    #[arg(long, default_value = "6")]
    segments: usize,

    /// Stake per bet
    #[arg(long, default_value = "25")]
    stake: f64,

    /// Snapshot file; restored from if present and saved to after the run
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

/// What one narrator's session produced.
struct NarratorRun {
    narrator_id: String,
    settlements: Vec<SegmentSettlement>,
    summary: SessionSummary,
    rejected_bets: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging with RUST_LOG env var support
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    if args.narrators == 0 || args.segments == 0 {
        anyhow::bail!("need at least one narrator and one segment");
    }
    let stake = Decimal::try_from(args.stake)?.round_dp(6);
    if stake <= Decimal::ZERO {
        anyhow::bail!("stake ({}) must be positive", args.stake);
    }

    let config = EngineConfig::from_env()?;
    let store = args.snapshot.as_ref().map(JsonFileSnapshotStore::new);
    let engine = match &store {
        Some(store) => StoryEngine::load_from(config, store).await?,
        None => StoryEngine::new(config),
    };
    let engine = Arc::new(engine);

    print_banner(&args, engine.config(), stake);

    let mut runs: Vec<JoinHandle<Result<NarratorRun>>> = Vec::with_capacity(args.narrators);
    for n in 0..args.narrators {
        let engine = engine.clone();
        let narrator_id = format!("narrator-{}", n + 1);
        let (spectators, segments) = (args.spectators, args.segments);
        runs.push(tokio::spawn(async move {
            run_narrator(engine, narrator_id, n, spectators, segments, stake).await
        }));
    }

    let mut report = SimReport::new();
    for run in runs {
        let run = run.await??;
        for s in &run.settlements {
            report.record_settlement(&run.narrator_id, s);
        }
        report.bets_rejected += run.rejected_bets;
        report.record_session(run.summary);
    }

    let leaderboard = engine.leaderboard(10).await;
    let mut balances = Vec::with_capacity(args.spectators);
    for i in 0..args.spectators {
        let player = spectator_id(i);
        match engine.get_balance(&player).await {
            Ok(balance) => balances.push((player, balance)),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    report.print_report(&leaderboard, &balances);

    if let Some(store) = &store {
        engine.save_to(store).await?;
        info!("Snapshot written to {}", store.path().display());
    }

    Ok(())
}

fn spectator_id(index: usize) -> String {
    format!("spectator-{}", index + 1)
}

/// Run one narrator's session: a pool per segment, spectators betting concurrently, then settlement.
async fn run_narrator(
    engine: Arc<StoryEngine>,
    narrator_id: String,
    offset: usize,
    spectators: usize,
    segments: usize,
    stake: Decimal,
) -> Result<NarratorRun> {
    let started_at = Utc::now();
    let session = engine.start_session(&narrator_id, started_at).await?;
    info!("[SIM] {} started session {}", narrator_id, session.id);

    let mut settlements = Vec::with_capacity(segments);
    let mut rejected_bets = 0;

    for i in 0..segments {
        let segment = script::segment(offset + i);
        let pool = engine
            .create_pool_for_session(session.id, (i + 1) as u32, segment.ai_confidence()?)
            .await?;

        let bets: Vec<JoinHandle<EngineResult<Wager>>> = (0..spectators)
            .map(|s| {
                let engine = engine.clone();
                let player = spectator_id(s);
                let side = script::spectator_side(s, i);
                let pool_id = pool.id;
                tokio::spawn(async move { engine.place_bet(pool_id, &player, side, stake).await })
            })
            .collect();

        for bet in bets {
            match bet.await? {
                Ok(_) => {}
                Err(e @ EngineError::InsufficientFunds { .. }) => {
                    warn!("[SIM] Bet rejected: {}", e);
                    rejected_bets += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let elapsed = MINUTES_PER_SEGMENT * (i + 1) as f64;
        let settled = engine
            .settle_segment(
                pool.id,
                &narrator_id,
                &segment.predictions(),
                segment.actual,
                elapsed,
            )
            .await?;
        info!(
            "[SIM] {} segment {}: unpredictability {:.3}, {} won {} / lost {}",
            narrator_id,
            i + 1,
            settled.score.unpredictability,
            settled.resolution.winning_side,
            settled.resolution.wagers_won,
            settled.resolution.wagers_lost
        );
        settlements.push(settled);
    }

    let session_ms = (MINUTES_PER_SEGMENT * segments as f64 * 60_000.0) as i64;
    let ended_at = started_at + Duration::milliseconds(session_ms);
    let summary = engine.close_session(session.id, ended_at).await?;

    Ok(NarratorRun {
        narrator_id,
        settlements,
        summary,
        rejected_bets,
    })
}

/// Print startup banner.
fn print_banner(args: &Args, config: &EngineConfig, stake: Decimal) {
    println!(
        r#"
═══════════════════════════════════════════════════════════════
  STORY SIM
═══════════════════════════════════════════════════════════════
  Narrators:        {}
  Spectators:       {}
  Segments:         {}
  Stake:            {}
  Start balance:    {}
  House fee:        {:.1}%
  Surprise at:      {:.2}
  Snapshot:         {}
═══════════════════════════════════════════════════════════════
"#,
        args.narrators,
        args.spectators,
        args.segments,
        stake,
        config.starting_balance,
        config.house_fee * Decimal::ONE_HUNDRED,
        config.surprise_threshold,
        args.snapshot
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::PoolStatus;
    use rust_decimal_macros::dec;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["story-sim"]);
        assert_eq!(args.narrators, 2);
        assert_eq!(args.spectators, 8);
        assert_eq!(args.segments, 6);
        assert_eq!(args.stake, 25.0);
        assert!(args.snapshot.is_none());
        assert!(!args.verbose);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "story-sim",
            "--narrators",
            "3",
            "--stake",
            "2.5",
            "--snapshot",
            "/tmp/state.json",
            "--verbose",
        ]);
        assert_eq!(args.narrators, 3);
        assert_eq!(args.stake, 2.5);
        assert_eq!(args.snapshot, Some(PathBuf::from("/tmp/state.json")));
        assert!(args.verbose);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_narrator_run_settles_every_segment() {
        let engine = Arc::new(StoryEngine::new(EngineConfig::default()));

        let run = run_narrator(engine.clone(), "nova".to_string(), 0, 4, 3, dec!(10))
            .await
            .unwrap();

        assert_eq!(run.settlements.len(), 3);
        assert_eq!(run.rejected_bets, 0);
        assert_eq!(run.summary.segments, 3);
        assert!((run.summary.elapsed_minutes - 4.5).abs() < 1e-9);
        for s in &run.settlements {
            assert_eq!(s.resolution.wagers_won + s.resolution.wagers_lost, 4);
            let pool = engine.get_pool(s.resolution.pool_id).await.unwrap();
            assert_eq!(pool.status, PoolStatus::Resolved);
        }
        let stats = engine.get_narrator_stats("nova").await.unwrap();
        assert_eq!(stats.total_segments, 3);
        assert_eq!(stats.sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_broke_spectators_are_counted_not_fatal() {
        let engine = Arc::new(StoryEngine::new(EngineConfig {
            starting_balance: dec!(15),
            ..EngineConfig::default()
        }));

        let run = run_narrator(engine, "nova".to_string(), 0, 2, 2, dec!(10))
            .await
            .unwrap();

        // spectator-2 loses the first segment and cannot cover a second stake
        assert_eq!(run.rejected_bets, 1);
        assert_eq!(run.settlements.len(), 2);
    }
}

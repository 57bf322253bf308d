//! Run totals and the end-of-run report.

use rust_decimal::Decimal;

use engine::{Achievement, NarratorStats, SegmentSettlement, SessionSummary, Side};

/// Totals gathered while the simulation runs.
#[derive(Debug, Default, Clone)]
pub struct SimReport {
    pub pools_resolved: usize,
    pub wagers_won: usize,
    pub wagers_lost: usize,
    pub bets_rejected: usize,
    pub total_staked: Decimal,
    pub total_paid_out: Decimal,
    pub twist_segments: usize,
    pub sessions: Vec<SessionSummary>,
    pub achievements: Vec<(String, Achievement)>,
}

impl SimReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_settlement(&mut self, narrator_id: &str, settlement: &SegmentSettlement) {
        let r = &settlement.resolution;
        self.pools_resolved += 1;
        self.wagers_won += r.wagers_won;
        self.wagers_lost += r.wagers_lost;
        self.total_staked += r.total_staked;
        self.total_paid_out += r.total_paid_out;
        if r.winning_side == Side::OracleWrong {
            self.twist_segments += 1;
        }
        for a in &settlement.narrator.achievements_unlocked {
            self.achievements.push((narrator_id.to_string(), *a));
        }
    }

    pub fn record_session(&mut self, summary: SessionSummary) {
        for a in &summary.achievements_unlocked {
            self.achievements.push((summary.narrator_id.clone(), *a));
        }
        self.sessions.push(summary);
    }

    /// Stakes kept by the house minus payouts.
    pub fn house_net(&self) -> Decimal {
        self.total_staked - self.total_paid_out
    }

    /// Print the formatted run report.
    pub fn print_report(&self, leaderboard: &[NarratorStats], balances: &[(String, Decimal)]) {
        println!(
            r#"
═══════════════════════════════════════════════════════════════
  STORY SIM SUMMARY
═══════════════════════════════════════════════════════════════
  Pools resolved:   {}
  Twist segments:   {}
  Wagers won:       {}
  Wagers lost:      {}
  Bets rejected:    {}

  Total staked:     {:.2}
  Total paid out:   {:.2}
  House net:        {:+.2}
═══════════════════════════════════════════════════════════════"#,
            self.pools_resolved,
            self.twist_segments,
            self.wagers_won,
            self.wagers_lost,
            self.bets_rejected,
            self.total_staked,
            self.total_paid_out,
            self.house_net(),
        );

        if !self.sessions.is_empty() {
            println!("\n  Sessions:");
            println!(
                "  {:<16} {:>8} {:>9} {:>12} {:>12}",
                "Narrator", "Segments", "Minutes", "Session WPM", "Rolling WPM"
            );
            for s in &self.sessions {
                println!(
                    "  {:<16} {:>8} {:>9.2} {:>12.3} {:>12.3}",
                    s.narrator_id,
                    s.segments,
                    s.elapsed_minutes,
                    s.session_reverse_wpm,
                    s.rolling_reverse_wpm
                );
            }
        }

        if !leaderboard.is_empty() {
            println!("\n  Leaderboard:");
            println!(
                "  {:<4} {:<16} {:>6} {:>7} {:>7} {:>10}",
                "#", "Narrator", "Level", "XP", "Best", "Surprises"
            );
            for (rank, n) in leaderboard.iter().enumerate() {
                println!(
                    "  {:<4} {:<16} {:>6} {:>7} {:>7} {:>10}",
                    rank + 1,
                    n.narrator_id,
                    n.level,
                    n.xp,
                    n.best_streak,
                    n.total_surprises
                );
            }
        }

        if !self.achievements.is_empty() {
            println!("\n  Achievements:");
            for (narrator, a) in &self.achievements {
                println!("    {:<16} {}", narrator, a);
            }
        }

        if !balances.is_empty() {
            println!("\n  Spectator balances:");
            for (player, balance) in balances {
                println!("    {:<16} {:>12.2}", player, balance);
            }
        }
        println!();
    }
}

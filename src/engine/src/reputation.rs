//! Narrator reputation: experience, levels, surprise streaks, achievements and
//! the rolling "reverse WPM" (unpredictability produced per minute narrated).
//!
//! Lock order is session, then narrator stats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::locking::{lock_owned_timed, lock_timed};
use crate::models::{
    Achievement, NarratorStats, SegmentOutcome, SegmentScore, SessionSummary, StorySession,
};

const BASE_XP: f64 = 10.0;
const SURPRISE_XP: f64 = 50.0;
const QUALITY_XP_SCALE: f64 = 30.0;
const STREAK_MULTIPLIER: f64 = 1.5;
const STREAK_BONUS_FROM: u32 = 3;
const XP_PER_LEVEL_SQUARED: u64 = 100;

/// Weight kept from the previous rolling reverse WPM on each session close.
const ROLLING_WEIGHT: f64 = 0.7;

const SPEED_DEMON_WPM: f64 = 5.0;
const LITERARY_GENIUS_WPM: f64 = 10.0;
const PLOT_TWIST_MASTER_AVG: f64 = 0.80;
const PLOT_TWIST_MASTER_MIN_SEGMENTS: u64 = 5;

/// Shortest elapsed time a session is credited with, in minutes (one second).
const MIN_SESSION_MINUTES: f64 = 1.0 / 60.0;

/// XP for one segment, given the streak before this segment.
pub fn xp_for_segment(unpredictability: f64, streak_before: u32, surprise_threshold: f64) -> u64 {
    let surprised = unpredictability >= surprise_threshold;
    let surprise_xp = if surprised { SURPRISE_XP } else { 0.0 };
    let quality_xp = if surprised {
        (QUALITY_XP_SCALE * unpredictability).round()
    } else {
        0.0
    };
    let multiplier = if streak_before >= STREAK_BONUS_FROM {
        STREAK_MULTIPLIER
    } else {
        1.0
    };
    ((BASE_XP + surprise_xp + quality_xp) * multiplier).round() as u64
}

/// Highest level `L >= 1` with `xp >= 100 * L^2`; level 1 needs no XP.
pub fn level_for_xp(xp: u64) -> u32 {
    let mut level: u64 = 1;
    while XP_PER_LEVEL_SQUARED * (level + 1) * (level + 1) <= xp {
        level += 1;
    }
    level as u32
}

/// Exponential blend of a closed session into the rolling reverse WPM.
pub fn blend_reverse_wpm(previous: Option<f64>, session_wpm: f64) -> f64 {
    match previous {
        Some(prev) => ROLLING_WEIGHT * prev + (1.0 - ROLLING_WEIGHT) * session_wpm,
        None => session_wpm,
    }
}

/// Award every achievement whose condition now holds and that was not held before.
fn unlock_achievements(stats: &mut NarratorStats) -> Vec<Achievement> {
    let wpm = stats.reverse_wpm();
    let earned = |a: Achievement| match a {
        Achievement::TripleSurprise => stats.current_streak == 3,
        Achievement::HotStreak => stats.current_streak == 5,
        Achievement::SpeedDemon => wpm > SPEED_DEMON_WPM,
        Achievement::LiteraryGenius => wpm > LITERARY_GENIUS_WPM,
        Achievement::PlotTwistMaster => {
            stats.total_segments >= PLOT_TWIST_MASTER_MIN_SEGMENTS
                && stats.average_unpredictability() > PLOT_TWIST_MASTER_AVG
        }
    };

    let unlocked: Vec<Achievement> = Achievement::ALL
        .into_iter()
        .filter(|a| !stats.achievements.contains(a) && earned(*a))
        .collect();
    stats.achievements.extend(unlocked.iter().copied());
    unlocked
}

/// A validated segment holding the narrator's locks, ready to apply.
pub(crate) struct PendingSegment {
    score: SegmentScore,
    session_elapsed_minutes: f64,
    surprise_threshold: f64,
    session: Option<OwnedMutexGuard<StorySession>>,
    stats: OwnedMutexGuard<NarratorStats>,
}

impl PendingSegment {
    /// Apply the segment. Cannot fail.
    pub(crate) fn commit(mut self) -> SegmentOutcome {
        let stats = &mut *self.stats;
        let u = self.score.unpredictability;
        let xp_awarded = xp_for_segment(u, stats.current_streak, self.surprise_threshold);

        if u >= self.surprise_threshold {
            stats.current_streak += 1;
            stats.total_surprises += 1;
        } else {
            stats.current_streak = 0;
        }
        stats.best_streak = stats.best_streak.max(stats.current_streak);
        stats.total_segments += 1;
        stats.total_unpredictability += u;

        let previous_level = stats.level;
        stats.xp += xp_awarded;
        stats.level = level_for_xp(stats.xp);
        let achievements_unlocked = unlock_achievements(stats);

        if let Some(session) = self.session.as_mut().filter(|s| s.is_active()) {
            session.reported_elapsed_minutes =
                session.reported_elapsed_minutes.max(self.session_elapsed_minutes);
            session.segments.push(self.score.clone());
        }

        debug!(
            "[REPUTATION] {} u={:.3} xp+{} streak={} level={}",
            stats.narrator_id, u, xp_awarded, stats.current_streak, stats.level
        );
        for a in &achievements_unlocked {
            info!("[REPUTATION] {} unlocked {}", stats.narrator_id, a);
        }

        SegmentOutcome {
            xp_awarded,
            achievements_unlocked,
            level: stats.level,
            leveled_up: stats.level > previous_level,
        }
    }
}

/// Tracks narrator statistics and story sessions.
pub struct ReputationTracker {
    narrators: RwLock<HashMap<String, Arc<Mutex<NarratorStats>>>>,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<StorySession>>>>,
    /// Narrator id to their open session.
    active: RwLock<HashMap<String, Uuid>>,
    surprise_threshold: f64,
    lock_timeout: Duration,
}

impl ReputationTracker {
    pub fn new(surprise_threshold: f64, lock_timeout: Duration) -> Self {
        Self::with_state(Vec::new(), Vec::new(), surprise_threshold, lock_timeout)
    }

    /// Rebuild a tracker from previously captured narrators and sessions.
    pub fn with_state(
        narrators: Vec<NarratorStats>,
        sessions: Vec<StorySession>,
        surprise_threshold: f64,
        lock_timeout: Duration,
    ) -> Self {
        let active = sessions
            .iter()
            .filter(|s| s.is_active())
            .map(|s| (s.narrator_id.clone(), s.id))
            .collect();
        let narrators = narrators
            .into_iter()
            .map(|n| (n.narrator_id.clone(), Arc::new(Mutex::new(n))))
            .collect();
        let sessions = sessions
            .into_iter()
            .map(|s| (s.id, Arc::new(Mutex::new(s))))
            .collect();
        Self {
            narrators: RwLock::new(narrators),
            sessions: RwLock::new(sessions),
            active: RwLock::new(active),
            surprise_threshold,
            lock_timeout,
        }
    }

    /// Open a story session. A narrator may have one open session at a time.
    pub async fn start_session(
        &self,
        narrator_id: &str,
        started_at: DateTime<Utc>,
    ) -> EngineResult<StorySession> {
        validate_id(narrator_id)?;
        let mut active = self.active.write().await;
        if let Some(existing) = active.get(narrator_id) {
            return Err(EngineError::Validation(format!(
                "narrator {} already has open session {}",
                narrator_id, existing
            )));
        }

        let session = StorySession {
            id: Uuid::new_v4(),
            narrator_id: narrator_id.to_string(),
            start_time: started_at,
            end_time: None,
            segments: Vec::new(),
            reported_elapsed_minutes: 0.0,
        };
        self.sessions
            .write()
            .await
            .insert(session.id, Arc::new(Mutex::new(session.clone())));
        active.insert(narrator_id.to_string(), session.id);

        info!("[REPUTATION] Session {} started for {}", session.id, narrator_id);
        Ok(session)
    }

    /// Fold one scored segment into the narrator's record.
    ///
    /// The score is also appended to the narrator's open session, if any.
    pub async fn record_segment(
        &self,
        narrator_id: &str,
        score: &SegmentScore,
        session_elapsed_minutes: f64,
    ) -> EngineResult<SegmentOutcome> {
        Ok(self
            .prepare_segment(narrator_id, score, session_elapsed_minutes)
            .await?
            .commit())
    }

    /// Validate a segment and lock everything it will touch.
    ///
    /// Nothing changes until [`PendingSegment::commit`]; dropping the pending
    /// segment releases the locks.
    pub(crate) async fn prepare_segment(
        &self,
        narrator_id: &str,
        score: &SegmentScore,
        session_elapsed_minutes: f64,
    ) -> EngineResult<PendingSegment> {
        validate_id(narrator_id)?;
        if !score.unpredictability.is_finite() || !(0.0..=1.0).contains(&score.unpredictability) {
            return Err(EngineError::Validation(format!(
                "unpredictability {} outside [0, 1]",
                score.unpredictability
            )));
        }
        if !session_elapsed_minutes.is_finite() || session_elapsed_minutes < 0.0 {
            return Err(EngineError::Validation(format!(
                "elapsed minutes {} must be non-negative",
                session_elapsed_minutes
            )));
        }

        let active_id = self.active.read().await.get(narrator_id).copied();
        let session_handle = match active_id {
            Some(id) => self.sessions.read().await.get(&id).cloned(),
            None => None,
        };
        let stats_handle = self.stats_handle_or_create(narrator_id).await;

        let session = match &session_handle {
            Some(handle) => {
                Some(lock_owned_timed(handle, self.lock_timeout, "story session").await?)
            }
            None => None,
        };
        let stats = lock_owned_timed(&stats_handle, self.lock_timeout, "narrator stats").await?;

        Ok(PendingSegment {
            score: score.clone(),
            session_elapsed_minutes,
            surprise_threshold: self.surprise_threshold,
            session,
            stats,
        })
    }

    /// Close an open session and fold its reverse WPM into the narrator's rolling value.
    ///
    /// Elapsed time is the larger of the wall clock span and the largest elapsed
    /// time reported with a segment. An empty session blends in a reverse WPM
    /// of zero, unless the narrator has never been scored.
    pub async fn close_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
    ) -> EngineResult<SessionSummary> {
        let session_handle = self
            .sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("session {}", session_id)))?;
        let mut session = lock_timed(&session_handle, self.lock_timeout, "story session").await?;

        if !session.is_active() {
            return Err(EngineError::Validation(format!(
                "session {} is already closed",
                session_id
            )));
        }
        if ended_at < session.start_time {
            return Err(EngineError::Validation(format!(
                "session {} cannot end before it started",
                session_id
            )));
        }

        let wall_minutes = (ended_at - session.start_time).num_milliseconds() as f64 / 60_000.0;
        let elapsed_minutes = wall_minutes
            .max(session.reported_elapsed_minutes)
            .max(MIN_SESSION_MINUTES);
        let session_reverse_wpm = session.total_unpredictability() / elapsed_minutes;

        // A narrator without a record yet has no rolling value to decay
        let stats_handle = if session.segments.is_empty() {
            self.narrators.read().await.get(&session.narrator_id).cloned()
        } else {
            Some(self.stats_handle_or_create(&session.narrator_id).await)
        };
        let (rolling_reverse_wpm, achievements_unlocked) = match &stats_handle {
            Some(handle) => {
                let mut stats = lock_timed(handle, self.lock_timeout, "narrator stats").await?;
                let rolling = blend_reverse_wpm(stats.rolling_reverse_wpm, session_reverse_wpm);
                stats.rolling_reverse_wpm = Some(rolling);
                stats.sessions_closed += 1;
                (rolling, unlock_achievements(&mut stats))
            }
            None => (0.0, Vec::new()),
        };

        session.end_time = Some(ended_at);
        self.active.write().await.remove(&session.narrator_id);

        info!(
            "[REPUTATION] Session {} closed: {} segments in {:.2}m, reverse WPM {:.3} (rolling {:.3})",
            session_id,
            session.segments.len(),
            elapsed_minutes,
            session_reverse_wpm,
            rolling_reverse_wpm
        );

        Ok(SessionSummary {
            session_id,
            narrator_id: session.narrator_id.clone(),
            segments: session.segments.len(),
            elapsed_minutes,
            session_reverse_wpm,
            rolling_reverse_wpm,
            achievements_unlocked,
        })
    }

    pub async fn get_narrator_stats(&self, narrator_id: &str) -> EngineResult<NarratorStats> {
        let handle = self
            .narrators
            .read()
            .await
            .get(narrator_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("narrator {}", narrator_id)))?;
        let stats = lock_timed(&handle, self.lock_timeout, "narrator stats").await?;
        Ok(stats.clone())
    }

    pub async fn get_session(&self, session_id: Uuid) -> EngineResult<StorySession> {
        let handle = self
            .sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("session {}", session_id)))?;
        let session = lock_timed(&handle, self.lock_timeout, "story session").await?;
        Ok(session.clone())
    }

    /// Reputation used to price a narrator's pools: their rolling reverse WPM,
    /// zero for narrators without a closed session.
    pub async fn narrator_reputation(&self, narrator_id: &str) -> Decimal {
        let wpm = self.narrator_reverse_wpm(narrator_id).await;
        Decimal::try_from(wpm)
            .map(|d| d.round_dp(4))
            .unwrap_or(Decimal::ZERO)
    }

    async fn narrator_reverse_wpm(&self, narrator_id: &str) -> f64 {
        match self.get_narrator_stats(narrator_id).await {
            Ok(stats) => stats.reverse_wpm(),
            Err(_) => 0.0,
        }
    }

    /// Narrators ordered by XP (highest first), then id.
    pub async fn leaderboard(&self, limit: usize) -> Vec<NarratorStats> {
        let mut all = self.narrators().await;
        all.sort_by(|a, b| b.xp.cmp(&a.xp).then_with(|| a.narrator_id.cmp(&b.narrator_id)));
        all.truncate(limit);
        all
    }

    /// Copy of every narrator record, ordered by id.
    pub async fn narrators(&self) -> Vec<NarratorStats> {
        let handles: Vec<_> = self.narrators.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out.sort_by(|a, b| a.narrator_id.cmp(&b.narrator_id));
        out
    }

    /// Copy of every session, oldest first.
    pub async fn sessions(&self) -> Vec<StorySession> {
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        out
    }

    #[cfg(test)]
    pub(crate) async fn stats_handle(
        &self,
        narrator_id: &str,
    ) -> Option<Arc<Mutex<NarratorStats>>> {
        self.narrators.read().await.get(narrator_id).cloned()
    }

    async fn stats_handle_or_create(&self, narrator_id: &str) -> Arc<Mutex<NarratorStats>> {
        if let Some(handle) = self.narrators.read().await.get(narrator_id) {
            return handle.clone();
        }
        self.narrators
            .write()
            .await
            .entry(narrator_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(NarratorStats::new(narrator_id))))
            .clone()
    }
}

fn validate_id(narrator_id: &str) -> EngineResult<()> {
    if narrator_id.trim().is_empty() {
        return Err(EngineError::Validation("narrator id must not be empty".to_string()));
    }
    Ok(())
}

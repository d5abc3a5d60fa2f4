//! # XP and Levels
//!
//! Experience points are awarded by the XP listener in response to
//! [`LearnEvent`]s, and directly by the achievements service when an
//! achievement unlocks. Every award is appended to `xp_history`.
//!
//! The level is derived from the running total: `level = xp / 100 + 1`.

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::events::{EventHandler, LearnEvent, Notification, NotificationHub};

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Points per activity
pub mod points {
    pub const QUIZ_COMPLETION: i64 = 10;
    pub const PERFECT_SCORE_BONUS: i64 = 25;
    pub const HIGH_SCORE_BONUS: i64 = 15;
    pub const CHECKPOINT_COMPLETION: i64 = 15;
    pub const ROADMAP_COMPLETION: i64 = 50;
    pub const DAILY_LOGIN: i64 = 5;
    pub const STREAK_BONUS_PER_DAY: i64 = 3;
    pub const STREAK_BONUS_CAP: i64 = 30;
    pub const CONTRIBUTION_SUBMITTED: i64 = 20;
    pub const CONTRIBUTION_APPROVED: i64 = 30;
    pub const COMMUNITY_JOINED: i64 = 10;
}

/// Score percentage at or above which a quiz earns the high-score bonus
const HIGH_SCORE_PERCENT: i64 = 80;

/// XP needed per level
pub const XP_PER_LEVEL: i64 = 100;

pub fn level_for(xp: i64) -> i64 {
    xp.max(0) / XP_PER_LEVEL + 1
}

/// Result of a single award
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XpAward {
    pub amount: i64,
    pub new_total: i64,
    pub level: i64,
}

#[derive(Debug, Serialize)]
pub struct XpHistoryEntry {
    pub id: i64,
    pub amount: i64,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: i64,
    pub name: String,
    pub xp: i64,
    pub level: i64,
    pub avatar_id: Option<i64>,
}

/// Credit XP on an open transaction and return the new total, `None` for an
/// unknown user
pub(crate) fn apply_xp(
    tx: &rusqlite::Connection,
    user_id: i64,
    amount: i64,
    reason: &str,
    now: &str,
) -> Result<Option<i64>, rusqlite::Error> {
    let updated = tx.execute(
        "UPDATE users SET xp = xp + ?1, level = (xp + ?1) / 100 + 1, updated_at = ?2 WHERE id = ?3",
        params![amount, now, user_id],
    )?;
    if updated == 0 {
        return Ok(None);
    }
    tx.execute(
        "INSERT INTO xp_history (user_id, amount, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![user_id, amount, reason, now],
    )?;
    tx.query_row("SELECT xp FROM users WHERE id = ?1", [user_id], |r| r.get::<_, i64>(0))
        .optional()
}

/// Awards XP and keeps `users.xp` / `users.level` in step with history
#[derive(Clone)]
pub struct XpService {
    store: Arc<LearnStore>,
    notifications: NotificationHub,
}

impl XpService {
    pub fn new(store: Arc<LearnStore>, notifications: NotificationHub) -> Self {
        Self {
            store,
            notifications,
        }
    }

    /// Add `amount` XP to a user, recording `reason`
    pub async fn award_xp(&self, user_id: i64, amount: i64, reason: &str) -> LearnResult<XpAward> {
        if amount <= 0 {
            return Err(LearnError::invalid("XP amount must be positive"));
        }

        let reason_owned = reason.to_string();
        let now = crate::db::now();
        let new_total = self
            .store
            .with_transaction(move |tx| apply_xp(tx, user_id, amount, &reason_owned, &now))
            .await?
            .ok_or_else(|| LearnError::not_found("User not found"))?;

        let award = XpAward {
            amount,
            new_total,
            level: level_for(new_total),
        };
        self.announce(user_id, &award, reason);
        Ok(award)
    }

    /// Log a committed award and push it to the user's stream
    pub(crate) fn announce(&self, user_id: i64, award: &XpAward, reason: &str) {
        info!("✨ +{} XP to user {} ({})", award.amount, user_id, reason);
        self.notifications.notify(
            user_id,
            Notification::new(
                "xp-awarded",
                json!({
                    "amount": award.amount,
                    "reason": reason,
                    "new_total": award.new_total,
                    "level": award.level,
                }),
            ),
        );
    }

    /// Newest entries first
    pub async fn history(&self, user_id: i64, limit: i64) -> LearnResult<Vec<XpHistoryEntry>> {
        let rows = self
            .store
            .query(
                "SELECT id, amount, reason, created_at FROM xp_history WHERE user_id = ? ORDER BY id DESC LIMIT ?",
                vec![SqlValue::Integer(user_id), SqlValue::Integer(limit)],
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(XpHistoryEntry {
                    id: row.i64_field("id")?,
                    amount: row.i64_field("amount")?,
                    reason: row.str_field("reason")?,
                    created_at: row.str_field("created_at")?,
                })
            })
            .collect()
    }

    pub async fn leaderboard(&self, limit: i64) -> LearnResult<Vec<LeaderboardEntry>> {
        let rows = self
            .store
            .query(
                "SELECT id, name, xp, level, avatar_id FROM users ORDER BY xp DESC, id ASC LIMIT ?",
                vec![SqlValue::Integer(limit)],
            )
            .await?;

        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                Ok(LeaderboardEntry {
                    rank: i + 1,
                    user_id: row.i64_field("id")?,
                    name: row.str_field("name")?,
                    xp: row.i64_field("xp")?,
                    level: row.i64_field("level")?,
                    avatar_id: row.opt_i64("avatar_id"),
                })
            })
            .collect()
    }
}

/// The awards an event earns, as `(amount, reason)` pairs
pub fn awards_for(event: &LearnEvent) -> Vec<(i64, String)> {
    match event {
        LearnEvent::QuizCompleted { score, total, .. } => {
            let mut awards = vec![(points::QUIZ_COMPLETION, "Quiz completion".to_string())];
            if *total > 0 && score >= total {
                awards.push((points::PERFECT_SCORE_BONUS, "Perfect quiz score".to_string()));
            } else if *total > 0 && score * 100 >= HIGH_SCORE_PERCENT * total {
                awards.push((points::HIGH_SCORE_BONUS, "High quiz score".to_string()));
            }
            awards
        }
        LearnEvent::CheckpointCompleted { .. } => {
            vec![(points::CHECKPOINT_COMPLETION, "Checkpoint completion".to_string())]
        }
        LearnEvent::RoadmapCompleted { .. } => {
            vec![(points::ROADMAP_COMPLETION, "Roadmap completion".to_string())]
        }
        LearnEvent::DailyLogin { streak, .. } => {
            let bonus = (streak * points::STREAK_BONUS_PER_DAY).min(points::STREAK_BONUS_CAP);
            vec![(
                points::DAILY_LOGIN + bonus.max(0),
                format!("Daily login (day {} streak)", streak),
            )]
        }
        LearnEvent::ContributionSubmitted { .. } => {
            vec![(points::CONTRIBUTION_SUBMITTED, "Contribution submission".to_string())]
        }
        LearnEvent::ContributionApproved { .. } => {
            vec![(points::CONTRIBUTION_APPROVED, "Contribution approved".to_string())]
        }
        LearnEvent::CommunityJoined { .. } => {
            vec![(points::COMMUNITY_JOINED, "Community joined".to_string())]
        }
        LearnEvent::StreakUpdated { .. } => Vec::new(),
    }
}

/// Turns activity events into XP awards
pub struct XpListener {
    xp: XpService,
}

impl XpListener {
    pub fn new(xp: XpService) -> Self {
        Self { xp }
    }
}

#[async_trait]
impl EventHandler for XpListener {
    fn name(&self) -> &'static str {
        "xp"
    }

    async fn handle(&self, event: &LearnEvent) -> LearnResult<()> {
        for (amount, reason) in awards_for(event) {
            self.xp.award_xp(event.user_id(), amount, &reason).await?;
        }
        Ok(())
    }
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

/// GET /api/xp/history
async fn history_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, LearnError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    debug!("XP history for user {}", user.id);
    let history = state.xp.history(user.id, limit).await?;
    Ok(Json(json!({
        "success": true,
        "data": history
    })))
}

/// GET /api/xp/leaderboard
async fn leaderboard_handler(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, LearnError> {
    let limit = params.limit.unwrap_or(10).clamp(1, 100);
    let board = state.xp.leaderboard(limit).await?;
    Ok(Json(json!({
        "success": true,
        "data": board
    })))
}

pub fn create_xp_router(state: AppState) -> Router {
    Router::new()
        .route("/history", get(history_handler))
        .route("/leaderboard", get(leaderboard_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    async fn service_with_user() -> (XpService, i64) {
        let store = Arc::new(LearnStore::in_memory().await.unwrap());
        let user_id = testing::insert_user(&store, "xp@learn.dev").await;
        (XpService::new(store, NotificationHub::new()), user_id)
    }

    #[test]
    fn test_level_formula() {
        assert_eq!(level_for(0), 1);
        assert_eq!(level_for(99), 1);
        assert_eq!(level_for(100), 2);
        assert_eq!(level_for(250), 3);
    }

    #[test]
    fn test_quiz_awards() {
        let event = |score, total| LearnEvent::QuizCompleted {
            user_id: 1,
            quiz_id: 1,
            score,
            total,
        };
        let sum = |e: &LearnEvent| awards_for(e).iter().map(|(a, _)| a).sum::<i64>();

        assert_eq!(sum(&event(5, 5)), 35);
        assert_eq!(sum(&event(4, 5)), 25);
        assert_eq!(sum(&event(3, 5)), 10);
        assert_eq!(sum(&event(0, 0)), 10);
    }

    #[test]
    fn test_daily_login_bonus_is_capped() {
        let awards = awards_for(&LearnEvent::DailyLogin { user_id: 1, streak: 4 });
        assert_eq!(awards, vec![(17, "Daily login (day 4 streak)".to_string())]);

        let awards = awards_for(&LearnEvent::DailyLogin { user_id: 1, streak: 40 });
        assert_eq!(awards[0].0, 35);
    }

    #[tokio::test]
    async fn test_award_updates_total_level_and_history() {
        let (xp, user_id) = service_with_user().await;

        let first = xp.award_xp(user_id, 60, "Roadmap completion").await.unwrap();
        assert_eq!(first, XpAward { amount: 60, new_total: 60, level: 1 });

        let second = xp.award_xp(user_id, 50, "Checkpoint completion").await.unwrap();
        assert_eq!(second.new_total, 110);
        assert_eq!(second.level, 2);

        let history = xp.history(user_id, 20).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reason, "Checkpoint completion");
    }

    #[tokio::test]
    async fn test_award_rejects_bad_input() {
        let (xp, user_id) = service_with_user().await;
        assert!(matches!(
            xp.award_xp(user_id, 0, "nothing").await,
            Err(LearnError::InvalidPayload(_))
        ));
        assert!(matches!(
            xp.award_xp(9999, 10, "ghost").await,
            Err(LearnError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_and_leaderboard() {
        let (xp, user_id) = service_with_user().await;
        let listener = XpListener::new(xp.clone());

        listener
            .handle(&LearnEvent::CommunityJoined { user_id, community_id: 1 })
            .await
            .unwrap();
        listener
            .handle(&LearnEvent::StreakUpdated { user_id })
            .await
            .unwrap();

        let board = xp.leaderboard(10).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].xp, points::COMMUNITY_JOINED);
        assert_eq!(board[0].rank, 1);
    }
}

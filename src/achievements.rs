//! # Achievements
//!
//! A fixed catalog of twelve achievements. Each is unlocked at most once per
//! user; unlocking grants the achievement's XP and pushes an
//! `achievement-unlocked` notification to the user's stream.

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::events::{EventHandler, LearnEvent, Notification, NotificationHub};
use crate::xp::{apply_xp, level_for, XpAward, XpService};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    response::{sse::Event, IntoResponse, Sse},
    routing::{get, patch, post},
    Json, Router,
};
use futures::stream::Stream;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Outcome of the unlock transaction
enum Grant {
    Granted(i64),
    AlreadyHeld,
    UnknownUser,
}

/// A catalog entry
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Achievement {
    pub id: i64,
    pub name: &'static str,
    pub description: &'static str,
    pub xp: i64,
    pub icon: &'static str,
}

pub const CATALOG: [Achievement; 12] = [
    Achievement { id: 1, name: "First Quiz Completed", description: "Awarded upon completing the first quiz.", xp: 50, icon: "Trophy" },
    Achievement { id: 2, name: "Quiz Enthusiast", description: "Complete 10 quizzes.", xp: 200, icon: "Award" },
    Achievement { id: 3, name: "Quiz Master", description: "Achieve a score of 90% or higher on any quiz.", xp: 150, icon: "Star" },
    Achievement { id: 4, name: "Roadmap Explorer", description: "Complete your first learning roadmap.", xp: 100, icon: "Rocket" },
    Achievement { id: 5, name: "Dedicated Learner", description: "Complete 5 learning roadmaps.", xp: 300, icon: "GraduationCap" },
    Achievement { id: 6, name: "First Contribution", description: "Get your first quiz, resource or project contribution approved.", xp: 75, icon: "FileEdit" },
    Achievement { id: 7, name: "Contributor", description: "Get 10 contributions approved.", xp: 250, icon: "Users" },
    Achievement { id: 8, name: "Community Pillar", description: "Get 50 contributions approved.", xp: 500, icon: "Crown" },
    Achievement { id: 9, name: "Streak Starter", description: "Log in for 3 consecutive days.", xp: 50, icon: "Flame" },
    Achievement { id: 10, name: "Committed Learner", description: "Log in for 7 consecutive days.", xp: 150, icon: "Calendar" },
    Achievement { id: 11, name: "Streak Champion", description: "Log in for 30 consecutive days.", xp: 500, icon: "Medal" },
    Achievement { id: 12, name: "Social Learner", description: "Join 5 communities.", xp: 100, icon: "UserPlus" },
];

// (threshold, achievement id)
const QUIZ_COUNT_TIERS: &[(i64, i64)] = &[(1, 1), (10, 2)];
const QUIZ_SCORE_TIERS: &[(i64, i64)] = &[(90, 3)];
const ROADMAP_TIERS: &[(i64, i64)] = &[(1, 4), (5, 5)];
const CONTRIBUTION_TIERS: &[(i64, i64)] = &[(1, 6), (10, 7), (50, 8)];
const STREAK_TIERS: &[(i64, i64)] = &[(3, 9), (7, 10), (30, 11)];
const COMMUNITY_TIERS: &[(i64, i64)] = &[(5, 12)];

pub fn find(id: i64) -> Option<&'static Achievement> {
    CATALOG.iter().find(|a| a.id == id)
}

/// Catalog entry joined with one user's unlock state
#[derive(Debug, Serialize)]
pub struct UserAchievementView {
    #[serde(flatten)]
    pub achievement: Achievement,
    pub is_unlocked: bool,
    pub unlocked_at: Option<String>,
    pub is_notified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Unlocked {
    pub achievement: Achievement,
    pub unlocked_at: String,
    pub xp: XpAward,
}

#[derive(Clone)]
pub struct AchievementService {
    store: Arc<LearnStore>,
    xp: XpService,
    notifications: NotificationHub,
}

impl AchievementService {
    pub fn new(store: Arc<LearnStore>, xp: XpService, notifications: NotificationHub) -> Self {
        Self {
            store,
            xp,
            notifications,
        }
    }

    /// Upsert the catalog rows
    pub async fn seed_catalog(&self) -> LearnResult<()> {
        for a in CATALOG.iter() {
            self.store
                .execute(
                    "INSERT INTO achievements (id, name, description, xp, icon) VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description,
                     xp = excluded.xp, icon = excluded.icon",
                    vec![
                        SqlValue::Integer(a.id),
                        SqlValue::text(a.name),
                        SqlValue::text(a.description),
                        SqlValue::Integer(a.xp),
                        SqlValue::text(a.icon),
                    ],
                )
                .await?;
        }
        debug!("Achievement catalog seeded ({} entries)", CATALOG.len());
        Ok(())
    }

    /// Unlock an achievement. `None` when the user already holds it.
    ///
    /// The unlock row and the XP grant are written in one transaction, so a
    /// failed grant leaves the achievement locked.
    pub async fn award(&self, user_id: i64, achievement_id: i64) -> LearnResult<Option<Unlocked>> {
        let achievement = *find(achievement_id)
            .ok_or_else(|| LearnError::not_found(format!("Achievement {} not found", achievement_id)))?;

        let unlocked_at = crate::db::now();
        let reason = format!("Achievement: {}", achievement.name);
        let (at, why) = (unlocked_at.clone(), reason.clone());
        let granted = self
            .store
            .with_transaction(move |tx| {
                let exists = tx
                    .query_row("SELECT 1 FROM users WHERE id = ?1", [user_id], |_| Ok(()))
                    .optional()?
                    .is_some();
                if !exists {
                    return Ok(Grant::UnknownUser);
                }
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO user_achievements (user_id, achievement_id, unlocked_at) VALUES (?1, ?2, ?3)",
                    params![user_id, achievement_id, at],
                )?;
                if inserted == 0 {
                    return Ok(Grant::AlreadyHeld);
                }
                // The unlock and its XP commit together
                Ok(match apply_xp(tx, user_id, achievement.xp, &why, &at)? {
                    Some(total) => Grant::Granted(total),
                    None => Grant::UnknownUser,
                })
            })
            .await?;

        let new_total = match granted {
            Grant::Granted(total) => total,
            Grant::AlreadyHeld => return Ok(None),
            Grant::UnknownUser => return Err(LearnError::not_found("User not found")),
        };
        let xp = XpAward {
            amount: achievement.xp,
            new_total,
            level: level_for(new_total),
        };
        self.xp.announce(user_id, &xp, &reason);
        info!("🏆 Achievement '{}' unlocked by user {}", achievement.name, user_id);

        let unlocked = Unlocked {
            achievement,
            unlocked_at,
            xp,
        };
        self.notifications.notify(
            user_id,
            Notification::new("achievement-unlocked", serde_json::to_value(&unlocked)?),
        );
        Ok(Some(unlocked))
    }

    async fn award_tiers(&self, user_id: i64, value: i64, tiers: &[(i64, i64)]) -> LearnResult<Vec<Unlocked>> {
        let mut unlocked = Vec::new();
        for &(threshold, id) in tiers {
            if value >= threshold {
                if let Some(u) = self.award(user_id, id).await? {
                    unlocked.push(u);
                }
            }
        }
        Ok(unlocked)
    }

    /// Quiz achievements; `last_percent` is the score of the attempt just made
    pub async fn check_quiz(&self, user_id: i64, last_percent: i64) -> LearnResult<Vec<Unlocked>> {
        let attempted = self
            .store
            .query_i64(
                "SELECT COUNT(DISTINCT quiz_id) FROM quiz_attempts WHERE user_id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;
        let mut unlocked = self.award_tiers(user_id, attempted, QUIZ_COUNT_TIERS).await?;
        unlocked.extend(self.award_tiers(user_id, last_percent, QUIZ_SCORE_TIERS).await?);
        Ok(unlocked)
    }

    pub async fn check_roadmap(&self, user_id: i64) -> LearnResult<Vec<Unlocked>> {
        let completed = self
            .store
            .query_i64(
                "SELECT COUNT(*) FROM roadmap_members WHERE user_id = ? AND completed_at IS NOT NULL",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;
        self.award_tiers(user_id, completed, ROADMAP_TIERS).await
    }

    pub async fn check_contribution(&self, user_id: i64) -> LearnResult<Vec<Unlocked>> {
        let approved = self
            .store
            .query_i64(
                "SELECT COUNT(*) FROM contributions WHERE requested_by = ? AND status = 'approved'",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;
        self.award_tiers(user_id, approved, CONTRIBUTION_TIERS).await
    }

    pub async fn check_streak(&self, user_id: i64) -> LearnResult<Vec<Unlocked>> {
        let streak = self
            .store
            .query_i64(
                "SELECT current_streak FROM users WHERE id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;
        self.award_tiers(user_id, streak, STREAK_TIERS).await
    }

    pub async fn check_community(&self, user_id: i64) -> LearnResult<Vec<Unlocked>> {
        let joined = self
            .store
            .query_i64(
                "SELECT COUNT(*) FROM community_members WHERE user_id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;
        self.award_tiers(user_id, joined, COMMUNITY_TIERS).await
    }

    /// Run every check; quiz score uses the user's best attempt
    pub async fn check_all(&self, user_id: i64) -> LearnResult<Vec<Unlocked>> {
        let best_percent = self
            .store
            .query_i64(
                "SELECT COALESCE(MAX(score * 100 / total), 0) FROM quiz_attempts WHERE user_id = ? AND total > 0",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;

        let mut unlocked = self.check_quiz(user_id, best_percent).await?;
        unlocked.extend(self.check_roadmap(user_id).await?);
        unlocked.extend(self.check_contribution(user_id).await?);
        unlocked.extend(self.check_streak(user_id).await?);
        unlocked.extend(self.check_community(user_id).await?);
        Ok(unlocked)
    }

    pub async fn list_for_user(&self, user_id: i64) -> LearnResult<Vec<UserAchievementView>> {
        let rows = self
            .store
            .query(
                "SELECT achievement_id, unlocked_at, is_notified FROM user_achievements WHERE user_id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;

        Ok(CATALOG
            .iter()
            .map(|a| {
                let held = rows.iter().find(|r| r.opt_i64("achievement_id") == Some(a.id));
                UserAchievementView {
                    achievement: *a,
                    is_unlocked: held.is_some(),
                    unlocked_at: held.and_then(|r| r.opt_str("unlocked_at")),
                    is_notified: held.map(|r| r.bool_field("is_notified")).unwrap_or(false),
                }
            })
            .collect())
    }

    pub async fn mark_notified(&self, user_id: i64, achievement_id: i64) -> LearnResult<()> {
        let affected = self
            .store
            .execute(
                "UPDATE user_achievements SET is_notified = 1 WHERE user_id = ? AND achievement_id = ?",
                vec![SqlValue::Integer(user_id), SqlValue::Integer(achievement_id)],
            )
            .await?;
        if affected == 0 {
            return Err(LearnError::not_found("Achievement not unlocked"));
        }
        Ok(())
    }

    pub async fn unlocked_count(&self, user_id: i64) -> LearnResult<i64> {
        self.store
            .query_i64(
                "SELECT COUNT(*) FROM user_achievements WHERE user_id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await
    }
}

/// Runs achievement checks in response to activity
pub struct AchievementListener {
    achievements: AchievementService,
}

impl AchievementListener {
    pub fn new(achievements: AchievementService) -> Self {
        Self { achievements }
    }
}

#[async_trait]
impl EventHandler for AchievementListener {
    fn name(&self) -> &'static str {
        "achievements"
    }

    async fn handle(&self, event: &LearnEvent) -> LearnResult<()> {
        let a = &self.achievements;
        match *event {
            LearnEvent::QuizCompleted { user_id, score, total, .. } => {
                let percent = if total > 0 { score * 100 / total } else { 0 };
                a.check_quiz(user_id, percent).await?;
            }
            LearnEvent::RoadmapCompleted { user_id, .. } => {
                a.check_roadmap(user_id).await?;
            }
            LearnEvent::ContributionApproved { user_id, .. } => {
                a.check_contribution(user_id).await?;
            }
            LearnEvent::StreakUpdated { user_id } => {
                a.check_streak(user_id).await?;
            }
            LearnEvent::CommunityJoined { user_id, .. } => {
                a.check_community(user_id).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/achievements
async fn list_handler(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, LearnError> {
    let achievements = state.achievements.list_for_user(user.id).await?;
    Ok(Json(json!({
        "success": true,
        "data": achievements
    })))
}

/// PATCH /api/achievements/:id/notify
async fn notify_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    state.achievements.mark_notified(user.id, id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Achievement marked as notified"
    })))
}

/// POST /api/achievements/check
async fn check_handler(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, LearnError> {
    let unlocked = state.achievements.check_all(user.id).await?;
    Ok(Json(json!({
        "success": true,
        "data": unlocked
    })))
}

/// GET /api/achievements/stream - the caller's notifications as SSE
async fn stream_handler(
    State(state): State<AppState>,
    user: AuthUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("📡 Notification stream opened for user {}", user.id);

    let mut rx = state.notifications.subscribe(user.id);

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data(json!({ "user_id": user.id }).to_string()));

        loop {
            match rx.recv().await {
                Ok(notification) => {
                    yield Ok(Event::default()
                        .event(notification.kind.clone())
                        .data(notification.data.to_string()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    yield Ok(Event::default().event("warning").data(json!({
                        "message": format!("Missed {} notifications", n)
                    }).to_string()));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    )
}

pub fn create_achievements_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_handler))
        .route("/check", post(check_handler))
        .route("/stream", get(stream_handler))
        .route("/:id/notify", patch(notify_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    async fn setup() -> (AchievementService, Arc<LearnStore>, NotificationHub, i64) {
        let store = Arc::new(LearnStore::in_memory().await.unwrap());
        let hub = NotificationHub::new();
        let xp = XpService::new(store.clone(), hub.clone());
        let service = AchievementService::new(store.clone(), xp, hub.clone());
        service.seed_catalog().await.unwrap();
        let user_id = testing::insert_user(&store, "ach@learn.dev").await;
        (service, store, hub, user_id)
    }

    #[tokio::test]
    async fn test_award_once_grants_xp() {
        let (service, store, _, user_id) = setup().await;

        let first = service.award(user_id, 9).await.unwrap().unwrap();
        assert_eq!(first.achievement.name, "Streak Starter");
        assert_eq!(first.xp.new_total, 50);

        assert!(service.award(user_id, 9).await.unwrap().is_none());
        let xp = store
            .query_i64("SELECT xp FROM users WHERE id = ?", vec![SqlValue::Integer(user_id)])
            .await
            .unwrap();
        assert_eq!(xp, 50);
    }

    #[tokio::test]
    async fn test_failed_grant_keeps_achievement_locked() {
        let (service, store, _, user_id) = setup().await;
        store.execute("DROP TABLE xp_history", vec![]).await.unwrap();

        assert!(service.award(user_id, 9).await.is_err());
        let held = store
            .query_i64(
                "SELECT COUNT(*) FROM user_achievements WHERE user_id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await
            .unwrap();
        assert_eq!(held, 0);

        // Once the store recovers the same unlock goes through with its XP
        store.migrate().await.unwrap();
        let unlocked = service.award(user_id, 9).await.unwrap().unwrap();
        assert_eq!(unlocked.xp.new_total, 50);
    }

    #[tokio::test]
    async fn test_unknown_achievement() {
        let (service, _, _, user_id) = setup().await;
        assert!(matches!(service.award(user_id, 99).await, Err(LearnError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_streak_tiers() {
        let (service, store, _, user_id) = setup().await;
        store
            .execute(
                "UPDATE users SET current_streak = 7 WHERE id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await
            .unwrap();

        let unlocked = service.check_streak(user_id).await.unwrap();
        let ids: Vec<i64> = unlocked.iter().map(|u| u.achievement.id).collect();
        assert_eq!(ids, vec![9, 10]);
    }

    #[tokio::test]
    async fn test_listener_quiz_master() {
        let (service, store, _, user_id) = setup().await;
        let quiz = store
            .insert(
                "INSERT INTO quizzes (title, topic, difficulty) VALUES ('Q', 'rust', 'easy')",
                vec![],
            )
            .await
            .unwrap();
        store
            .execute(
                "INSERT INTO quiz_attempts (quiz_id, user_id, score, total) VALUES (?, ?, 9, 10)",
                vec![SqlValue::Integer(quiz), SqlValue::Integer(user_id)],
            )
            .await
            .unwrap();

        let listener = AchievementListener::new(service.clone());
        listener
            .handle(&LearnEvent::QuizCompleted { user_id, quiz_id: quiz, score: 9, total: 10 })
            .await
            .unwrap();

        let views = service.list_for_user(user_id).await.unwrap();
        let unlocked: Vec<i64> = views
            .iter()
            .filter(|v| v.is_unlocked)
            .map(|v| v.achievement.id)
            .collect();
        assert_eq!(unlocked, vec![1, 3]);
        assert_eq!(views.len(), 12);
    }

    #[tokio::test]
    async fn test_mark_notified() {
        let (service, _, _, user_id) = setup().await;
        assert!(matches!(
            service.mark_notified(user_id, 4).await,
            Err(LearnError::NotFound(_))
        ));

        service.award(user_id, 4).await.unwrap();
        service.mark_notified(user_id, 4).await.unwrap();
        let views = service.list_for_user(user_id).await.unwrap();
        assert!(views[3].is_notified);
    }

    #[tokio::test]
    async fn test_unlock_notifies_stream() {
        let (service, _, hub, user_id) = setup().await;
        let mut rx = hub.subscribe(user_id);

        service.award(user_id, 12).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, "xp-awarded");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, "achievement-unlocked");
        assert_eq!(second.data["achievement"]["name"], "Social Learner");
    }
}

//! # Roadmaps
//!
//! AI-generated learning roadmaps made of ordered checkpoints. Users join a
//! roadmap and track their own progress on each checkpoint; see
//! [`crate::progress`] for the rules.
//!
//! ## Endpoints
//!
//! - `POST /api/roadmap/generate` - reuse a matching roadmap or generate one
//! - `GET /api/roadmap/get` - the caller's roadmaps with their progress
//! - `GET /api/roadmap/:id` - one roadmap with the caller's progress
//! - `POST /api/roadmap/checkpoint/status` - move a checkpoint forward
//! - `GET /api/roadmap/:id/leaderboard` - members ranked by progress
//! - `POST /api/roadmap/feedback` - rate a completed checkpoint
//! - `GET /api/roadmap/feedback/checkpoint/:id` - all feedback on a checkpoint
//! - `GET /api/roadmap/feedback/user/:checkpoint_id` - the caller's feedback
//! - `GET /api/feedback/global-summary` - ratings across every roadmap

use crate::ai::{AiClient, GeneratedRoadmap};
use crate::api::AppState;
use crate::auth::AuthUser;
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::events::{EventBus, LearnEvent};
use crate::progress::{self, CheckpointStatus, Progress, TrackedCheckpoint};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Longest accepted topic, in characters
const MAX_TOPIC_LENGTH: usize = 100;

/// Longest accepted feedback comment, in characters
const MAX_COMMENT_LENGTH: usize = 500;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: Option<String>,
    pub difficulty: Option<String>,
    pub tags: Vec<String>,
    pub rank: Option<i64>,
}

/// A checkpoint as seen by one user
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointView {
    pub id: i64,
    pub position: i64,
    pub title: String,
    pub description: String,
    pub total_hours_needed: Option<f64>,
    pub resources: Vec<Resource>,
    pub status: CheckpointStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_time_ms: i64,
    pub is_feedback_completed: bool,
}

/// A roadmap as seen by one user; `total_progress` is that user's percent
#[derive(Debug, Clone, Serialize)]
pub struct RoadmapView {
    pub id: i64,
    pub main_topic: String,
    pub description: String,
    pub total_progress: i64,
    pub overall_progress: i64,
    pub member_count: i64,
    pub created_by: Option<i64>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub checkpoints: Vec<CheckpointView>,
    pub is_existing: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusUpdate {
    pub checkpoint_id: i64,
    pub status: CheckpointStatus,
    pub progress_percent: i64,
    pub roadmap_completed: bool,
    pub checkpoints: Vec<CheckpointView>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: i64,
    pub name: String,
    pub level: i64,
    pub xp: i64,
    pub completed_checkpoints: i64,
    pub total_checkpoints: i64,
    pub progress_percent: i64,
    pub time_spent_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct Feedback {
    pub id: i64,
    pub user_id: i64,
    pub roadmap_id: i64,
    pub checkpoint_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
    pub author_name: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackSummary {
    pub entries: Vec<Feedback>,
    pub average_rating: f64,
    pub count: usize,
}

/// Feedback on one checkpoint across all users
#[derive(Debug, Serialize)]
pub struct CheckpointRating {
    pub checkpoint_id: i64,
    pub title: String,
    pub position: i64,
    pub feedback_count: i64,
    pub average_rating: f64,
    pub assessment: &'static str,
}

/// Feedback on one roadmap, checkpoints in roadmap order
#[derive(Debug, Serialize)]
pub struct RoadmapRating {
    pub roadmap_id: i64,
    pub topic: String,
    pub feedback_count: i64,
    pub average_rating: f64,
    pub checkpoints: Vec<CheckpointRating>,
}

#[derive(Debug, Serialize)]
pub struct RatingBucket {
    pub rating: i64,
    pub count: i64,
    pub percent: f64,
}

/// Every piece of feedback in the system, grouped by roadmap
#[derive(Debug, Serialize)]
pub struct GlobalFeedbackSummary {
    pub generated_at: String,
    pub total_feedback: i64,
    pub roadmap_count: usize,
    pub average_rating: f64,
    pub assessment: &'static str,
    /// Most reviewed roadmap first
    pub roadmaps: Vec<RoadmapRating>,
    /// One bucket per star, 1 through 5
    pub distribution: Vec<RatingBucket>,
}

/// Verbal grade for an average star rating
pub fn assessment(average: f64) -> &'static str {
    match average {
        a if a >= 4.5 => "Excellent",
        a if a >= 3.5 => "Very Good",
        a if a >= 2.5 => "Good",
        a if a >= 1.5 => "Fair",
        _ => "Poor",
    }
}

fn average(sum: i64, count: i64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (sum as f64 / count as f64 * 100.0).round() / 100.0
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub topic: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub roadmap_id: i64,
    pub checkpoint_id: i64,
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub roadmap_id: i64,
    pub checkpoint_id: i64,
    pub rating: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn format_time(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// The caller's progress on every checkpoint of a roadmap, read on the
/// connection that will write the update
fn load_track(
    conn: &rusqlite::Connection,
    user_id: i64,
    roadmap_id: i64,
) -> Result<Vec<TrackedCheckpoint>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.position, p.status, p.started_at, p.completed_at, p.total_time_ms, p.feedback_completed \
         FROM checkpoints c \
         LEFT JOIN checkpoint_progress p ON p.checkpoint_id = c.id AND p.user_id = ?1 \
         WHERE c.roadmap_id = ?2 ORDER BY c.position",
    )?;
    let rows = stmt.query_map(params![user_id, roadmap_id], |row| {
        let status: Option<String> = row.get(2)?;
        Ok(TrackedCheckpoint {
            id: row.get(0)?,
            position: row.get(1)?,
            progress: Progress {
                status: status.and_then(|s| s.parse().ok()).unwrap_or_default(),
                started_at: parse_time(row.get(3)?),
                completed_at: parse_time(row.get(4)?),
                total_time_ms: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                feedback_completed: row.get::<_, Option<bool>>(6)?.unwrap_or(false),
            },
        })
    })?;
    rows.collect()
}

/// Escape LIKE wildcards so a topic matches literally
pub(crate) fn like_pattern(topic: &str) -> String {
    let escaped = topic
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Leaderboard order: percent desc, completed desc, time asc
fn leaderboard_order(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.progress_percent
        .cmp(&a.progress_percent)
        .then(b.completed_checkpoints.cmp(&a.completed_checkpoints))
        .then(a.time_spent_ms.cmp(&b.time_spent_ms))
}

/// Insert a generated roadmap with its checkpoints and resources
fn persist_generated(
    conn: &rusqlite::Connection,
    roadmap: &GeneratedRoadmap,
    user_id: i64,
    now: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO roadmaps (main_topic, description, created_by, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        params![roadmap.main_topic.trim(), roadmap.description.trim(), user_id, now],
    )?;
    let roadmap_id = conn.last_insert_rowid();

    for (i, checkpoint) in roadmap.checkpoints.iter().enumerate() {
        conn.execute(
            "INSERT INTO checkpoints (roadmap_id, position, title, description, total_hours_needed) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                roadmap_id,
                i as i64 + 1,
                checkpoint.title.trim(),
                checkpoint.description,
                checkpoint.total_hours_needed
            ],
        )?;
        let checkpoint_id = conn.last_insert_rowid();

        for resource in &checkpoint.resources {
            conn.execute(
                "INSERT INTO resources (checkpoint_id, name, url, kind, description, difficulty, tags, rank) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    checkpoint_id,
                    resource.name,
                    resource.url,
                    resource.kind,
                    resource.description,
                    resource.difficulty,
                    serde_json::to_string(&resource.tags).unwrap_or_else(|_| "[]".to_string()),
                    resource.rank
                ],
            )?;
        }
    }

    join_roadmap(conn, roadmap_id, user_id, now)?;
    Ok(roadmap_id)
}

/// Add a member and put their first checkpoint in progress. False when
/// already a member.
fn join_roadmap(conn: &rusqlite::Connection, roadmap_id: i64, user_id: i64, now: &str) -> Result<bool, rusqlite::Error> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO roadmap_members (roadmap_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
        params![roadmap_id, user_id, now],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    let first: Option<i64> = conn
        .query_row(
            "SELECT id FROM checkpoints WHERE roadmap_id = ?1 ORDER BY position LIMIT 1",
            [roadmap_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(checkpoint_id) = first {
        conn.execute(
            "INSERT INTO checkpoint_progress (checkpoint_id, user_id, status, started_at) VALUES (?1, ?2, 'in_progress', ?3) \
             ON CONFLICT(checkpoint_id, user_id) DO NOTHING",
            params![checkpoint_id, user_id, now],
        )?;
    }
    Ok(true)
}

fn row_to_feedback(row: &[(String, Value)]) -> LearnResult<Feedback> {
    Ok(Feedback {
        id: row.i64_field("id")?,
        user_id: row.i64_field("user_id")?,
        roadmap_id: row.i64_field("roadmap_id")?,
        checkpoint_id: row.i64_field("checkpoint_id")?,
        rating: row.i64_field("rating")?,
        comment: row.opt_str("comment"),
        author_name: row.opt_str("author_name"),
        created_at: row.str_field("created_at")?,
        updated_at: row.opt_str("updated_at"),
    })
}

// ============================================================================
// RoadmapService Implementation
// ============================================================================

#[derive(Clone)]
pub struct RoadmapService {
    store: Arc<LearnStore>,
    events: EventBus,
    ai: Arc<dyn AiClient>,
}

impl RoadmapService {
    pub fn new(store: Arc<LearnStore>, events: EventBus, ai: Arc<dyn AiClient>) -> Self {
        Self { store, events, ai }
    }

    /// Join an existing roadmap on the topic, or generate a new one.
    /// The flag is true when a new roadmap was created.
    pub async fn generate(&self, user_id: i64, topic: &str) -> LearnResult<(RoadmapView, bool)> {
        let topic = topic.trim();
        if topic.is_empty() || topic.chars().count() > MAX_TOPIC_LENGTH {
            return Err(LearnError::invalid(format!(
                "Topic must be between 1 and {} characters",
                MAX_TOPIC_LENGTH
            )));
        }

        let existing = self
            .store
            .query_one(
                "SELECT id FROM roadmaps WHERE lower(main_topic) LIKE ? ESCAPE '\\' ORDER BY id LIMIT 1",
                vec![SqlValue::text(like_pattern(topic))],
            )
            .await?;

        if let Some(row) = existing {
            let roadmap_id = row.i64_field("id")?;
            let now = crate::db::now();
            let joined = self
                .store
                .with_transaction(move |tx| join_roadmap(tx, roadmap_id, user_id, &now))
                .await?;
            if joined {
                info!("User {} joined existing roadmap {} for '{}'", user_id, roadmap_id, topic);
            }
            let mut view = self.view(user_id, roadmap_id).await?;
            view.is_existing = true;
            return Ok((view, false));
        }

        let generated = self.ai.generate_roadmap(topic).await?;
        crate::ai::validate_roadmap(&generated)?;

        let now = crate::db::now();
        let roadmap_id = self
            .store
            .with_transaction(move |tx| persist_generated(tx, &generated, user_id, &now))
            .await?;
        info!("🗺️ Generated roadmap {} for '{}' (user {})", roadmap_id, topic, user_id);

        Ok((self.view(user_id, roadmap_id).await?, true))
    }

    /// Checkpoints of a roadmap with one user's progress
    pub async fn track(&self, user_id: i64, roadmap_id: i64) -> LearnResult<Vec<CheckpointView>> {
        let rows = self
            .store
            .query(
                "SELECT c.id, c.position, c.title, c.description, c.total_hours_needed, \
                        p.status, p.started_at, p.completed_at, p.total_time_ms, p.feedback_completed \
                 FROM checkpoints c \
                 LEFT JOIN checkpoint_progress p ON p.checkpoint_id = c.id AND p.user_id = ? \
                 WHERE c.roadmap_id = ? ORDER BY c.position",
                vec![SqlValue::Integer(user_id), SqlValue::Integer(roadmap_id)],
            )
            .await?;

        let resource_rows = self
            .store
            .query(
                "SELECT r.* FROM resources r JOIN checkpoints c ON c.id = r.checkpoint_id \
                 WHERE c.roadmap_id = ? ORDER BY r.checkpoint_id, r.rank IS NULL, r.rank, r.id",
                vec![SqlValue::Integer(roadmap_id)],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let id = row.i64_field("id")?;
                let resources = resource_rows
                    .iter()
                    .filter(|r| r.opt_i64("checkpoint_id") == Some(id))
                    .map(|r| {
                        Ok(Resource {
                            id: r.i64_field("id")?,
                            name: r.str_field("name")?,
                            url: r.str_field("url")?,
                            kind: r.str_field("kind")?,
                            description: r.opt_str("description"),
                            difficulty: r.opt_str("difficulty"),
                            tags: r.json_field("tags").unwrap_or_default(),
                            rank: r.opt_i64("rank"),
                        })
                    })
                    .collect::<LearnResult<Vec<_>>>()?;

                let status = row
                    .opt_str("status")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default();

                Ok(CheckpointView {
                    id,
                    position: row.i64_field("position")?,
                    title: row.str_field("title")?,
                    description: row.str_field("description")?,
                    total_hours_needed: row.opt_f64("total_hours_needed"),
                    resources,
                    status,
                    started_at: parse_time(row.opt_str("started_at")),
                    completed_at: parse_time(row.opt_str("completed_at")),
                    total_time_ms: row.opt_i64("total_time_ms").unwrap_or(0),
                    is_feedback_completed: row.bool_field("feedback_completed"),
                })
            })
            .collect()
    }

    pub async fn view(&self, user_id: i64, roadmap_id: i64) -> LearnResult<RoadmapView> {
        let row = self
            .store
            .query_one(
                "SELECT r.*, \
                        (SELECT COUNT(*) FROM roadmap_members m WHERE m.roadmap_id = r.id) AS member_count, \
                        (SELECT completed_at FROM roadmap_members m WHERE m.roadmap_id = r.id AND m.user_id = ?) AS member_completed_at \
                 FROM roadmaps r WHERE r.id = ?",
                vec![SqlValue::Integer(user_id), SqlValue::Integer(roadmap_id)],
            )
            .await?
            .ok_or_else(|| LearnError::not_found("Roadmap not found"))?;

        let checkpoints = self.track(user_id, roadmap_id).await?;
        let completed = checkpoints
            .iter()
            .filter(|c| c.status == CheckpointStatus::Completed)
            .count();

        Ok(RoadmapView {
            id: roadmap_id,
            main_topic: row.str_field("main_topic")?,
            description: row.str_field("description")?,
            total_progress: progress::percent(completed, checkpoints.len()),
            overall_progress: row.opt_i64("total_progress").unwrap_or(0),
            member_count: row.opt_i64("member_count").unwrap_or(0),
            created_by: row.opt_i64("created_by"),
            created_at: row.str_field("created_at")?,
            completed_at: row.opt_str("member_completed_at"),
            checkpoints,
            is_existing: false,
        })
    }

    /// Roadmaps the user has joined, most recent first
    pub async fn for_user(&self, user_id: i64) -> LearnResult<Vec<RoadmapView>> {
        let rows = self
            .store
            .query(
                "SELECT roadmap_id FROM roadmap_members WHERE user_id = ? ORDER BY joined_at DESC, roadmap_id DESC",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(self.view(user_id, row.i64_field("roadmap_id")?).await?);
        }
        Ok(views)
    }

    /// Move one checkpoint of the caller forward
    pub async fn update_status(
        &self,
        user_id: i64,
        roadmap_id: i64,
        checkpoint_id: i64,
        requested: CheckpointStatus,
    ) -> LearnResult<StatusUpdate> {
        self.store
            .query_one("SELECT id FROM roadmaps WHERE id = ?", vec![SqlValue::Integer(roadmap_id)])
            .await?
            .ok_or_else(|| LearnError::not_found("Roadmap not found"))?;
        self.store
            .query_one(
                "SELECT id FROM checkpoints WHERE id = ? AND roadmap_id = ?",
                vec![SqlValue::Integer(checkpoint_id), SqlValue::Integer(roadmap_id)],
            )
            .await?
            .ok_or_else(|| LearnError::not_found("Checkpoint not found"))?;
        self.store
            .query_one(
                "SELECT user_id FROM roadmap_members WHERE roadmap_id = ? AND user_id = ?",
                vec![SqlValue::Integer(roadmap_id), SqlValue::Integer(user_id)],
            )
            .await?
            .ok_or_else(|| LearnError::forbidden("You have not joined this roadmap"))?;

        let now = crate::db::now();
        let (plan, roadmap_completed) = self
            .store
            .with_transaction(move |tx| {
                let track = load_track(tx, user_id, roadmap_id)?;
                let plan = match progress::plan_status_update(&track, checkpoint_id, requested, Utc::now()) {
                    Ok(plan) => plan,
                    Err(e) => return Ok(Err(e)),
                };
                let percent = plan.progress_percent;

                for (id, p) in &plan.changes {
                    tx.execute(
                        "INSERT INTO checkpoint_progress (checkpoint_id, user_id, status, started_at, completed_at, total_time_ms) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                         ON CONFLICT(checkpoint_id, user_id) DO UPDATE SET status = excluded.status, \
                         started_at = excluded.started_at, completed_at = excluded.completed_at, \
                         total_time_ms = excluded.total_time_ms",
                        params![
                            id,
                            user_id,
                            p.status.as_str(),
                            format_time(p.started_at),
                            format_time(p.completed_at),
                            p.total_time_ms
                        ],
                    )?;
                }

                tx.execute(
                    "UPDATE roadmap_members SET progress = ?1 WHERE roadmap_id = ?2 AND user_id = ?3",
                    params![percent, roadmap_id, user_id],
                )?;
                let completed = if percent == 100 {
                    tx.execute(
                        "UPDATE roadmap_members SET completed_at = ?1 \
                         WHERE roadmap_id = ?2 AND user_id = ?3 AND completed_at IS NULL",
                        params![now, roadmap_id, user_id],
                    )? > 0
                } else {
                    false
                };
                tx.execute(
                    "UPDATE roadmaps SET total_progress = \
                     (SELECT COALESCE(SUM(progress) / COUNT(*), 0) FROM roadmap_members WHERE roadmap_id = ?1), \
                     updated_at = ?2 WHERE id = ?1",
                    params![roadmap_id, now],
                )?;
                Ok(Ok((plan, completed)))
            })
            .await??;
        let percent = plan.progress_percent;

        if plan.newly_completed {
            debug!("User {} completed checkpoint {}", user_id, checkpoint_id);
            self.events.publish(LearnEvent::CheckpointCompleted {
                user_id,
                checkpoint_id,
            });
        }
        if roadmap_completed {
            info!("🎉 User {} completed roadmap {}", user_id, roadmap_id);
            self.events.publish(LearnEvent::RoadmapCompleted { user_id, roadmap_id });
        }

        let checkpoints = self.track(user_id, roadmap_id).await?;
        let status = checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .map(|c| c.status)
            .unwrap_or(requested);

        Ok(StatusUpdate {
            checkpoint_id,
            status,
            progress_percent: percent,
            roadmap_completed,
            checkpoints,
        })
    }

    pub async fn leaderboard(&self, roadmap_id: i64) -> LearnResult<Vec<LeaderboardEntry>> {
        self.store
            .query_one("SELECT id FROM roadmaps WHERE id = ?", vec![SqlValue::Integer(roadmap_id)])
            .await?
            .ok_or_else(|| LearnError::not_found("Roadmap not found"))?;

        let total = self
            .store
            .query_i64(
                "SELECT COUNT(*) FROM checkpoints WHERE roadmap_id = ?",
                vec![SqlValue::Integer(roadmap_id)],
            )
            .await?;

        let rows = self
            .store
            .query(
                "SELECT u.id, u.name, u.level, u.xp, \
                        COUNT(p.checkpoint_id) AS completed, \
                        COALESCE(SUM(p.total_time_ms), 0) AS time_spent \
                 FROM roadmap_members m \
                 JOIN users u ON u.id = m.user_id \
                 LEFT JOIN checkpoint_progress p ON p.user_id = m.user_id AND p.status = 'completed' \
                      AND p.checkpoint_id IN (SELECT id FROM checkpoints WHERE roadmap_id = m.roadmap_id) \
                 WHERE m.roadmap_id = ? \
                 GROUP BY u.id",
                vec![SqlValue::Integer(roadmap_id)],
            )
            .await?;

        let mut entries = rows
            .iter()
            .map(|row| {
                let completed = row.i64_field("completed")?;
                let percent = if total > 0 {
                    (completed as f64 * 100.0 / total as f64).round() as i64
                } else {
                    0
                };
                Ok(LeaderboardEntry {
                    rank: 0,
                    user_id: row.i64_field("id")?,
                    name: row.str_field("name")?,
                    level: row.i64_field("level")?,
                    xp: row.i64_field("xp")?,
                    completed_checkpoints: completed,
                    total_checkpoints: total,
                    progress_percent: percent,
                    time_spent_ms: row.i64_field("time_spent")?,
                })
            })
            .collect::<LearnResult<Vec<_>>>()?;

        entries.sort_by(leaderboard_order);
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.rank = i + 1;
        }
        Ok(entries)
    }

    // ========================================================================
    // Feedback
    // ========================================================================

    /// Create or replace the caller's feedback on a completed checkpoint
    pub async fn submit_feedback(&self, user_id: i64, req: FeedbackRequest) -> LearnResult<Feedback> {
        if !(1..=5).contains(&req.rating) {
            return Err(LearnError::invalid("Rating must be between 1 and 5"));
        }
        let comment = req
            .comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if comment.as_ref().map(|c| c.chars().count()).unwrap_or(0) > MAX_COMMENT_LENGTH {
            return Err(LearnError::invalid(format!(
                "Comment must be at most {} characters",
                MAX_COMMENT_LENGTH
            )));
        }

        self.store
            .query_one(
                "SELECT id FROM checkpoints WHERE id = ? AND roadmap_id = ?",
                vec![SqlValue::Integer(req.checkpoint_id), SqlValue::Integer(req.roadmap_id)],
            )
            .await?
            .ok_or_else(|| LearnError::not_found("Checkpoint not found"))?;

        let status = self
            .store
            .query_one(
                "SELECT status FROM checkpoint_progress WHERE checkpoint_id = ? AND user_id = ?",
                vec![SqlValue::Integer(req.checkpoint_id), SqlValue::Integer(user_id)],
            )
            .await?
            .and_then(|r| r.opt_str("status"));
        if status.as_deref() != Some(CheckpointStatus::Completed.as_str()) {
            return Err(LearnError::invalid("Complete the checkpoint before leaving feedback"));
        }

        let now = crate::db::now();
        let (roadmap_id, checkpoint_id, rating) = (req.roadmap_id, req.checkpoint_id, req.rating);
        self.store
            .with_transaction(move |tx| {
                tx.execute(
                    "INSERT INTO feedback (user_id, roadmap_id, checkpoint_id, rating, comment, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(user_id, checkpoint_id) DO UPDATE SET rating = excluded.rating, \
                     comment = excluded.comment, updated_at = ?6",
                    params![user_id, roadmap_id, checkpoint_id, rating, comment, now],
                )?;
                tx.execute(
                    "UPDATE checkpoint_progress SET feedback_completed = 1 WHERE checkpoint_id = ?1 AND user_id = ?2",
                    params![checkpoint_id, user_id],
                )?;
                Ok(())
            })
            .await?;
        info!("User {} rated checkpoint {} with {}", user_id, checkpoint_id, rating);

        self.user_feedback(user_id, checkpoint_id).await
    }

    pub async fn checkpoint_feedback(&self, checkpoint_id: i64) -> LearnResult<FeedbackSummary> {
        let rows = self
            .store
            .query(
                "SELECT f.*, u.name AS author_name FROM feedback f JOIN users u ON u.id = f.user_id \
                 WHERE f.checkpoint_id = ? ORDER BY f.created_at DESC, f.id DESC",
                vec![SqlValue::Integer(checkpoint_id)],
            )
            .await?;
        let entries = rows.iter().map(|r| row_to_feedback(r)).collect::<LearnResult<Vec<_>>>()?;

        let count = entries.len();
        let average_rating = if count > 0 {
            let sum: i64 = entries.iter().map(|f| f.rating).sum();
            (sum as f64 / count as f64 * 10.0).round() / 10.0
        } else {
            0.0
        };
        Ok(FeedbackSummary {
            entries,
            average_rating,
            count,
        })
    }

    pub async fn user_feedback(&self, user_id: i64, checkpoint_id: i64) -> LearnResult<Feedback> {
        let row = self
            .store
            .query_one(
                "SELECT f.*, u.name AS author_name FROM feedback f JOIN users u ON u.id = f.user_id \
                 WHERE f.user_id = ? AND f.checkpoint_id = ?",
                vec![SqlValue::Integer(user_id), SqlValue::Integer(checkpoint_id)],
            )
            .await?
            .ok_or_else(|| LearnError::not_found("Feedback not found"))?;
        row_to_feedback(&row)
    }

    /// Counts and average ratings per roadmap and checkpoint, plus the star
    /// distribution. NotFound when nobody has left feedback yet.
    pub async fn global_feedback_summary(&self) -> LearnResult<GlobalFeedbackSummary> {
        let rows = self
            .store
            .query(
                "SELECT f.roadmap_id, r.main_topic, f.checkpoint_id, c.title, c.position, \
                        COUNT(*) AS feedback_count, SUM(f.rating) AS rating_sum \
                 FROM feedback f \
                 JOIN roadmaps r ON r.id = f.roadmap_id \
                 JOIN checkpoints c ON c.id = f.checkpoint_id \
                 GROUP BY f.roadmap_id, f.checkpoint_id \
                 ORDER BY f.roadmap_id, c.position",
                vec![],
            )
            .await?;
        if rows.is_empty() {
            return Err(LearnError::not_found("No feedback found in the system"));
        }

        let mut roadmaps: Vec<(RoadmapRating, i64)> = Vec::new();
        for row in &rows {
            let roadmap_id = row.i64_field("roadmap_id")?;
            let count = row.i64_field("feedback_count")?;
            let sum = row.i64_field("rating_sum")?;
            let avg = average(sum, count);
            let checkpoint = CheckpointRating {
                checkpoint_id: row.i64_field("checkpoint_id")?,
                title: row.str_field("title")?,
                position: row.i64_field("position")?,
                feedback_count: count,
                average_rating: avg,
                assessment: assessment(avg),
            };

            match roadmaps.last_mut() {
                Some((roadmap, total)) if roadmap.roadmap_id == roadmap_id => {
                    roadmap.feedback_count += count;
                    *total += sum;
                    roadmap.checkpoints.push(checkpoint);
                }
                _ => roadmaps.push((
                    RoadmapRating {
                        roadmap_id,
                        topic: row.str_field("main_topic")?,
                        feedback_count: count,
                        average_rating: 0.0,
                        checkpoints: vec![checkpoint],
                    },
                    sum,
                )),
            }
        }

        let total_feedback: i64 = roadmaps.iter().map(|(r, _)| r.feedback_count).sum();
        let rating_sum: i64 = roadmaps.iter().map(|(_, sum)| sum).sum();
        let mut roadmaps: Vec<RoadmapRating> = roadmaps
            .into_iter()
            .map(|(mut roadmap, sum)| {
                roadmap.average_rating = average(sum, roadmap.feedback_count);
                roadmap
            })
            .collect();
        roadmaps.sort_by(|a, b| b.feedback_count.cmp(&a.feedback_count));

        let counts = self
            .store
            .query("SELECT rating, COUNT(*) AS n FROM feedback GROUP BY rating", vec![])
            .await?;
        let mut distribution = Vec::with_capacity(5);
        for rating in 1..=5 {
            let mut count = 0;
            for row in &counts {
                if row.i64_field("rating")? == rating {
                    count = row.i64_field("n")?;
                }
            }
            distribution.push(RatingBucket {
                rating,
                count,
                percent: (count as f64 * 1000.0 / total_feedback as f64).round() / 10.0,
            });
        }

        let average_rating = average(rating_sum, total_feedback);
        Ok(GlobalFeedbackSummary {
            generated_at: crate::db::now(),
            total_feedback,
            roadmap_count: roadmaps.len(),
            average_rating,
            assessment: assessment(average_rating),
            roadmaps,
            distribution,
        })
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /api/roadmap/generate
async fn generate_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let (roadmap, created) = state.roadmaps.generate(user.id, &req.topic).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(json!({
            "success": true,
            "data": roadmap
        })),
    ))
}

/// GET /api/roadmap/get
async fn list_handler(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, LearnError> {
    let roadmaps = state.roadmaps.for_user(user.id).await?;
    Ok(Json(json!({
        "success": true,
        "data": roadmaps
    })))
}

/// GET /api/roadmap/:id
async fn get_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let roadmap = state.roadmaps.view(user.id, id).await?;
    Ok(Json(json!({
        "success": true,
        "data": roadmap
    })))
}

/// POST /api/roadmap/checkpoint/status
async fn status_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let requested: CheckpointStatus = req.status.parse().map_err(LearnError::InvalidPayload)?;
    let update = state
        .roadmaps
        .update_status(user.id, req.roadmap_id, req.checkpoint_id, requested)
        .await?;
    Ok(Json(json!({
        "success": true,
        "data": update
    })))
}

/// GET /api/roadmap/:id/leaderboard
async fn leaderboard_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let board = state.roadmaps.leaderboard(id).await?;
    Ok(Json(json!({
        "success": true,
        "data": board
    })))
}

/// POST /api/roadmap/feedback
async fn feedback_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let feedback = state.roadmaps.submit_feedback(user.id, req).await?;
    Ok(Json(json!({
        "success": true,
        "data": feedback,
        "message": "Feedback saved"
    })))
}

/// GET /api/roadmap/feedback/checkpoint/:id
async fn checkpoint_feedback_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let summary = state.roadmaps.checkpoint_feedback(id).await?;
    Ok(Json(json!({
        "success": true,
        "data": summary
    })))
}

/// GET /api/roadmap/feedback/user/:checkpoint_id
async fn user_feedback_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(checkpoint_id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let feedback = state.roadmaps.user_feedback(user.id, checkpoint_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": feedback
    })))
}

/// GET /api/feedback/global-summary
async fn global_feedback_handler(State(state): State<AppState>) -> Result<impl IntoResponse, LearnError> {
    let summary = state.roadmaps.global_feedback_summary().await?;
    Ok(Json(json!({
        "success": true,
        "data": summary
    })))
}

/// Mounted at `/api/feedback`
pub fn create_feedback_router(state: AppState) -> Router {
    Router::new()
        .route("/global-summary", get(global_feedback_handler))
        .with_state(state)
}

pub fn create_roadmap_router(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/get", get(list_handler))
        .route("/checkpoint/status", post(status_handler))
        .route("/feedback", post(feedback_handler))
        .route("/feedback/checkpoint/:id", get(checkpoint_feedback_handler))
        .route("/feedback/user/:checkpoint_id", get(user_feedback_handler))
        .route("/:id", get(get_handler))
        .route("/:id/leaderboard", get(leaderboard_handler))
        .with_state(state)
}

//! # Checkpoint Progress
//!
//! Per-user progress state machine for roadmap checkpoints. Everything here is
//! pure: handlers load the caller's progress rows, plan the update, then write
//! the resulting changes in one transaction.
//!
//! ```text
//! not_started ──► in_progress ──► completed
//!      └──────────────────────────────▲
//! ```
//!
//! A checkpoint can only be completed once the checkpoint before it (by
//! position) is completed. Completing a checkpoint unlocks the next one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Status of one checkpoint for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::NotStarted => "not_started",
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    /// Accepts `in_progress`, `in-progress` and `In Progress` spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c.to_ascii_lowercase() })
            .collect();
        match normalized.as_str() {
            "not_started" => Ok(CheckpointStatus::NotStarted),
            "in_progress" => Ok(CheckpointStatus::InProgress),
            "completed" => Ok(CheckpointStatus::Completed),
            _ => Err(format!("Unknown checkpoint status: {}", s)),
        }
    }
}

/// Rejected status change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Cannot change status from 'In Progress' back to 'Not Started'")]
    BackToNotStarted,

    #[error("Cannot change status from 'Completed' to a previous status")]
    CompletedIsFinal,

    #[error("Complete the previous checkpoint first")]
    PreviousNotCompleted,

    #[error("Checkpoint {0} is not part of this roadmap")]
    UnknownCheckpoint(i64),
}

/// One user's progress on one checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub status: CheckpointStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_time_ms: i64,
    pub feedback_completed: bool,
}

impl Progress {
    /// Move to `to`, stamping times. Returns false when already there.
    pub fn advance(&mut self, to: CheckpointStatus, now: DateTime<Utc>) -> bool {
        if self.status == to {
            return false;
        }
        match to {
            CheckpointStatus::NotStarted => {}
            CheckpointStatus::InProgress => {
                self.started_at = Some(now);
            }
            CheckpointStatus::Completed => {
                self.completed_at = Some(now);
                if let Some(started) = self.started_at {
                    self.total_time_ms = (now - started).num_milliseconds().max(0);
                }
            }
        }
        self.status = to;
        true
    }

    pub fn is_completed(&self) -> bool {
        self.status == CheckpointStatus::Completed
    }
}

/// Validate a requested status change
pub fn check_transition(
    from: CheckpointStatus,
    to: CheckpointStatus,
    previous_completed: bool,
) -> Result<(), TransitionError> {
    use CheckpointStatus::*;

    if from == to {
        return Ok(());
    }
    match (from, to) {
        (Completed, _) => Err(TransitionError::CompletedIsFinal),
        (InProgress, NotStarted) => Err(TransitionError::BackToNotStarted),
        (_, Completed) if !previous_completed => Err(TransitionError::PreviousNotCompleted),
        _ => Ok(()),
    }
}

/// A checkpoint with the caller's progress on it
#[derive(Debug, Clone)]
pub struct TrackedCheckpoint {
    pub id: i64,
    pub position: i64,
    pub progress: Progress,
}

/// Outcome of [`plan_status_update`]
#[derive(Debug, Clone, Default)]
pub struct StatusPlan {
    /// Checkpoints whose progress changed, with their new state
    pub changes: Vec<(i64, Progress)>,
    /// The requested checkpoint became completed with this update
    pub newly_completed: bool,
    /// The user's completion percentage after the update
    pub progress_percent: i64,
}

/// `floor(completed * 100 / total)`, zero for an empty roadmap
pub fn percent(completed: usize, total: usize) -> i64 {
    if total == 0 {
        return 0;
    }
    (completed * 100 / total) as i64
}

/// Plan a status change on `checkpoint_id` across the caller's roadmap track
pub fn plan_status_update(
    track: &[TrackedCheckpoint],
    checkpoint_id: i64,
    requested: CheckpointStatus,
    now: DateTime<Utc>,
) -> Result<StatusPlan, TransitionError> {
    let target = track
        .iter()
        .find(|c| c.id == checkpoint_id)
        .ok_or(TransitionError::UnknownCheckpoint(checkpoint_id))?;

    let previous_completed = track
        .iter()
        .find(|c| c.position == target.position - 1)
        .map(|c| c.progress.is_completed())
        .unwrap_or(true);

    check_transition(target.progress.status, requested, previous_completed)?;

    let mut changes = Vec::new();
    let mut progress = target.progress.clone();
    let newly_completed = progress.advance(requested, now) && progress.is_completed();
    if progress != target.progress {
        changes.push((target.id, progress));
    }

    if newly_completed {
        if let Some(next) = track.iter().find(|c| c.position == target.position + 1) {
            if next.progress.status == CheckpointStatus::NotStarted {
                let mut unlocked = next.progress.clone();
                unlocked.advance(CheckpointStatus::InProgress, now);
                changes.push((next.id, unlocked));
            }
        }
    }

    let completed = track
        .iter()
        .filter(|c| {
            changes
                .iter()
                .find(|(id, _)| *id == c.id)
                .map(|(_, p)| p.is_completed())
                .unwrap_or_else(|| c.progress.is_completed())
        })
        .count();

    Ok(StatusPlan {
        changes,
        newly_completed,
        progress_percent: percent(completed, track.len()),
    })
}

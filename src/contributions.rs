//! # Contributions
//!
//! Users propose quizzes, resources and projects; admins approve or reject
//! them. Only pending contributions can be reviewed.
//!
//! ## Endpoints
//!
//! - `POST /api/request/contribute` - submit a contribution
//! - `GET /api/request/my-contributions` - the caller's contributions
//! - `GET /api/admin/requests` - every contribution (admin)
//! - `PUT /api/admin/requests/:id/approve` - approve (admin)
//! - `PUT /api/admin/requests/:id/reject` - reject with feedback (admin)

use crate::api::AppState;
use crate::auth::{AdminUser, AuthUser};
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::events::{EventBus, LearnEvent};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionKind {
    Quiz,
    Resource,
    Project,
}

impl ContributionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionKind::Quiz => "quiz",
            ContributionKind::Resource => "resource",
            ContributionKind::Project => "project",
        }
    }
}

impl FromStr for ContributionKind {
    type Err = LearnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "quiz" => Ok(ContributionKind::Quiz),
            "resource" => Ok(ContributionKind::Resource),
            "project" => Ok(ContributionKind::Project),
            _ => Err(LearnError::invalid(
                "Invalid contribution type. Must be quiz, resource or project",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionStatus {
    Pending,
    Approved,
    Rejected,
}

impl ContributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionStatus::Pending => "pending",
            ContributionStatus::Approved => "approved",
            ContributionStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContributionStatus {
    type Err = LearnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ContributionStatus::Pending),
            "approved" => Ok(ContributionStatus::Approved),
            "rejected" => Ok(ContributionStatus::Rejected),
            other => Err(LearnError::invalid(format!("Unknown status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Contribution {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ContributionKind,
    pub payload: Value,
    pub requested_by: i64,
    pub requester_name: Option<String>,
    pub status: ContributionStatus,
    pub feedback: Option<String>,
    pub created_at: String,
    pub reviewed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContributeRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusFilter {
    #[serde(default)]
    pub status: Option<String>,
}

fn row_to_contribution(row: &[(String, Value)]) -> LearnResult<Contribution> {
    Ok(Contribution {
        id: row.i64_field("id")?,
        kind: row.str_field("kind")?.parse()?,
        payload: row.json_field("payload").unwrap_or(Value::Null),
        requested_by: row.i64_field("requested_by")?,
        requester_name: row.opt_str("requester_name"),
        status: row.str_field("status")?.parse()?,
        feedback: row.opt_str("feedback"),
        created_at: row.str_field("created_at")?,
        reviewed_at: row.opt_str("reviewed_at"),
    })
}

const CONTRIBUTION_SELECT: &str =
    "SELECT c.*, u.name AS requester_name FROM contributions c LEFT JOIN users u ON u.id = c.requested_by";

// ============================================================================
// ContributionService Implementation
// ============================================================================

#[derive(Clone)]
pub struct ContributionService {
    store: Arc<LearnStore>,
    events: EventBus,
}

impl ContributionService {
    pub fn new(store: Arc<LearnStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn submit(&self, user_id: i64, req: ContributeRequest) -> LearnResult<Contribution> {
        let kind: ContributionKind = req.kind.parse()?;
        let payload = if req.payload.is_null() { json!({}) } else { req.payload };

        let id = self
            .store
            .insert(
                "INSERT INTO contributions (kind, payload, requested_by, created_at) VALUES (?, ?, ?, ?)",
                vec![
                    SqlValue::text(kind.as_str()),
                    SqlValue::text(payload.to_string()),
                    SqlValue::Integer(user_id),
                    SqlValue::text(crate::db::now()),
                ],
            )
            .await?;

        info!("📬 User {} submitted {} contribution {}", user_id, kind.as_str(), id);
        self.events.publish(LearnEvent::ContributionSubmitted {
            user_id,
            contribution_id: id,
        });
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> LearnResult<Contribution> {
        let row = self
            .store
            .query_one(format!("{} WHERE c.id = ?", CONTRIBUTION_SELECT), vec![SqlValue::Integer(id)])
            .await?
            .ok_or_else(|| LearnError::not_found("Contribution not found"))?;
        row_to_contribution(&row)
    }

    pub async fn for_user(&self, user_id: i64) -> LearnResult<Vec<Contribution>> {
        let rows = self
            .store
            .query(
                format!("{} WHERE c.requested_by = ? ORDER BY c.created_at DESC, c.id DESC", CONTRIBUTION_SELECT),
                vec![SqlValue::Integer(user_id)],
            )
            .await?;
        rows.iter().map(|r| row_to_contribution(r)).collect()
    }

    /// Every contribution, newest first, optionally by status
    pub async fn list(&self, status: Option<ContributionStatus>) -> LearnResult<Vec<Contribution>> {
        let status = status.map(|s| s.as_str());
        let rows = self
            .store
            .query(
                format!(
                    "{} WHERE (?1 IS NULL OR c.status = ?1) ORDER BY c.created_at DESC, c.id DESC",
                    CONTRIBUTION_SELECT
                ),
                vec![SqlValue::opt_text(status)],
            )
            .await?;
        rows.iter().map(|r| row_to_contribution(r)).collect()
    }

    async fn review(&self, id: i64, status: ContributionStatus, feedback: Option<String>) -> LearnResult<Contribution> {
        let current = self.get(id).await?;
        if current.status != ContributionStatus::Pending {
            return Err(LearnError::conflict(format!(
                "Contribution has already been {}",
                current.status
            )));
        }

        let updated = self
            .store
            .execute(
                "UPDATE contributions SET status = ?, feedback = ?, reviewed_at = ? WHERE id = ? AND status = 'pending'",
                vec![
                    SqlValue::text(status.as_str()),
                    SqlValue::opt_text(feedback),
                    SqlValue::text(crate::db::now()),
                    SqlValue::Integer(id),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(LearnError::conflict("Contribution has already been reviewed"));
        }
        self.get(id).await
    }

    pub async fn approve(&self, id: i64) -> LearnResult<Contribution> {
        let contribution = self.review(id, ContributionStatus::Approved, None).await?;
        info!("✅ Contribution {} approved", id);
        self.events.publish(LearnEvent::ContributionApproved {
            user_id: contribution.requested_by,
            contribution_id: id,
        });
        Ok(contribution)
    }

    pub async fn reject(&self, id: i64, feedback: Option<String>) -> LearnResult<Contribution> {
        let feedback = feedback
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .ok_or_else(|| LearnError::invalid("Feedback is required when rejecting"))?;
        let contribution = self.review(id, ContributionStatus::Rejected, Some(feedback)).await?;
        info!("Contribution {} rejected", id);
        Ok(contribution)
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /api/request/contribute
async fn contribute_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ContributeRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let contribution = state.contributions.submit(user.id, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": contribution,
            "message": "Contribution request submitted"
        })),
    ))
}

/// GET /api/request/my-contributions
async fn mine_handler(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, LearnError> {
    let contributions = state.contributions.for_user(user.id).await?;
    Ok(Json(json!({
        "success": true,
        "count": contributions.len(),
        "data": contributions
    })))
}

/// GET /api/admin/requests
async fn all_handler(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filter): Query<StatusFilter>,
) -> Result<impl IntoResponse, LearnError> {
    let status = filter.status.as_deref().map(str::parse::<ContributionStatus>).transpose()?;
    let contributions = state.contributions.list(status).await?;
    Ok(Json(json!({
        "success": true,
        "count": contributions.len(),
        "data": contributions
    })))
}

/// PUT /api/admin/requests/:id/approve
async fn approve_handler(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let contribution = state.contributions.approve(id).await?;
    info!("Reviewed by admin {}", admin.id);
    Ok(Json(json!({
        "success": true,
        "data": contribution
    })))
}

/// PUT /api/admin/requests/:id/reject
async fn reject_handler(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    Json(req): Json<RejectRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let contribution = state.contributions.reject(id, req.feedback).await?;
    info!("Reviewed by admin {}", admin.id);
    Ok(Json(json!({
        "success": true,
        "data": contribution
    })))
}

pub fn create_request_router(state: AppState) -> Router {
    Router::new()
        .route("/contribute", post(contribute_handler))
        .route("/my-contributions", get(mine_handler))
        .with_state(state)
}

pub fn create_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/requests", get(all_handler))
        .route("/requests/:id/approve", put(approve_handler))
        .route("/requests/:id/reject", put(reject_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    async fn setup() -> (ContributionService, EventBus, i64) {
        let store = Arc::new(LearnStore::in_memory().await.unwrap());
        let events = EventBus::new();
        let user = testing::insert_user(&store, "helper@learn.dev").await;
        (ContributionService::new(store, events.clone()), events, user)
    }

    fn request(kind: &str) -> ContributeRequest {
        ContributeRequest {
            kind: kind.to_string(),
            payload: json!({ "title": "Ownership in depth" }),
        }
    }

    #[tokio::test]
    async fn test_submit_validates_type() {
        let (service, events, user) = setup().await;
        let mut rx = events.subscribe();

        let contribution = service.submit(user, request("Resource")).await.unwrap();
        assert_eq!(contribution.kind, ContributionKind::Resource);
        assert_eq!(contribution.status, ContributionStatus::Pending);
        assert_eq!(contribution.payload["title"], "Ownership in depth");
        assert_eq!(
            rx.recv().await.unwrap(),
            LearnEvent::ContributionSubmitted { user_id: user, contribution_id: contribution.id }
        );

        assert!(matches!(
            service.submit(user, request("video")).await,
            Err(LearnError::InvalidPayload(_))
        ));
        assert_eq!(service.for_user(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_review_flow() {
        let (service, events, user) = setup().await;
        let first = service.submit(user, request("quiz")).await.unwrap();
        let second = service.submit(user, request("project")).await.unwrap();
        let mut rx = events.subscribe();

        let approved = service.approve(first.id).await.unwrap();
        assert_eq!(approved.status, ContributionStatus::Approved);
        assert!(approved.reviewed_at.is_some());
        assert!(matches!(rx.recv().await.unwrap(), LearnEvent::ContributionApproved { .. }));

        assert!(matches!(service.approve(first.id).await, Err(LearnError::Conflict(_))));
        assert!(matches!(
            service.reject(second.id, Some("  ".to_string())).await,
            Err(LearnError::InvalidPayload(_))
        ));

        let rejected = service.reject(second.id, Some("Needs sources".to_string())).await.unwrap();
        assert_eq!(rejected.feedback.as_deref(), Some("Needs sources"));

        let pending = service.list(Some(ContributionStatus::Pending)).await.unwrap();
        assert!(pending.is_empty());
        assert_eq!(service.list(None).await.unwrap().len(), 2);
        assert!(matches!(service.approve(999).await, Err(LearnError::NotFound(_))));
    }
}

//! # Communities
//!
//! Topic communities that users join and post into.

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::db::{json_to_sql_value, LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::events::{EventBus, LearnEvent};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

const SUMMARY_SQL: &str = "SELECT c.id, c.name, c.description, c.domain, c.tags, c.created_by, c.created_at, \
     (SELECT COUNT(*) FROM community_members m WHERE m.community_id = c.id) AS member_count \
     FROM communities c";

#[derive(Debug, Deserialize)]
pub struct CreateCommunityRequest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Community {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub domain: Option<String>,
    pub tags: Vec<String>,
    pub created_by: Option<i64>,
    pub member_count: i64,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct CommunityDetail {
    #[serde(flatten)]
    pub community: Community,
    pub creator: Option<Value>,
    pub is_member: bool,
}

fn row_to_community(row: &[(String, Value)]) -> LearnResult<Community> {
    Ok(Community {
        id: row.i64_field("id")?,
        name: row.str_field("name")?,
        description: row.str_field("description")?,
        domain: row.opt_str("domain"),
        tags: row.json_field("tags").unwrap_or_default(),
        created_by: row.opt_i64("created_by"),
        member_count: row.opt_i64("member_count").unwrap_or(0),
        created_at: row.str_field("created_at")?,
    })
}

#[derive(Clone)]
pub struct CommunityService {
    store: Arc<LearnStore>,
    events: EventBus,
}

impl CommunityService {
    pub fn new(store: Arc<LearnStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Create a community; the creator becomes its first member
    pub async fn create(&self, user_id: i64, req: CreateCommunityRequest) -> LearnResult<Community> {
        let name = req.name.trim();
        let description = req.description.trim();
        if name.is_empty() || description.is_empty() {
            return Err(LearnError::invalid("Name and description are required"));
        }

        let existing = self
            .store
            .query_one("SELECT id FROM communities WHERE name = ?", vec![SqlValue::text(name)])
            .await?;
        if existing.is_some() {
            return Err(LearnError::conflict("Community with this name already exists"));
        }

        let tags: Vec<String> = req
            .tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let id = self
            .store
            .insert(
                "INSERT INTO communities (name, description, domain, tags, created_by) VALUES (?, ?, ?, ?, ?)",
                vec![
                    SqlValue::text(name),
                    SqlValue::text(description),
                    SqlValue::opt_text(req.domain.filter(|d| !d.trim().is_empty())),
                    json_to_sql_value(&json!(tags)),
                    SqlValue::Integer(user_id),
                ],
            )
            .await?;
        info!("🏘️ Community '{}' created by user {}", name, user_id);

        self.join(user_id, id).await?;
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> LearnResult<Community> {
        let row = self
            .store
            .query_one(format!("{} WHERE c.id = ?", SUMMARY_SQL), vec![SqlValue::Integer(id)])
            .await?
            .ok_or_else(|| LearnError::not_found("Community not found"))?;
        row_to_community(&row)
    }

    pub async fn detail(&self, id: i64, viewer: Option<i64>) -> LearnResult<CommunityDetail> {
        let community = self.get(id).await?;

        let creator = match community.created_by {
            Some(creator_id) => self
                .store
                .query_one(
                    "SELECT id, name, avatar_id FROM users WHERE id = ?",
                    vec![SqlValue::Integer(creator_id)],
                )
                .await?
                .map(|row| Value::Object(row.into_iter().collect())),
            None => None,
        };

        let is_member = match viewer {
            Some(user_id) => self.is_member(user_id, id).await?,
            None => false,
        };

        Ok(CommunityDetail {
            community,
            creator,
            is_member,
        })
    }

    pub async fn list(&self) -> LearnResult<Vec<Community>> {
        let rows = self
            .store
            .query(format!("{} ORDER BY c.created_at DESC, c.id DESC", SUMMARY_SQL), vec![])
            .await?;
        rows.iter().map(|r| row_to_community(r)).collect()
    }

    /// Case-insensitive match over name, description, domain and tags
    pub async fn search(&self, q: &str) -> LearnResult<Vec<Community>> {
        let q = q.trim();
        if q.is_empty() {
            return self.list().await;
        }
        let pattern = format!("%{}%", q.to_lowercase());
        let rows = self
            .store
            .query(
                format!(
                    "{} WHERE lower(c.name) LIKE ?1 OR lower(c.description) LIKE ?1 \
                     OR lower(COALESCE(c.domain, '')) LIKE ?1 OR lower(c.tags) LIKE ?1 \
                     ORDER BY c.name",
                    SUMMARY_SQL
                ),
                vec![SqlValue::text(pattern)],
            )
            .await?;
        debug!("Community search '{}' matched {}", q, rows.len());
        rows.iter().map(|r| row_to_community(r)).collect()
    }

    pub async fn is_member(&self, user_id: i64, community_id: i64) -> LearnResult<bool> {
        let count = self
            .store
            .query_i64(
                "SELECT COUNT(*) FROM community_members WHERE community_id = ? AND user_id = ?",
                vec![SqlValue::Integer(community_id), SqlValue::Integer(user_id)],
            )
            .await?;
        Ok(count > 0)
    }

    /// Join a community. Returns false when already a member.
    pub async fn join(&self, user_id: i64, community_id: i64) -> LearnResult<bool> {
        self.ensure_exists(community_id).await?;

        let inserted = self
            .store
            .execute(
                "INSERT OR IGNORE INTO community_members (community_id, user_id) VALUES (?, ?)",
                vec![SqlValue::Integer(community_id), SqlValue::Integer(user_id)],
            )
            .await?;
        if inserted == 0 {
            return Ok(false);
        }

        info!("User {} joined community {}", user_id, community_id);
        self.events.publish(LearnEvent::CommunityJoined {
            user_id,
            community_id,
        });
        Ok(true)
    }

    /// Leave a community. Returns false when not a member.
    pub async fn leave(&self, user_id: i64, community_id: i64) -> LearnResult<bool> {
        self.ensure_exists(community_id).await?;

        let removed = self
            .store
            .execute(
                "DELETE FROM community_members WHERE community_id = ? AND user_id = ?",
                vec![SqlValue::Integer(community_id), SqlValue::Integer(user_id)],
            )
            .await?;
        Ok(removed > 0)
    }

    /// Communities a user belongs to
    pub async fn for_user(&self, user_id: i64) -> LearnResult<Vec<Community>> {
        let rows = self
            .store
            .query(
                format!(
                    "{} JOIN community_members cm ON cm.community_id = c.id WHERE cm.user_id = ? ORDER BY cm.joined_at",
                    SUMMARY_SQL
                ),
                vec![SqlValue::Integer(user_id)],
            )
            .await?;
        rows.iter().map(|r| row_to_community(r)).collect()
    }

    async fn ensure_exists(&self, community_id: i64) -> LearnResult<()> {
        let exists = self
            .store
            .query_one("SELECT id FROM communities WHERE id = ?", vec![SqlValue::Integer(community_id)])
            .await?;
        if exists.is_none() {
            return Err(LearnError::not_found("Community not found"));
        }
        Ok(())
    }
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

/// POST /api/community/create
async fn create_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateCommunityRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let community = state.communities.create(user.id, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": community
        })),
    ))
}

/// GET /api/community
async fn list_handler(State(state): State<AppState>) -> Result<impl IntoResponse, LearnError> {
    let communities = state.communities.list().await?;
    Ok(Json(json!({
        "success": true,
        "data": communities,
        "count": communities.len()
    })))
}

/// GET /api/community/search?q=
async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, LearnError> {
    let communities = state.communities.search(&params.q).await?;
    Ok(Json(json!({
        "success": true,
        "data": communities
    })))
}

/// GET /api/community/:id
async fn get_handler(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let detail = state.communities.detail(id, user.map(|u| u.id)).await?;
    Ok(Json(json!({
        "success": true,
        "data": detail
    })))
}

/// POST /api/community/:id/join
async fn join_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let joined = state.communities.join(user.id, id).await?;
    Ok(Json(json!({
        "success": true,
        "data": { "joined": joined }
    })))
}

/// POST /api/community/:id/leave
async fn leave_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let left = state.communities.leave(user.id, id).await?;
    Ok(Json(json!({
        "success": true,
        "data": { "left": left }
    })))
}

pub fn create_community_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_handler))
        .route("/create", post(create_handler))
        .route("/search", get(search_handler))
        .route("/:id", get(get_handler))
        .route("/:id/join", post(join_handler))
        .route("/:id/leave", post(leave_handler))
        .with_state(state)
}

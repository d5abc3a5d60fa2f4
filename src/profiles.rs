//! # Public Profiles
//!
//! Read-only pages about a user, visible without signing in. Nothing here
//! exposes e-mail addresses or password hashes.

use crate::api::{AppState, PageParams};
use crate::db::{RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::posts;
use crate::roadmaps::{like_pattern, RoadmapView};

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Default page size of a profile's roadmaps
pub const ROADMAPS_PAGE_SIZE: i64 = 4;

/// Default page size of a profile's posts
pub const POSTS_PAGE_SIZE: i64 = 3;

/// Most users a search returns
pub const SEARCH_LIMIT: i64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct CommunityRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct PublicProfile {
    pub id: i64,
    pub name: String,
    pub level: i64,
    pub xp: i64,
    pub avg_quiz_score: f64,
    pub current_streak: i64,
    pub max_streak: i64,
    pub last_login_date: Option<String>,
    pub avatar_id: Option<i64>,
    pub created_at: String,
    pub communities: Vec<CommunityRef>,
    pub achievement_count: i64,
}

#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
    pub level: i64,
    pub avatar_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RoadmapPage {
    pub roadmaps: Vec<RoadmapView>,
    pub total: i64,
    pub total_pages: i64,
    pub current_page: i64,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

async fn require_user(state: &AppState, user_id: i64) -> LearnResult<Vec<(String, Value)>> {
    state
        .store
        .query_one(
            "SELECT id, name, level, xp, avg_quiz_score, current_streak, max_streak, last_login_date, avatar_id, created_at \
             FROM users WHERE id = ?",
            vec![SqlValue::Integer(user_id)],
        )
        .await?
        .ok_or_else(|| LearnError::not_found("User not found"))
}

pub async fn public_profile(state: &AppState, user_id: i64) -> LearnResult<PublicProfile> {
    let row = require_user(state, user_id).await?;
    let communities = state
        .communities
        .for_user(user_id)
        .await?
        .into_iter()
        .map(|c| CommunityRef { id: c.id, name: c.name })
        .collect();

    Ok(PublicProfile {
        id: user_id,
        name: row.str_field("name")?,
        level: row.i64_field("level")?,
        xp: row.i64_field("xp")?,
        avg_quiz_score: row.opt_f64("avg_quiz_score").unwrap_or(0.0),
        current_streak: row.i64_field("current_streak")?,
        max_streak: row.i64_field("max_streak")?,
        last_login_date: row.opt_str("last_login_date"),
        avatar_id: row.opt_i64("avatar_id"),
        created_at: row.str_field("created_at")?,
        communities,
        achievement_count: state.achievements.unlocked_count(user_id).await?,
    })
}

/// Roadmaps the user joined, newest first, with that user's progress
pub async fn profile_roadmaps(state: &AppState, user_id: i64, params: &PageParams) -> LearnResult<RoadmapPage> {
    require_user(state, user_id).await?;
    let page = params.resolve(ROADMAPS_PAGE_SIZE);
    let total = state
        .store
        .query_i64(
            "SELECT COUNT(*) FROM roadmap_members WHERE user_id = ?",
            vec![SqlValue::Integer(user_id)],
        )
        .await?;
    let rows = state
        .store
        .query(
            "SELECT roadmap_id FROM roadmap_members WHERE user_id = ? \
             ORDER BY joined_at DESC, roadmap_id DESC LIMIT ? OFFSET ?",
            vec![
                SqlValue::Integer(user_id),
                SqlValue::Integer(page.limit),
                SqlValue::Integer(page.offset()),
            ],
        )
        .await?;

    let mut roadmaps = Vec::with_capacity(rows.len());
    for row in rows {
        roadmaps.push(state.roadmaps.view(user_id, row.i64_field("roadmap_id")?).await?);
    }

    Ok(RoadmapPage {
        roadmaps,
        total,
        total_pages: page.total_pages(total),
        current_page: page.page,
    })
}

pub async fn search_users(state: &AppState, query: &str) -> LearnResult<Vec<UserSummary>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let rows = state
        .store
        .query(
            "SELECT id, name, level, avatar_id FROM users WHERE lower(name) LIKE ? ESCAPE '\\' ORDER BY name LIMIT ?",
            vec![SqlValue::text(like_pattern(query)), SqlValue::Integer(SEARCH_LIMIT)],
        )
        .await?;
    rows.iter()
        .map(|r| {
            Ok(UserSummary {
                id: r.i64_field("id")?,
                name: r.str_field("name")?,
                level: r.i64_field("level")?,
                avatar_id: r.opt_i64("avatar_id"),
            })
        })
        .collect()
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/publicprofile/user/:user_id
async fn profile_handler(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let profile = public_profile(&state, user_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": profile
    })))
}

/// GET /api/publicprofile/roadmaps/:user_id
async fn roadmaps_handler(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, LearnError> {
    let page = profile_roadmaps(&state, user_id, &params).await?;
    Ok(Json(json!({
        "success": true,
        "data": page
    })))
}

/// GET /api/publicprofile/posts/:user_id
async fn posts_handler(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, LearnError> {
    require_user(&state, user_id).await?;
    let page = posts::list_page(
        &state.store,
        &state.blobs,
        None,
        Some(user_id),
        params.resolve(POSTS_PAGE_SIZE),
    )
    .await?;
    Ok(Json(json!({
        "success": true,
        "data": page
    })))
}

/// GET /api/publicprofile/search?q=
async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, LearnError> {
    let users = search_users(&state, &params.q).await?;
    Ok(Json(json!({
        "success": true,
        "data": users
    })))
}

pub fn create_profile_router(state: AppState) -> Router {
    Router::new()
        .route("/user/:user_id", get(profile_handler))
        .route("/roadmaps/:user_id", get(roadmaps_handler))
        .route("/posts/:user_id", get(posts_handler))
        .route("/quizzes/:user_id", get(crate::quizzes::user_quizzes_handler))
        .route("/search", get(search_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestApp;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_profile_hides_private_fields() {
        let app = TestApp::new().await;
        let (user_id, token) = app.register("Grace Hopper", "grace@learn.dev").await;
        app.post(
            "/api/community/create",
            Some(&token),
            json!({ "name": "Compilers", "description": "Parsing and codegen" }),
        )
        .await;

        let (status, body) = app.get(&format!("/api/publicprofile/user/{}", user_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "Grace Hopper");
        assert!(body["data"].get("email").is_none());
        assert!(body["data"].get("password_hash").is_none());
        assert_eq!(body["data"]["communities"][0]["name"], "Compilers");

        let (status, _) = app.get("/api/publicprofile/user/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_profile_listings_paginate() {
        let app = TestApp::new().await;
        let (user_id, token) = app.register("Poster", "poster@learn.dev").await;
        for i in 0..4 {
            app.create_post(&token, &format!("Post {}", i), None).await;
        }
        for topic in ["Rust", "Go"] {
            app.post("/api/roadmap/generate", Some(&token), json!({ "topic": topic }))
                .await;
        }

        let (_, body) = app.get(&format!("/api/publicprofile/posts/{}", user_id), None).await;
        assert_eq!(body["data"]["posts"].as_array().unwrap().len(), 3);
        assert_eq!(body["data"]["total"], 4);
        assert_eq!(body["data"]["total_pages"], 2);

        let (_, body) = app
            .get(&format!("/api/publicprofile/roadmaps/{}?page=1&limit=1", user_id), None)
            .await;
        assert_eq!(body["data"]["roadmaps"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["total"], 2);
        assert_eq!(body["data"]["current_page"], 1);
    }

    #[tokio::test]
    async fn test_search_users() {
        let app = TestApp::new().await;
        app.register("Ada Lovelace", "ada@learn.dev").await;
        app.register("Alan Turing", "alan@learn.dev").await;

        let users = search_users(&app.state, "ada").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Ada Lovelace");
        assert!(search_users(&app.state, "  ").await.unwrap().is_empty());
        assert_eq!(search_users(&app.state, "a").await.unwrap().len(), 2);
    }
}

//! # Learn-API
//!
//! The HTTP API layer powered by Axum. Every domain module contributes a
//! router; this module wires the shared state and mounts them.
//!
//! ## Mounts
//!
//! - `/api/user` - accounts and sessions
//! - `/api/community`, `/api/post`, `/api/comment` - forum
//! - `/api/attachments`, `/api/avatar` - stored files
//! - `/api/roadmap`, `/api/quiz`, `/api/feedback` - learning content
//! - `/api/achievements`, `/api/xp` - gamification
//! - `/api/request`, `/api/admin` - contributions and their review
//! - `/api/publicprofile` - public user pages
//! - `GET /health` - database ping

use crate::achievements::{create_achievements_router, AchievementListener, AchievementService};
use crate::ai::AiClient;
use crate::attachments::{create_attachments_router, create_avatar_router, BlobStore};
use crate::auth::{create_auth_router, AuthService};
use crate::comments::create_comment_router;
use crate::communities::{create_community_router, CommunityService};
use crate::config::Config;
use crate::contributions::{create_admin_router, create_request_router, ContributionService};
use crate::db::LearnStore;
use crate::error::LearnResult;
use crate::events::{spawn_listener, EventBus, NotificationHub};
use crate::posts::create_post_router;
use crate::profiles::create_profile_router;
use crate::quizzes::{create_quiz_router, QuizService};
use crate::roadmaps::{create_feedback_router, create_roadmap_router, RoadmapService};
use crate::xp::{create_xp_router, XpListener, XpService};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Largest page size any listing accepts
pub const MAX_PAGE_SIZE: i64 = 100;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LearnStore>,
    pub config: Arc<Config>,
    pub events: EventBus,
    pub notifications: NotificationHub,
    pub auth: AuthService,
    pub xp: XpService,
    pub achievements: AchievementService,
    pub communities: CommunityService,
    pub blobs: BlobStore,
    pub roadmaps: RoadmapService,
    pub quizzes: QuizService,
    pub contributions: ContributionService,
    pub ai: Arc<dyn AiClient>,
}

impl AppState {
    pub async fn new(store: Arc<LearnStore>, config: Config, ai: Arc<dyn AiClient>) -> LearnResult<Self> {
        let events = EventBus::new();
        let notifications = NotificationHub::new();

        let secret = match &config.jwt_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                warn!("No JWT secret configured, generated a random one; tokens will not survive a restart");
                AuthService::generate_secret()
            }
        };
        let config = Arc::new(config);
        let auth = AuthService::new(store.clone(), events.clone(), secret, config.clone());

        let xp = XpService::new(store.clone(), notifications.clone());
        let achievements = AchievementService::new(store.clone(), xp.clone(), notifications.clone());
        achievements.seed_catalog().await?;

        Ok(Self {
            communities: CommunityService::new(store.clone(), events.clone()),
            blobs: BlobStore::new(store.clone(), config.storage_path.clone()),
            roadmaps: RoadmapService::new(store.clone(), events.clone(), ai.clone()),
            quizzes: QuizService::new(store.clone(), events.clone(), ai.clone()),
            contributions: ContributionService::new(store.clone(), events.clone()),
            store,
            config,
            events,
            notifications,
            auth,
            xp,
            achievements,
            ai,
        })
    }

    /// Start the XP and achievement listeners on the event bus
    pub fn spawn_listeners(&self) -> Vec<JoinHandle<()>> {
        info!("🎧 Starting event listeners");
        vec![
            spawn_listener(&self.events, Arc::new(XpListener::new(self.xp.clone()))),
            spawn_listener(
                &self.events,
                Arc::new(AchievementListener::new(self.achievements.clone())),
            ),
        ]
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// `?page&limit` query parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl PageParams {
    /// Apply defaults; page is at least 1 and limit within 1..=MAX_PAGE_SIZE
    pub fn resolve(&self, default_limit: i64) -> Page {
        Page {
            page: self.page.filter(|p| *p >= 1).unwrap_or(1),
            limit: self
                .limit
                .filter(|l| *l >= 1)
                .unwrap_or(default_limit)
                .min(MAX_PAGE_SIZE),
        }
    }
}

/// A resolved page window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub limit: i64,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }

    pub fn total_pages(&self, total: i64) -> i64 {
        (total + self.limit - 1) / self.limit
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .nest("/api/user", create_auth_router(state.clone()))
        .nest("/api/community", create_community_router(state.clone()))
        .nest("/api/post", create_post_router(state.clone()))
        .nest("/api/comment", create_comment_router(state.clone()))
        .nest("/api/attachments", create_attachments_router(state.clone()))
        .nest("/api/avatar", create_avatar_router(state.clone()))
        .nest("/api/roadmap", create_roadmap_router(state.clone()))
        .nest("/api/feedback", create_feedback_router(state.clone()))
        .nest("/api/quiz", create_quiz_router(state.clone()))
        .nest("/api/achievements", create_achievements_router(state.clone()))
        .nest("/api/xp", create_xp_router(state.clone()))
        .nest("/api/request", create_request_router(state.clone()))
        .nest("/api/admin", create_admin_router(state.clone()))
        .nest("/api/publicprofile", create_profile_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Root handler - API info
async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "name": "LearnPath",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "🧭 Learning roadmaps, quizzes and community",
        "endpoints": {
            "user": "/api/user",
            "community": "/api/community",
            "post": "/api/post",
            "comment": "/api/comment",
            "attachments": "/api/attachments/:id",
            "avatar": "/api/avatar",
            "roadmap": "/api/roadmap",
            "feedback": "/api/feedback/global-summary",
            "quiz": "/api/quiz",
            "achievements": "/api/achievements",
            "xp": "/api/xp",
            "request": "/api/request",
            "admin": "/api/admin",
            "publicprofile": "/api/publicprofile",
            "health": "GET /health"
        }
    }))
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.query_i64("SELECT 1", vec![]).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestApp;
    use axum::body::{Body, BodyDataStream};
    use axum::http::{header, Request, StatusCode};
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tower::util::ServiceExt;

    async fn open_stream(app: &TestApp, token: &str) -> BodyDataStream {
        let request = Request::builder()
            .uri("/api/achievements/stream")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.into_body().into_data_stream()
    }

    /// Read SSE text until `needle` shows up
    async fn read_until(stream: &mut BodyDataStream, needle: &str) -> String {
        let mut text = String::new();
        while !text.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("stream went quiet")
                .expect("stream ended")
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        text
    }

    #[test]
    fn test_page_resolution() {
        let page = PageParams::default().resolve(10);
        assert_eq!(page, Page { page: 1, limit: 10 });
        assert_eq!(page.offset(), 0);

        let page = PageParams { page: Some(3), limit: Some(4) }.resolve(10);
        assert_eq!(page.offset(), 8);
        assert_eq!(page.total_pages(9), 3);
        assert_eq!(page.total_pages(0), 0);

        let page = PageParams { page: Some(0), limit: Some(1000) }.resolve(10);
        assert_eq!(page, Page { page: 1, limit: MAX_PAGE_SIZE });
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = TestApp::new().await;
        let (status, body) = app.get("/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_requires_auth() {
        let app = TestApp::new().await;
        let (status, body) = app.get("/api/roadmap/get", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = app.get("/api/roadmap/get", Some("not-a-token")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_roadmap_generate_then_reuse() {
        let app = TestApp::new().await;
        let (_, alice) = app.register("Alice", "alice@learn.dev").await;
        let (_, bob) = app.register("Bob", "bob@learn.dev").await;

        let (status, body) = app
            .post("/api/roadmap/generate", Some(&alice), json!({ "topic": "Rust" }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["is_existing"], false);
        let roadmap_id = body["data"]["id"].as_i64().unwrap();
        let first = body["data"]["checkpoints"][0]["id"].as_i64().unwrap();

        let (status, body) = app
            .post("/api/roadmap/generate", Some(&bob), json!({ "topic": "rust" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["is_existing"], true);
        assert_eq!(body["data"]["id"].as_i64(), Some(roadmap_id));

        let (status, body) = app
            .post(
                "/api/roadmap/checkpoint/status",
                Some(&bob),
                json!({ "roadmapId": roadmap_id, "checkpointId": first, "status": "completed" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["progress_percent"], 33);

        let (status, body) = app
            .post(
                "/api/roadmap/checkpoint/status",
                Some(&bob),
                json!({ "roadmapId": roadmap_id, "checkpointId": first, "status": "in-progress" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

        let (status, body) = app
            .get(&format!("/api/roadmap/{}/leaderboard", roadmap_id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["name"], "Bob");
    }

    #[tokio::test]
    async fn test_admin_routes_are_guarded() {
        let app = TestApp::new().await;
        let (_, user) = app.register("User", "user@learn.dev").await;
        let (_, admin) = app.register("Admin", "admin@learn.dev").await;

        let (status, body) = app
            .post(
                "/api/request/contribute",
                Some(&user),
                json!({ "type": "Resource", "payload": { "url": "https://doc.rust-lang.org" } }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_i64().unwrap();

        let (status, _) = app.get("/api/admin/requests", Some(&user)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app.get("/api/admin/requests?status=pending", Some(&admin)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let uri = format!("/api/admin/requests/{}/approve", id);
        let (status, body) = app.put(&uri, Some(&admin), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "approved");

        let (status, _) = app.put(&uri, Some(&admin), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_community_and_forum_flow() {
        let app = TestApp::new().await;
        let (_, token) = app.register("Writer", "writer@learn.dev").await;

        let (status, body) = app
            .post(
                "/api/community/create",
                Some(&token),
                json!({ "name": "Rustaceans", "description": "All things Rust" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let community = body["data"]["id"].as_i64().unwrap();

        let (status, _) = app
            .post(
                "/api/community/create",
                Some(&token),
                json!({ "name": "rustaceans", "description": "Again" }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let post = app.create_post(&token, "Hello", Some(community)).await;

        let (status, body) = app
            .post("/api/comment/create", Some(&token), json!({ "message": "First", "postId": post }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["post_id"].as_i64(), Some(post));

        let (status, body) = app
            .post("/api/post/upvote", Some(&token), json!({ "postId": post }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["score"], 1);

        let (_, body) = app
            .get(&format!("/api/post?community={}", community), None)
            .await;
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["posts"][0]["comment_count"], 1);

        let (status, _) = app
            .delete("/api/post/delete", Some(&token), json!({ "postId": post }))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.get(&format!("/api/post/{}", post), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_quiz_submit_awards_xp() {
        let app = TestApp::new().await;
        let (user_id, token) = app.register("Quizzer", "quizzer@learn.dev").await;
        let _listeners = app.state.spawn_listeners();

        let (status, body) = app
            .post("/api/quiz/generate", Some(&token), json!({ "topic": "Rust" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        let quiz_id = body["data"]["id"].as_i64().unwrap();
        let answers: Vec<_> = body["data"]["questions"]
            .as_array()
            .unwrap()
            .iter()
            .zip(["B", "A"])
            .map(|(q, a)| json!({ "questionId": q["id"], "selectedOption": a }))
            .collect();

        let (status, body) = app
            .post("/api/quiz/submit", Some(&token), json!({ "quizId": quiz_id, "answers": answers }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["score"], 2);
        assert_eq!(body["data"]["percentage"], 100.0);
        assert_eq!(app.ai.quiz_calls(), 1);

        // Perfect score: completion, perfect bonus, and the first-quiz achievement
        let mut xp = 0;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let (_, body) = app.get("/api/xp/history", Some(&token)).await;
            xp = body["data"]
                .as_array()
                .map(|entries| entries.iter().filter_map(|e| e["amount"].as_i64()).sum())
                .unwrap_or(0);
            if xp >= 85 {
                break;
            }
        }
        assert!(xp >= 85, "expected quiz XP to be awarded, got {}", xp);

        let (_, body) = app.get(&format!("/api/quiz/user/{}", user_id), None).await;
        assert_eq!(body["data"]["total_quizzes"], 1);
    }

    #[tokio::test]
    async fn test_notification_stream_is_per_user() {
        let app = TestApp::new().await;
        let (ada, ada_token) = app.register("Ada", "ada@learn.dev").await;
        let (_, bob_token) = app.register("Bob", "bob@learn.dev").await;

        let mut ada_stream = open_stream(&app, &ada_token).await;
        let mut bob_stream = open_stream(&app, &bob_token).await;
        read_until(&mut ada_stream, "event: connected").await;
        read_until(&mut bob_stream, "event: connected").await;

        app.state.achievements.award(ada, 9).await.unwrap().unwrap();

        let text = read_until(&mut ada_stream, "Streak Starter").await;
        assert!(text.contains("event: achievement-unlocked"));
        assert!(text.contains("data: {"));

        let quiet = tokio::time::timeout(Duration::from_millis(200), bob_stream.next()).await;
        assert!(quiet.is_err(), "another user's stream received a notification");
    }

    #[tokio::test]
    async fn test_global_feedback_summary_route() {
        let app = TestApp::new().await;
        let (status, body) = app.get("/api/feedback/global-summary", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }
}

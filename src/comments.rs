//! # Comments
//!
//! Threaded comments on forum posts. A reply points at its parent with
//! `replying_to`; the parent must belong to the same post.

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::posts::{toggle_vote, Author, VoteTarget};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct CommentView {
    pub id: i64,
    pub post_id: i64,
    pub message: String,
    pub author: Author,
    pub replying_to: Option<i64>,
    pub reply_count: i64,
    pub upvotes: i64,
    pub downvotes: i64,
    pub score: i64,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommentRequest {
    pub message: String,
    pub post_id: i64,
    #[serde(default)]
    pub replying_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentIdRequest {
    pub comment_id: i64,
}

const COMMENT_SELECT: &str = "SELECT c.*, u.name AS author_name, u.level AS author_level, u.avatar_id AS author_avatar, \
     (SELECT COUNT(*) FROM comments r WHERE r.replying_to = c.id) AS reply_count, \
     (SELECT COUNT(*) FROM votes v WHERE v.target_kind = 'comment' AND v.target_id = c.id AND v.value = 1) AS upvotes, \
     (SELECT COUNT(*) FROM votes v WHERE v.target_kind = 'comment' AND v.target_id = c.id AND v.value = -1) AS downvotes \
     FROM comments c JOIN users u ON u.id = c.author_id";

fn row_to_comment(row: &[(String, Value)]) -> LearnResult<CommentView> {
    let upvotes = row.i64_field("upvotes")?;
    let downvotes = row.i64_field("downvotes")?;
    Ok(CommentView {
        id: row.i64_field("id")?,
        post_id: row.i64_field("post_id")?,
        message: row.str_field("message")?,
        author: Author {
            id: row.i64_field("author_id")?,
            name: row.str_field("author_name")?,
            level: row.opt_i64("author_level").unwrap_or(1),
            avatar_id: row.opt_i64("author_avatar"),
        },
        replying_to: row.opt_i64("replying_to"),
        reply_count: row.i64_field("reply_count")?,
        upvotes,
        downvotes,
        score: upvotes - downvotes,
        created_at: row.str_field("created_at")?,
    })
}

pub async fn get_comment(store: &LearnStore, id: i64) -> LearnResult<CommentView> {
    let row = store
        .query_one(format!("{} WHERE c.id = ?", COMMENT_SELECT), vec![SqlValue::Integer(id)])
        .await?
        .ok_or_else(|| LearnError::not_found("Comment not found"))?;
    row_to_comment(&row)
}

pub async fn create_comment(store: &LearnStore, author_id: i64, req: CreateCommentRequest) -> LearnResult<CommentView> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(LearnError::invalid("Message is required"));
    }
    store
        .query_one("SELECT id FROM posts WHERE id = ?", vec![SqlValue::Integer(req.post_id)])
        .await?
        .ok_or_else(|| LearnError::not_found("Post not found"))?;

    if let Some(parent) = req.replying_to {
        let row = store
            .query_one("SELECT post_id FROM comments WHERE id = ?", vec![SqlValue::Integer(parent)])
            .await?
            .ok_or_else(|| LearnError::not_found("Parent comment not found"))?;
        if row.i64_field("post_id")? != req.post_id {
            return Err(LearnError::invalid("Parent comment belongs to another post"));
        }
    }

    let now = crate::db::now();
    let id = store
        .insert(
            "INSERT INTO comments (post_id, author_id, message, replying_to, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            vec![
                SqlValue::Integer(req.post_id),
                SqlValue::Integer(author_id),
                SqlValue::text(message),
                SqlValue::opt_int(req.replying_to),
                SqlValue::text(&now),
                SqlValue::text(&now),
            ],
        )
        .await?;
    debug!("User {} commented on post {}", author_id, req.post_id);
    get_comment(store, id).await
}

/// Top-level comments of a post, oldest first
pub async fn comments_for_post(store: &LearnStore, post_id: i64) -> LearnResult<Vec<CommentView>> {
    store
        .query_one("SELECT id FROM posts WHERE id = ?", vec![SqlValue::Integer(post_id)])
        .await?
        .ok_or_else(|| LearnError::not_found("Post not found"))?;
    let rows = store
        .query(
            format!("{} WHERE c.post_id = ? AND c.replying_to IS NULL ORDER BY c.created_at, c.id", COMMENT_SELECT),
            vec![SqlValue::Integer(post_id)],
        )
        .await?;
    rows.iter().map(|r| row_to_comment(r)).collect()
}

pub async fn replies(store: &LearnStore, comment_id: i64) -> LearnResult<Vec<CommentView>> {
    get_comment(store, comment_id).await?;
    let rows = store
        .query(
            format!("{} WHERE c.replying_to = ? ORDER BY c.created_at, c.id", COMMENT_SELECT),
            vec![SqlValue::Integer(comment_id)],
        )
        .await?;
    rows.iter().map(|r| row_to_comment(r)).collect()
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /api/comment/create
async fn create_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let comment = create_comment(&state.store, user.id, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": comment
        })),
    ))
}

/// GET /api/comment/:post_id
async fn for_post_handler(
    State(state): State<AppState>,
    Path(post_id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let comments = comments_for_post(&state.store, post_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": comments
    })))
}

/// GET /api/comment/replies/:comment_id
async fn replies_handler(
    State(state): State<AppState>,
    Path(comment_id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let comments = replies(&state.store, comment_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": comments
    })))
}

async fn vote(state: &AppState, user: &AuthUser, comment_id: i64, value: i64) -> LearnResult<Json<Value>> {
    let tally = toggle_vote(&state.store, VoteTarget::Comment, comment_id, user.id, value).await?;
    Ok(Json(json!({
        "success": true,
        "data": tally
    })))
}

/// POST /api/comment/upvote
async fn upvote_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CommentIdRequest>,
) -> Result<impl IntoResponse, LearnError> {
    vote(&state, &user, req.comment_id, 1).await
}

/// POST /api/comment/downvote
async fn downvote_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CommentIdRequest>,
) -> Result<impl IntoResponse, LearnError> {
    vote(&state, &user, req.comment_id, -1).await
}

pub fn create_comment_router(state: AppState) -> Router {
    Router::new()
        .route("/create", post(create_handler))
        .route("/upvote", post(upvote_handler))
        .route("/downvote", post(downvote_handler))
        .route("/replies/:comment_id", get(replies_handler))
        .route("/:post_id", get(for_post_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    async fn setup() -> (LearnStore, i64, i64) {
        let store = LearnStore::in_memory().await.unwrap();
        let user = testing::insert_user(&store, "talker@learn.dev").await;
        let post = store
            .insert(
                "INSERT INTO posts (title, description, author_id) VALUES ('T', 'D', ?)",
                vec![SqlValue::Integer(user)],
            )
            .await
            .unwrap();
        (store, user, post)
    }

    fn request(post_id: i64, message: &str, replying_to: Option<i64>) -> CreateCommentRequest {
        CreateCommentRequest {
            message: message.to_string(),
            post_id,
            replying_to,
        }
    }

    #[tokio::test]
    async fn test_threads_and_reply_counts() {
        let (store, user, post) = setup().await;

        let root = create_comment(&store, user, request(post, "First!", None)).await.unwrap();
        create_comment(&store, user, request(post, "Reply", Some(root.id))).await.unwrap();
        create_comment(&store, user, request(post, "Another", Some(root.id))).await.unwrap();

        let top = comments_for_post(&store, post).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].reply_count, 2);
        assert_eq!(top[0].author.name, "Test User");

        let thread = replies(&store, root.id).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].message, "Reply");
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (store, user, post) = setup().await;
        let other_post = store
            .insert(
                "INSERT INTO posts (title, description, author_id) VALUES ('T2', 'D2', ?)",
                vec![SqlValue::Integer(user)],
            )
            .await
            .unwrap();
        let foreign = create_comment(&store, user, request(other_post, "Elsewhere", None)).await.unwrap();

        assert!(matches!(
            create_comment(&store, user, request(post, "  ", None)).await,
            Err(LearnError::InvalidPayload(_))
        ));
        assert!(matches!(
            create_comment(&store, user, request(999, "Hi", None)).await,
            Err(LearnError::NotFound(_))
        ));
        assert!(matches!(
            create_comment(&store, user, request(post, "Hi", Some(foreign.id))).await,
            Err(LearnError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_comment_votes() {
        let (store, user, post) = setup().await;
        let comment = create_comment(&store, user, request(post, "Vote me", None)).await.unwrap();

        toggle_vote(&store, VoteTarget::Comment, comment.id, user, 1).await.unwrap();
        let view = get_comment(&store, comment.id).await.unwrap();
        assert_eq!(view.score, 1);

        toggle_vote(&store, VoteTarget::Comment, comment.id, user, 1).await.unwrap();
        assert_eq!(get_comment(&store, comment.id).await.unwrap().score, 0);
    }
}

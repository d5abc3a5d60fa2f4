//! # Forum Posts
//!
//! Posts with tags, optional community, file attachments and up/down votes.
//! Votes on posts and comments share the `votes` table, keyed by target kind.

use crate::api::{AppState, Page, PageParams};
use crate::attachments::{
    Attachment, BlobStore, Bucket, NewBlob, StagedBlob, INSERT_ATTACHMENT, MAX_ATTACHMENT_SIZE,
};
use crate::auth::AuthUser;
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Most files one post can carry
pub const MAX_ATTACHMENTS: usize = 5;

/// Default page size of post listings
pub const POSTS_PAGE_SIZE: i64 = 10;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub level: i64,
    pub avatar_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostView {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub author: Author,
    pub community_id: Option<i64>,
    pub upvotes: i64,
    pub downvotes: i64,
    pub score: i64,
    pub comment_count: i64,
    pub attachments: Vec<Attachment>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct PostPage {
    pub posts: Vec<PostView>,
    pub total: i64,
    pub total_pages: i64,
    pub current_page: i64,
}

/// Filters for [`list_posts`]
#[derive(Debug, Default, Deserialize)]
pub struct PostFilter {
    #[serde(default)]
    pub community: Option<i64>,
    #[serde(default)]
    pub author: Option<i64>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub community_id: Option<i64>,
}

/// Vote counts on one target after a vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteTally {
    pub upvotes: i64,
    pub downvotes: i64,
    pub score: i64,
    /// The caller's vote now: 1, -1 or 0
    pub user_vote: i64,
}

/// What a vote targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteTarget {
    Post,
    Comment,
}

impl VoteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteTarget::Post => "post",
            VoteTarget::Comment => "comment",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            VoteTarget::Post => "posts",
            VoteTarget::Comment => "comments",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostIdRequest {
    pub post_id: i64,
}

// ============================================================================
// Helpers
// ============================================================================

/// Tags arrive as a JSON array or a comma separated list
pub fn parse_tags(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let items: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        raw.split(',').map(String::from).collect()
    };

    let mut tags: Vec<String> = Vec::new();
    for tag in items {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

const POST_SELECT: &str = "SELECT p.*, u.name AS author_name, u.level AS author_level, u.avatar_id AS author_avatar, \
     (SELECT COUNT(*) FROM votes v WHERE v.target_kind = 'post' AND v.target_id = p.id AND v.value = 1) AS upvotes, \
     (SELECT COUNT(*) FROM votes v WHERE v.target_kind = 'post' AND v.target_id = p.id AND v.value = -1) AS downvotes, \
     (SELECT COUNT(*) FROM comments c WHERE c.post_id = p.id) AS comment_count \
     FROM posts p JOIN users u ON u.id = p.author_id";

async fn row_to_post(row: &[(String, Value)], blobs: &BlobStore) -> LearnResult<PostView> {
    let id = row.i64_field("id")?;
    let upvotes = row.i64_field("upvotes")?;
    let downvotes = row.i64_field("downvotes")?;
    Ok(PostView {
        id,
        title: row.str_field("title")?,
        description: row.str_field("description")?,
        tags: row.json_field("tags").unwrap_or_default(),
        author: Author {
            id: row.i64_field("author_id")?,
            name: row.str_field("author_name")?,
            level: row.opt_i64("author_level").unwrap_or(1),
            avatar_id: row.opt_i64("author_avatar"),
        },
        community_id: row.opt_i64("community_id"),
        upvotes,
        downvotes,
        score: upvotes - downvotes,
        comment_count: row.i64_field("comment_count")?,
        attachments: blobs.for_post(id).await?,
        created_at: row.str_field("created_at")?,
        updated_at: row.str_field("updated_at")?,
    })
}

// ============================================================================
// Operations
// ============================================================================

/// Newest posts first, optionally filtered by community and author
pub async fn list_posts(store: &LearnStore, blobs: &BlobStore, filter: &PostFilter) -> LearnResult<PostPage> {
    let page = PageParams {
        page: filter.page,
        limit: filter.limit,
    }
    .resolve(POSTS_PAGE_SIZE);
    list_page(store, blobs, filter.community, filter.author, page).await
}

pub(crate) async fn list_page(
    store: &LearnStore,
    blobs: &BlobStore,
    community: Option<i64>,
    author: Option<i64>,
    page: Page,
) -> LearnResult<PostPage> {
    let filters = vec![SqlValue::opt_int(community), SqlValue::opt_int(author)];
    let total = store
        .query_i64(
            "SELECT COUNT(*) FROM posts p WHERE (?1 IS NULL OR p.community_id = ?1) AND (?2 IS NULL OR p.author_id = ?2)",
            filters.clone(),
        )
        .await?;

    let mut params = filters;
    params.push(SqlValue::Integer(page.limit));
    params.push(SqlValue::Integer(page.offset()));
    let rows = store
        .query(
            format!(
                "{} WHERE (?1 IS NULL OR p.community_id = ?1) AND (?2 IS NULL OR p.author_id = ?2) \
                 ORDER BY p.created_at DESC, p.id DESC LIMIT ?3 OFFSET ?4",
                POST_SELECT
            ),
            params,
        )
        .await?;

    let mut posts = Vec::with_capacity(rows.len());
    for row in &rows {
        posts.push(row_to_post(row, blobs).await?);
    }

    Ok(PostPage {
        posts,
        total,
        total_pages: page.total_pages(total),
        current_page: page.page,
    })
}

pub async fn get_post(store: &LearnStore, blobs: &BlobStore, id: i64) -> LearnResult<PostView> {
    let row = store
        .query_one(format!("{} WHERE p.id = ?", POST_SELECT), vec![SqlValue::Integer(id)])
        .await?
        .ok_or_else(|| LearnError::not_found("Post not found"))?;
    row_to_post(&row, blobs).await
}

/// Create a post and store its attachments. Nothing is kept if a file fails.
///
/// Files are written first; the post and its attachment rows are then
/// recorded in one transaction.
pub async fn create_post(
    store: &LearnStore,
    blobs: &BlobStore,
    author_id: i64,
    post: NewPost,
    files: Vec<NewBlob>,
) -> LearnResult<PostView> {
    let title = post.title.trim();
    let description = post.description.trim();
    if title.is_empty() || description.is_empty() {
        return Err(LearnError::invalid("Title and description are required"));
    }
    if files.len() > MAX_ATTACHMENTS {
        return Err(LearnError::invalid(format!(
            "At most {} attachments are allowed",
            MAX_ATTACHMENTS
        )));
    }
    if let Some(file) = files.iter().find(|f| f.data.len() > MAX_ATTACHMENT_SIZE) {
        return Err(LearnError::invalid(format!(
            "Attachment '{}' exceeds the {} MiB limit",
            file.file_name,
            MAX_ATTACHMENT_SIZE / (1024 * 1024)
        )));
    }
    if let Some(community_id) = post.community_id {
        store
            .query_one("SELECT id FROM communities WHERE id = ?", vec![SqlValue::Integer(community_id)])
            .await?
            .ok_or_else(|| LearnError::not_found("Community not found"))?;
    }

    let mut staged: Vec<StagedBlob> = Vec::with_capacity(files.len());
    for file in files {
        match blobs.stage(Bucket::Attachments, file).await {
            Ok(blob) => staged.push(blob),
            Err(e) => {
                discard_all(blobs, &staged).await;
                return Err(e);
            }
        }
    }

    let now = crate::db::now();
    let tags = serde_json::to_string(&post.tags)?;
    let (title, description) = (title.to_string(), description.to_string());
    let community_id = post.community_id;
    let rows = staged.clone();
    let inserted = store
        .with_transaction(move |tx| {
            tx.execute(
                "INSERT INTO posts (title, description, tags, author_id, community_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![title, description, tags, author_id, community_id, now],
            )?;
            let post_id = tx.last_insert_rowid();
            for blob in &rows {
                let values = blob.insert_params(Some(author_id), Some(post_id));
                tx.execute(INSERT_ATTACHMENT, rusqlite::params_from_iter(values.iter()))?;
            }
            Ok(post_id)
        })
        .await;
    let post_id = match inserted {
        Ok(id) => id,
        Err(e) => {
            discard_all(blobs, &staged).await;
            return Err(e);
        }
    };

    info!("✍️ User {} created post {}", author_id, post_id);
    get_post(store, blobs, post_id).await
}

async fn discard_all(blobs: &BlobStore, staged: &[StagedBlob]) {
    for blob in staged {
        blobs.discard(blob).await;
    }
}

/// Delete a post with its comments, votes and files. Author only.
pub async fn delete_post(store: &LearnStore, blobs: &BlobStore, user_id: i64, post_id: i64) -> LearnResult<()> {
    let row = store
        .query_one("SELECT author_id FROM posts WHERE id = ?", vec![SqlValue::Integer(post_id)])
        .await?
        .ok_or_else(|| LearnError::not_found("Post not found"))?;
    if row.i64_field("author_id")? != user_id {
        return Err(LearnError::forbidden("Only the author can delete this post"));
    }

    for attachment in blobs.for_post(post_id).await? {
        blobs.delete(attachment.id).await?;
    }

    store
        .with_transaction(move |tx| {
            tx.execute(
                "DELETE FROM votes WHERE target_kind = 'comment' AND target_id IN (SELECT id FROM comments WHERE post_id = ?1)",
                [post_id],
            )?;
            tx.execute(
                "DELETE FROM votes WHERE target_kind = 'post' AND target_id = ?1",
                [post_id],
            )?;
            tx.execute("DELETE FROM comments WHERE post_id = ?1", [post_id])?;
            tx.execute("DELETE FROM posts WHERE id = ?1", [post_id])?;
            Ok(())
        })
        .await?;

    info!("🗑️ Post {} deleted by user {}", post_id, user_id);
    Ok(())
}

/// Vote on a post or comment. Voting the same way twice removes the vote,
/// voting the other way switches it.
pub async fn toggle_vote(
    store: &LearnStore,
    target: VoteTarget,
    target_id: i64,
    user_id: i64,
    value: i64,
) -> LearnResult<VoteTally> {
    store
        .query_one(
            format!("SELECT id FROM {} WHERE id = ?", target.table()),
            vec![SqlValue::Integer(target_id)],
        )
        .await?
        .ok_or_else(|| match target {
            VoteTarget::Post => LearnError::not_found("Post not found"),
            VoteTarget::Comment => LearnError::not_found("Comment not found"),
        })?;

    let kind = target.as_str();
    let tally = store
        .with_transaction(move |tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT value FROM votes WHERE target_kind = ?1 AND target_id = ?2 AND user_id = ?3",
                    params![kind, target_id, user_id],
                    |r| r.get(0),
                )
                .optional()?;

            let user_vote = if existing == Some(value) {
                tx.execute(
                    "DELETE FROM votes WHERE target_kind = ?1 AND target_id = ?2 AND user_id = ?3",
                    params![kind, target_id, user_id],
                )?;
                0
            } else {
                tx.execute(
                    "INSERT INTO votes (target_kind, target_id, user_id, value) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(target_kind, target_id, user_id) DO UPDATE SET value = excluded.value",
                    params![kind, target_id, user_id, value],
                )?;
                value
            };

            let (upvotes, downvotes): (i64, i64) = tx.query_row(
                "SELECT COALESCE(SUM(value = 1), 0), COALESCE(SUM(value = -1), 0) FROM votes \
                 WHERE target_kind = ?1 AND target_id = ?2",
                params![kind, target_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;

            Ok(VoteTally {
                upvotes,
                downvotes,
                score: upvotes - downvotes,
                user_vote,
            })
        })
        .await?;

    debug!("User {} voted {} on {} {}", user_id, value, kind, target_id);
    Ok(tally)
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/post
async fn list_handler(
    State(state): State<AppState>,
    Query(filter): Query<PostFilter>,
) -> Result<impl IntoResponse, LearnError> {
    let page = list_posts(&state.store, &state.blobs, &filter).await?;
    Ok(Json(json!({
        "success": true,
        "data": page
    })))
}

/// GET /api/post/:id
async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let post = get_post(&state.store, &state.blobs, id).await?;
    Ok(Json(json!({
        "success": true,
        "data": post
    })))
}

/// POST /api/post/create - multipart
async fn create_handler(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, LearnError> {
    let mut post = NewPost::default();
    let mut files: Vec<NewBlob> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| LearnError::invalid(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "attachments" {
            let file_name = field.file_name().unwrap_or("attachment").to_string();
            let content_type = field.content_type().map(|s| s.to_string());
            let data = field
                .bytes()
                .await
                .map_err(|e| LearnError::invalid(format!("Failed to read file: {}", e)))?;
            files.push(NewBlob {
                file_name,
                content_type,
                data: data.to_vec(),
            });
            continue;
        }

        let text = field
            .text()
            .await
            .map_err(|e| LearnError::invalid(format!("Failed to read field '{}': {}", name, e)))?;
        match name.as_str() {
            "title" => post.title = text,
            "description" => post.description = text,
            "tags" => post.tags = parse_tags(&text),
            "community" => {
                let text = text.trim();
                if !text.is_empty() {
                    post.community_id = Some(
                        text.parse()
                            .map_err(|_| LearnError::invalid("Community must be an id"))?,
                    );
                }
            }
            _ => {}
        }
    }

    let created = create_post(&state.store, &state.blobs, user.id, post, files).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": created,
            "message": "Post created successfully"
        })),
    ))
}

/// DELETE /api/post/delete
async fn delete_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<PostIdRequest>,
) -> Result<impl IntoResponse, LearnError> {
    delete_post(&state.store, &state.blobs, user.id, req.post_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Post deleted"
    })))
}

/// POST /api/post/upvote
async fn upvote_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<PostIdRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let tally = toggle_vote(&state.store, VoteTarget::Post, req.post_id, user.id, 1).await?;
    Ok(Json(json!({
        "success": true,
        "data": tally
    })))
}

/// POST /api/post/downvote
async fn downvote_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<PostIdRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let tally = toggle_vote(&state.store, VoteTarget::Post, req.post_id, user.id, -1).await?;
    Ok(Json(json!({
        "success": true,
        "data": tally
    })))
}

pub fn create_post_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_handler))
        .route("/create", post(create_handler))
        .route("/delete", delete(delete_handler))
        .route("/upvote", post(upvote_handler))
        .route("/downvote", post(downvote_handler))
        .route("/:id", get(get_handler))
        .layer(DefaultBodyLimit::max(MAX_ATTACHMENTS * MAX_ATTACHMENT_SIZE + 1024 * 1024))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<LearnStore>,
        blobs: BlobStore,
        user: i64,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LearnStore::in_memory().await.unwrap());
        let blobs = BlobStore::new(store.clone(), dir.path().to_path_buf());
        let user = testing::insert_user(&store, "poster@learn.dev").await;
        Fixture {
            store,
            blobs,
            user,
            _dir: dir,
        }
    }

    fn new_post(title: &str) -> NewPost {
        NewPost {
            title: title.to_string(),
            description: "Some thoughts".to_string(),
            tags: vec!["rust".to_string()],
            community_id: None,
        }
    }

    fn file(name: &str, size: usize) -> NewBlob {
        NewBlob {
            file_name: name.to_string(),
            content_type: None,
            data: vec![7u8; size],
        }
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(parse_tags("rust, async ,,rust"), vec!["rust", "async"]);
        assert_eq!(parse_tags(r#"["a", " b "]"#), vec!["a", "b"]);
        assert!(parse_tags("   ").is_empty());
    }

    #[tokio::test]
    async fn test_create_and_get_post() {
        let f = fixture().await;

        let post = create_post(&f.store, &f.blobs, f.user, new_post("Hello"), vec![file("notes.txt", 10)])
            .await
            .unwrap();
        assert_eq!(post.title, "Hello");
        assert_eq!(post.author.name, "Test User");
        assert_eq!(post.attachments.len(), 1);
        assert_eq!(post.attachments[0].mime_type, "text/plain");
        assert_eq!(post.score, 0);

        let fetched = get_post(&f.store, &f.blobs, post.id).await.unwrap();
        assert_eq!(fetched.tags, vec!["rust"]);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let f = fixture().await;

        let too_many: Vec<NewBlob> = (0..6).map(|i| file(&format!("{}.txt", i), 1)).collect();
        assert!(matches!(
            create_post(&f.store, &f.blobs, f.user, new_post("Hi"), too_many).await,
            Err(LearnError::InvalidPayload(_))
        ));
        assert!(matches!(
            create_post(&f.store, &f.blobs, f.user, new_post("Hi"), vec![file("big.bin", MAX_ATTACHMENT_SIZE + 1)]).await,
            Err(LearnError::InvalidPayload(_))
        ));
        assert!(matches!(
            create_post(&f.store, &f.blobs, f.user, new_post("  "), vec![]).await,
            Err(LearnError::InvalidPayload(_))
        ));

        let mut orphan = new_post("Hi");
        orphan.community_id = Some(42);
        assert!(matches!(
            create_post(&f.store, &f.blobs, f.user, orphan, vec![]).await,
            Err(LearnError::NotFound(_))
        ));

        let page = list_posts(&f.store, &f.blobs, &PostFilter::default()).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_failed_file_leaves_nothing_behind() {
        let f = fixture().await;

        let files = vec![file("first.txt", 4), file("..", 4)];
        let result = create_post(&f.store, &f.blobs, f.user, new_post("Broken"), files).await;
        assert!(matches!(result, Err(LearnError::InvalidPayload(_))));

        let posts = f.store.query_i64("SELECT COUNT(*) FROM posts", vec![]).await.unwrap();
        let rows = f.store.query_i64("SELECT COUNT(*) FROM attachments", vec![]).await.unwrap();
        assert_eq!((posts, rows), (0, 0));
        let written = std::fs::read_dir(f._dir.path().join("attachments")).unwrap().count();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_unwritable_bucket_keeps_original_error() {
        let f = fixture().await;
        std::fs::write(f._dir.path().join("attachments"), b"not a directory").unwrap();

        let result = create_post(&f.store, &f.blobs, f.user, new_post("Nope"), vec![file("a.txt", 4)]).await;
        assert!(matches!(result, Err(LearnError::Storage(_))));
        let posts = f.store.query_i64("SELECT COUNT(*) FROM posts", vec![]).await.unwrap();
        assert_eq!(posts, 0);
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let f = fixture().await;
        let other = testing::insert_user(&f.store, "other@learn.dev").await;
        for i in 0..12 {
            create_post(&f.store, &f.blobs, f.user, new_post(&format!("Post {}", i)), vec![])
                .await
                .unwrap();
        }
        create_post(&f.store, &f.blobs, other, new_post("Other"), vec![]).await.unwrap();

        let first = list_posts(&f.store, &f.blobs, &PostFilter::default()).await.unwrap();
        assert_eq!(first.total, 13);
        assert_eq!(first.posts.len(), 10);
        assert_eq!(first.total_pages, 2);
        assert_eq!(first.posts[0].title, "Other");

        let mine = list_posts(
            &f.store,
            &f.blobs,
            &PostFilter {
                author: Some(f.user),
                page: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(mine.total, 12);
        assert_eq!(mine.posts.len(), 2);
        assert_eq!(mine.current_page, 2);
    }

    #[tokio::test]
    async fn test_vote_toggle() {
        let f = fixture().await;
        let other = testing::insert_user(&f.store, "voter@learn.dev").await;
        let post = create_post(&f.store, &f.blobs, f.user, new_post("Vote"), vec![]).await.unwrap();

        let up = toggle_vote(&f.store, VoteTarget::Post, post.id, other, 1).await.unwrap();
        assert_eq!(up, VoteTally { upvotes: 1, downvotes: 0, score: 1, user_vote: 1 });

        let switched = toggle_vote(&f.store, VoteTarget::Post, post.id, other, -1).await.unwrap();
        assert_eq!(switched, VoteTally { upvotes: 0, downvotes: 1, score: -1, user_vote: -1 });

        let removed = toggle_vote(&f.store, VoteTarget::Post, post.id, other, -1).await.unwrap();
        assert_eq!(removed, VoteTally { upvotes: 0, downvotes: 0, score: 0, user_vote: 0 });

        toggle_vote(&f.store, VoteTarget::Post, post.id, f.user, 1).await.unwrap();
        let view = get_post(&f.store, &f.blobs, post.id).await.unwrap();
        assert_eq!(view.upvotes, 1);

        assert!(matches!(
            toggle_vote(&f.store, VoteTarget::Post, 999, other, 1).await,
            Err(LearnError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_post_author_only() {
        let f = fixture().await;
        let other = testing::insert_user(&f.store, "other@learn.dev").await;
        let post = create_post(&f.store, &f.blobs, f.user, new_post("Bye"), vec![file("a.txt", 3)])
            .await
            .unwrap();
        let attachment_id = post.attachments[0].id;
        toggle_vote(&f.store, VoteTarget::Post, post.id, other, 1).await.unwrap();

        assert!(matches!(
            delete_post(&f.store, &f.blobs, other, post.id).await,
            Err(LearnError::Forbidden(_))
        ));

        delete_post(&f.store, &f.blobs, f.user, post.id).await.unwrap();
        assert!(matches!(get_post(&f.store, &f.blobs, post.id).await, Err(LearnError::NotFound(_))));
        assert!(matches!(f.blobs.get(attachment_id).await, Err(LearnError::NotFound(_))));
        let votes = f
            .store
            .query_i64("SELECT COUNT(*) FROM votes", vec![])
            .await
            .unwrap();
        assert_eq!(votes, 0);
    }
}

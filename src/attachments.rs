//! # Attachments (Learn-Blobs)
//!
//! Bucket-based file storage for post attachments and user avatars.
//! Bytes live on the filesystem under `<root>/<bucket>/`; metadata lives in
//! the `attachments` table.
//!
//! ## Buckets
//! - `attachments` - files uploaded with forum posts
//! - `avatars` - one profile picture per user

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::header,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Maximum post attachment size (10 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 10 * 1024 * 1024;

/// Maximum avatar size (2 MiB)
pub const MAX_AVATAR_SIZE: usize = 2 * 1024 * 1024;

/// Storage bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Attachments,
    Avatars,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Attachments => "attachments",
            Bucket::Avatars => "avatars",
        }
    }
}

/// Stored blob metadata
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub id: i64,
    pub bucket: String,
    #[serde(skip)]
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub owner_id: Option<i64>,
    pub post_id: Option<i64>,
    pub url: String,
    pub created_at: String,
}

/// An upload about to be stored
#[derive(Debug, Clone)]
pub struct NewBlob {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Reduce an uploaded file name to its last path component
pub fn sanitize_file_name(name: &str) -> LearnResult<String> {
    let last = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    if last.is_empty() || last == "." || last == ".." {
        return Err(LearnError::invalid("File name is required"));
    }
    Ok(last.to_string())
}

/// Insert statement for one `attachments` row, see [`StagedBlob::insert_params`]
pub const INSERT_ATTACHMENT: &str =
    "INSERT INTO attachments (bucket, path, name, mime_type, size, owner_id, post_id) VALUES (?, ?, ?, ?, ?, ?, ?)";

/// Bytes already written to a bucket but not yet recorded
#[derive(Debug, Clone)]
pub struct StagedBlob {
    pub bucket: Bucket,
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
}

impl StagedBlob {
    pub fn insert_params(&self, owner_id: Option<i64>, post_id: Option<i64>) -> Vec<SqlValue> {
        vec![
            SqlValue::text(self.bucket.as_str()),
            SqlValue::text(&self.path),
            SqlValue::text(&self.name),
            SqlValue::text(&self.mime_type),
            SqlValue::Integer(self.size),
            SqlValue::opt_int(owner_id),
            SqlValue::opt_int(post_id),
        ]
    }
}

/// Sanitized file name and content type of an upload
fn describe(blob: &NewBlob) -> LearnResult<(String, String)> {
    let name = sanitize_file_name(&blob.file_name)?;
    let mime_type = blob
        .content_type
        .clone()
        .filter(|c| !c.is_empty() && c != "application/octet-stream")
        .unwrap_or_else(|| mime_guess::from_path(&name).first_or_octet_stream().to_string());
    Ok((name, mime_type))
}

async fn write_file(file_path: &std::path::Path, data: &[u8]) -> LearnResult<()> {
    let mut file = fs::File::create(file_path)
        .await
        .map_err(|e| LearnError::Storage(format!("Failed to create file: {}", e)))?;
    file.write_all(data)
        .await
        .map_err(|e| LearnError::Storage(format!("Failed to write file: {}", e)))?;
    file.flush()
        .await
        .map_err(|e| LearnError::Storage(format!("Failed to write file: {}", e)))
}

// ============================================================================
// BlobStore Implementation
// ============================================================================

#[derive(Clone)]
pub struct BlobStore {
    store: Arc<LearnStore>,
    root: PathBuf,
}

impl BlobStore {
    pub fn new(store: Arc<LearnStore>, root: PathBuf) -> Self {
        info!("📁 Learn-Blobs rooted at {:?}", root);
        Self { store, root }
    }

    fn file_path(&self, bucket: &str, path: &str) -> PathBuf {
        self.root.join(bucket).join(path)
    }

    /// Write the bytes of a blob to its bucket without recording it
    pub async fn stage(&self, bucket: Bucket, blob: NewBlob) -> LearnResult<StagedBlob> {
        let (name, mime_type) = describe(&blob)?;
        let path = format!("{}-{}", uuid::Uuid::new_v4(), name);
        let file_path = self.file_path(bucket.as_str(), &path);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| LearnError::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let staged = StagedBlob {
            bucket,
            path,
            name,
            mime_type,
            size: blob.data.len() as i64,
        };
        if let Err(e) = write_file(&file_path, &blob.data).await {
            self.discard(&staged).await;
            return Err(e);
        }
        Ok(staged)
    }

    /// Remove the bytes of a staged blob; failures are only logged
    pub async fn discard(&self, staged: &StagedBlob) {
        let file_path = self.file_path(staged.bucket.as_str(), &staged.path);
        if let Err(e) = fs::remove_file(&file_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {:?}: {}", file_path, e);
            }
        }
    }

    /// Write a blob and record its metadata
    pub async fn put(
        &self,
        bucket: Bucket,
        blob: NewBlob,
        owner_id: Option<i64>,
        post_id: Option<i64>,
    ) -> LearnResult<Attachment> {
        let staged = self.stage(bucket, blob).await?;
        let params = staged.insert_params(owner_id, post_id);
        let id = match self.store.insert(INSERT_ATTACHMENT, params).await {
            Ok(id) => id,
            Err(e) => {
                self.discard(&staged).await;
                return Err(e);
            }
        };

        info!("Stored {}/{} ({} bytes)", bucket.as_str(), staged.name, staged.size);
        self.get(id).await
    }

    /// Metadata by id
    pub async fn get(&self, id: i64) -> LearnResult<Attachment> {
        let row = self
            .store
            .query_one("SELECT * FROM attachments WHERE id = ?", vec![SqlValue::Integer(id)])
            .await?
            .ok_or_else(|| LearnError::not_found("Attachment not found"))?;
        row_to_attachment(&row)
    }

    /// Metadata and bytes
    pub async fn read(&self, id: i64) -> LearnResult<(Attachment, Vec<u8>)> {
        let attachment = self.get(id).await?;
        let data = fs::read(self.file_path(&attachment.bucket, &attachment.path))
            .await
            .map_err(|e| LearnError::Storage(format!("Failed to read file: {}", e)))?;
        Ok((attachment, data))
    }

    /// Remove bytes and metadata; a missing file is not an error
    pub async fn delete(&self, id: i64) -> LearnResult<()> {
        let attachment = self.get(id).await?;
        let file_path = self.file_path(&attachment.bucket, &attachment.path);
        if let Err(e) = fs::remove_file(&file_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(LearnError::Storage(format!("Failed to delete file: {}", e)));
            }
        }

        self.store
            .execute("DELETE FROM attachments WHERE id = ?", vec![SqlValue::Integer(id)])
            .await?;
        debug!("Deleted attachment {}", id);
        Ok(())
    }

    pub async fn for_post(&self, post_id: i64) -> LearnResult<Vec<Attachment>> {
        let rows = self
            .store
            .query(
                "SELECT * FROM attachments WHERE post_id = ? ORDER BY id",
                vec![SqlValue::Integer(post_id)],
            )
            .await?;
        rows.iter().map(|r| row_to_attachment(r)).collect()
    }

    /// Store a new avatar and drop the previous one
    pub async fn set_avatar(&self, user_id: i64, blob: NewBlob) -> LearnResult<Attachment> {
        if blob.data.len() > MAX_AVATAR_SIZE {
            return Err(LearnError::invalid(format!(
                "Avatar too large. Maximum size is {} bytes",
                MAX_AVATAR_SIZE
            )));
        }

        let previous = self
            .store
            .query_one("SELECT avatar_id FROM users WHERE id = ?", vec![SqlValue::Integer(user_id)])
            .await?
            .ok_or_else(|| LearnError::not_found("User not found"))?
            .opt_i64("avatar_id");

        let (_, mime_type) = describe(&blob)?;
        if !mime_type.starts_with("image/") {
            return Err(LearnError::invalid("Avatar must be an image"));
        }
        let avatar = self.put(Bucket::Avatars, blob, Some(user_id), None).await?;

        self.store
            .execute(
                "UPDATE users SET avatar_id = ?, updated_at = ? WHERE id = ?",
                vec![
                    SqlValue::Integer(avatar.id),
                    SqlValue::text(crate::db::now()),
                    SqlValue::Integer(user_id),
                ],
            )
            .await?;

        if let Some(old) = previous {
            self.delete(old).await?;
        }
        info!("User {} updated avatar", user_id);
        Ok(avatar)
    }

    pub async fn avatar(&self, user_id: i64) -> LearnResult<(Attachment, Vec<u8>)> {
        let avatar_id = self
            .store
            .query_one("SELECT avatar_id FROM users WHERE id = ?", vec![SqlValue::Integer(user_id)])
            .await?
            .ok_or_else(|| LearnError::not_found("User not found"))?
            .opt_i64("avatar_id")
            .ok_or_else(|| LearnError::not_found("No avatar set"))?;
        self.read(avatar_id).await
    }
}

fn row_to_attachment(row: &[(String, Value)]) -> LearnResult<Attachment> {
    let id = row.i64_field("id")?;
    Ok(Attachment {
        id,
        bucket: row.str_field("bucket")?,
        path: row.str_field("path")?,
        name: row.str_field("name")?,
        mime_type: row.str_field("mime_type")?,
        size: row.i64_field("size")?,
        owner_id: row.opt_i64("owner_id"),
        post_id: row.opt_i64("post_id"),
        url: format!("/api/attachments/{}", id),
        created_at: row.str_field("created_at")?,
    })
}

// ============================================================================
// API Handlers
// ============================================================================

fn blob_response(attachment: Attachment, data: Vec<u8>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, attachment.mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", attachment.name.replace('"', "")),
            ),
        ],
        data,
    )
}

/// GET /api/attachments/:id
async fn download_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let (attachment, data) = state.blobs.read(id).await?;
    Ok(blob_response(attachment, data))
}

/// PUT /api/avatar - multipart field `avatar`
async fn upload_avatar_handler(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, LearnError> {
    let mut upload: Option<NewBlob> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| LearnError::invalid(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("avatar") {
            let file_name = field.file_name().unwrap_or("avatar").to_string();
            let content_type = field.content_type().map(|s| s.to_string());
            let data = field
                .bytes()
                .await
                .map_err(|e| LearnError::invalid(format!("Failed to read file: {}", e)))?;
            upload = Some(NewBlob {
                file_name,
                content_type,
                data: data.to_vec(),
            });
            break;
        }
    }

    let blob = upload.ok_or_else(|| LearnError::invalid("No avatar provided"))?;
    let avatar = state.blobs.set_avatar(user.id, blob).await?;

    Ok(Json(json!({
        "success": true,
        "data": avatar
    })))
}

/// GET /api/avatar/:userId
async fn get_avatar_handler(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let (attachment, data) = state.blobs.avatar(user_id).await?;
    Ok(blob_response(attachment, data))
}

// ============================================================================
// Router
// ============================================================================

pub fn create_attachments_router(state: AppState) -> Router {
    Router::new()
        .route("/:id", get(download_handler))
        .with_state(state)
}

pub fn create_avatar_router(state: AppState) -> Router {
    Router::new()
        .route("/", put(upload_avatar_handler))
        .route("/:user_id", get(get_avatar_handler))
        .layer(DefaultBodyLimit::max(MAX_AVATAR_SIZE + 64 * 1024))
        .with_state(state)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tempfile::{tempdir, TempDir};

    async fn create_test_store() -> (BlobStore, Arc<LearnStore>, TempDir) {
        let store = Arc::new(LearnStore::in_memory().await.unwrap());
        let dir = tempdir().unwrap();
        (BlobStore::new(store.clone(), dir.path().to_path_buf()), store, dir)
    }

    fn blob(name: &str, content_type: Option<&str>, data: &[u8]) -> NewBlob {
        NewBlob {
            file_name: name.to_string(),
            content_type: content_type.map(String::from),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\notes.txt").unwrap(), "notes.txt");
        assert!(sanitize_file_name("dir/").is_err());
        assert!(sanitize_file_name("..").is_err());
    }

    #[tokio::test]
    async fn test_put_read_delete() {
        let (blobs, _, _dir) = create_test_store().await;

        let stored = blobs
            .put(Bucket::Attachments, blob("hello.txt", None, b"Hello, LearnPath!"), None, None)
            .await
            .unwrap();
        assert_eq!(stored.name, "hello.txt");
        assert_eq!(stored.mime_type, "text/plain");
        assert_eq!(stored.size, 17);

        let (meta, data) = blobs.read(stored.id).await.unwrap();
        assert_eq!(data, b"Hello, LearnPath!");
        assert_eq!(meta.url, format!("/api/attachments/{}", stored.id));

        blobs.delete(stored.id).await.unwrap();
        assert!(matches!(blobs.get(stored.id).await, Err(LearnError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_avatar_replaces_previous() {
        let (blobs, store, _dir) = create_test_store().await;
        let user = testing::insert_user(&store, "pic@learn.dev").await;

        let first = blobs
            .set_avatar(user, blob("me.png", Some("image/png"), &[1, 2, 3]))
            .await
            .unwrap();
        let second = blobs
            .set_avatar(user, blob("me2.png", Some("image/png"), &[4, 5]))
            .await
            .unwrap();

        assert!(blobs.get(first.id).await.is_err());
        let (meta, data) = blobs.avatar(user).await.unwrap();
        assert_eq!(meta.id, second.id);
        assert_eq!(data, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_avatar_must_be_image() {
        let (blobs, store, dir) = create_test_store().await;
        let user = testing::insert_user(&store, "pic@learn.dev").await;

        let result = blobs.set_avatar(user, blob("notes.txt", None, b"hi")).await;
        assert!(matches!(result, Err(LearnError::InvalidPayload(_))));
        assert!(matches!(blobs.avatar(user).await, Err(LearnError::NotFound(_))));

        // Rejected before anything reaches the bucket
        assert!(!dir.path().join("avatars").exists());
        let rows = store.query_i64("SELECT COUNT(*) FROM attachments", vec![]).await.unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_avatar_too_large() {
        let (blobs, store, _dir) = create_test_store().await;
        let user = testing::insert_user(&store, "pic@learn.dev").await;
        let big = vec![0u8; MAX_AVATAR_SIZE + 1];

        let result = blobs.set_avatar(user, blob("big.png", Some("image/png"), &big)).await;
        assert!(result.is_err());
    }
}

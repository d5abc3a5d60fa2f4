//! # Database Module (Learn-Store)
//!
//! Manages the persistent .db file using WAL mode for concurrent high-throughput.
//! This module handles database initialization, the document schema, and provides
//! utilities for executing queries safely.
//!
//! References between documents are plain integer ids; handlers resolve them
//! with follow-up queries or joins at read time.

use crate::error::{LearnError, LearnResult};
use rusqlite::TransactionBehavior;
use serde_json::Value;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// Row data returned from queries
pub type Row = Vec<(String, Value)>;

/// The complete document schema, applied idempotently at open
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT UNIQUE NOT NULL COLLATE NOCASE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    xp INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL DEFAULT 1,
    avg_quiz_score REAL NOT NULL DEFAULT 0,
    last_login_date TEXT,
    current_streak INTEGER NOT NULL DEFAULT 0,
    max_streak INTEGER NOT NULL DEFAULT 0,
    avatar_id INTEGER REFERENCES attachments(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    refresh_token TEXT UNIQUE NOT NULL,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

CREATE TABLE IF NOT EXISTS communities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL COLLATE NOCASE,
    description TEXT NOT NULL,
    domain TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS community_members (
    community_id INTEGER NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    joined_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (community_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_community_members_user ON community_members(user_id);

CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    author_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    community_id INTEGER REFERENCES communities(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_posts_community ON posts(community_id, created_at);
CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author_id, created_at);

CREATE TABLE IF NOT EXISTS comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
    author_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    message TEXT NOT NULL,
    replying_to INTEGER REFERENCES comments(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id, replying_to);

CREATE TABLE IF NOT EXISTS votes (
    target_kind TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    value INTEGER NOT NULL CHECK (value IN (-1, 1)),
    PRIMARY KEY (target_kind, target_id, user_id)
);

CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket TEXT NOT NULL,
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    owner_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    post_id INTEGER REFERENCES posts(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE (bucket, path)
);
CREATE INDEX IF NOT EXISTS idx_attachments_post ON attachments(post_id);

CREATE TABLE IF NOT EXISTS roadmaps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    main_topic TEXT NOT NULL,
    description TEXT NOT NULL,
    total_progress INTEGER NOT NULL DEFAULT 0,
    created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS roadmap_members (
    roadmap_id INTEGER NOT NULL REFERENCES roadmaps(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    progress INTEGER NOT NULL DEFAULT 0,
    joined_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    completed_at TEXT,
    PRIMARY KEY (roadmap_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_roadmap_members_user ON roadmap_members(user_id);

CREATE TABLE IF NOT EXISTS checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    roadmap_id INTEGER NOT NULL REFERENCES roadmaps(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    total_hours_needed REAL,
    UNIQUE (roadmap_id, position)
);

CREATE TABLE IF NOT EXISTS resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    checkpoint_id INTEGER NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    kind TEXT NOT NULL,
    description TEXT,
    difficulty TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    rank INTEGER
);
CREATE INDEX IF NOT EXISTS idx_resources_checkpoint ON resources(checkpoint_id);

CREATE TABLE IF NOT EXISTS checkpoint_progress (
    checkpoint_id INTEGER NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'not_started',
    started_at TEXT,
    completed_at TEXT,
    total_time_ms INTEGER NOT NULL DEFAULT 0,
    feedback_completed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (checkpoint_id, user_id)
);

CREATE TABLE IF NOT EXISTS feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    roadmap_id INTEGER NOT NULL REFERENCES roadmaps(id) ON DELETE CASCADE,
    checkpoint_id INTEGER NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
    rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
    comment TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT,
    UNIQUE (user_id, checkpoint_id)
);

CREATE TABLE IF NOT EXISTS quizzes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    topic TEXT NOT NULL,
    domain TEXT,
    difficulty TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS questions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    quiz_id INTEGER NOT NULL REFERENCES quizzes(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    question TEXT NOT NULL,
    options TEXT NOT NULL,
    correct_option TEXT NOT NULL,
    explanation TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_questions_quiz ON questions(quiz_id, position);

CREATE TABLE IF NOT EXISTS quiz_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    quiz_id INTEGER NOT NULL REFERENCES quizzes(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    score INTEGER NOT NULL,
    total INTEGER NOT NULL,
    answers TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_quiz_attempts_user ON quiz_attempts(user_id, created_at);

CREATE TABLE IF NOT EXISTS achievements (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    xp INTEGER NOT NULL,
    icon TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_achievements (
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    achievement_id INTEGER NOT NULL REFERENCES achievements(id) ON DELETE CASCADE,
    unlocked_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    is_notified INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, achievement_id)
);

CREATE TABLE IF NOT EXISTS xp_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    amount INTEGER NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_xp_history_user ON xp_history(user_id, id);

CREATE TABLE IF NOT EXISTS contributions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    requested_by INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending',
    feedback TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    reviewed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_contributions_user ON contributions(requested_by);
"#;

/// The Learn-Store: manages database connections and provides query utilities
pub struct LearnStore {
    conn: Connection,
}

impl LearnStore {
    /// Creates a new LearnStore with the specified database path
    ///
    /// # Arguments
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    /// A configured LearnStore with WAL mode enabled and the schema applied
    pub async fn new<P: AsRef<Path>>(path: P) -> LearnResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!("Initializing LearnPath store at: {}", path_str);

        let conn = Connection::open(&path_str)
            .await
            .map_err(|e| LearnError::Database(format!("Failed to open database: {}", e)))?;

        Self::initialize_pragmas(&conn).await?;

        let store = Self { conn };
        store.migrate().await?;

        info!("Store initialized with WAL mode");
        Ok(store)
    }

    /// Creates an in-memory database (useful for testing)
    pub async fn in_memory() -> LearnResult<Self> {
        debug!("Initializing in-memory store");

        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| LearnError::Database(format!("Failed to create database: {}", e)))?;

        Self::initialize_pragmas(&conn).await?;

        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    /// Initialize database with production-ready pragmas
    async fn initialize_pragmas(conn: &Connection) -> LearnResult<()> {
        debug!("Setting up database pragmas...");

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA foreign_keys=ON;
                 PRAGMA cache_size=-64000;",
            )?;
            Ok(())
        })
        .await
        .map_err(|e| LearnError::Database(format!("Failed to set pragmas: {}", e)))?;

        Ok(())
    }

    /// Create every table and index that does not exist yet
    pub async fn migrate(&self) -> LearnResult<()> {
        self.execute_batch(SCHEMA.to_string()).await?;
        debug!("Schema applied");
        Ok(())
    }

    /// Execute a write query (INSERT, UPDATE, DELETE)
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> LearnResult<u64> {
        let sql = sql.into();
        self.conn
            .call(move |conn| {
                let params_refs: Vec<&dyn rusqlite::ToSql> = params
                    .iter()
                    .map(|p| p as &dyn rusqlite::ToSql)
                    .collect();
                let affected = conn.execute(&sql, params_refs.as_slice())?;
                Ok(affected as u64)
            })
            .await
            .map_err(LearnError::from)
    }

    /// Execute an INSERT and return the new row id from the same connection call
    pub async fn insert(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> LearnResult<i64> {
        let sql = sql.into();
        self.conn
            .call(move |conn| {
                let params_refs: Vec<&dyn rusqlite::ToSql> = params
                    .iter()
                    .map(|p| p as &dyn rusqlite::ToSql)
                    .collect();
                conn.execute(&sql, params_refs.as_slice())?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(LearnError::from)
    }

    /// Execute batch SQL
    pub async fn execute_batch(&self, sql: String) -> LearnResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(LearnError::from)
    }

    /// Query and return rows as JSON-like structure
    pub async fn query(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> LearnResult<Vec<Row>> {
        let sql = sql.into();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let column_names: Vec<String> = stmt
                    .column_names()
                    .iter()
                    .map(|s| s.to_string())
                    .collect();

                let params_refs: Vec<&dyn rusqlite::ToSql> = params
                    .iter()
                    .map(|p| p as &dyn rusqlite::ToSql)
                    .collect();

                let mut rows_result = Vec::new();
                let mut rows = stmt.query(params_refs.as_slice())?;

                while let Some(row) = rows.next()? {
                    let mut row_data = Vec::with_capacity(column_names.len());
                    for (i, name) in column_names.iter().enumerate() {
                        row_data.push((name.clone(), Self::get_value_from_row(row, i)));
                    }
                    rows_result.push(row_data);
                }

                Ok(rows_result)
            })
            .await
            .map_err(LearnError::from)
    }

    /// Query a single row, `None` when nothing matches
    pub async fn query_one(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> LearnResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Query a single integer (COUNT, MAX, ...), zero when the row is missing
    pub async fn query_i64(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> LearnResult<i64> {
        let row = self.query_one(sql, params).await?;
        Ok(row
            .and_then(|r| r.first().and_then(|(_, v)| v.as_i64()))
            .unwrap_or(0))
    }

    /// Helper to extract value from a row
    fn get_value_from_row(row: &rusqlite::Row, idx: usize) -> Value {
        use rusqlite::types::ValueRef;
        match row.get_ref(idx) {
            Ok(ValueRef::Integer(v)) => serde_json::json!(v),
            Ok(ValueRef::Real(v)) => serde_json::json!(v),
            Ok(ValueRef::Text(v)) => Value::String(String::from_utf8_lossy(v).into_owned()),
            Ok(ValueRef::Blob(v)) => serde_json::json!(format!("<blob:{} bytes>", v.len())),
            Ok(ValueRef::Null) | Err(_) => Value::Null,
        }
    }

    /// Get all table names in the database
    #[cfg(test)]
    pub(crate) async fn list_tables(&self) -> LearnResult<Vec<String>> {
        let rows = self
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                vec![],
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.first().and_then(|(_, v)| v.as_str().map(String::from)))
            .collect())
    }

    /// Execute with transaction
    pub async fn with_transaction<F, T>(&self, f: F) -> LearnResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let result = f(&tx)?;
                tx.commit()?;
                Ok(result)
            })
            .await
            .map_err(LearnError::from)
    }
}

/// Current time as an RFC 3339 UTC string, the format of every stored timestamp
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// SQL Value wrapper for parameters
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn text(s: impl Into<String>) -> Self {
        SqlValue::Text(s.into())
    }

    pub fn opt_text(s: Option<impl Into<String>>) -> Self {
        s.map(|s| SqlValue::Text(s.into())).unwrap_or(SqlValue::Null)
    }

    pub fn opt_int(i: Option<i64>) -> Self {
        i.map(SqlValue::Integer).unwrap_or(SqlValue::Null)
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Convert JSON value to SqlValue
pub fn json_to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Typed field access on query rows
pub trait RowExt {
    fn field(&self, key: &str) -> Option<&Value>;

    fn str_field(&self, key: &str) -> LearnResult<String> {
        self.opt_str(key).ok_or_else(|| missing(key))
    }

    fn opt_str(&self, key: &str) -> Option<String> {
        self.field(key).and_then(|v| v.as_str().map(String::from))
    }

    fn i64_field(&self, key: &str) -> LearnResult<i64> {
        self.opt_i64(key).ok_or_else(|| missing(key))
    }

    fn opt_i64(&self, key: &str) -> Option<i64> {
        self.field(key).and_then(|v| v.as_i64())
    }

    fn f64_field(&self, key: &str) -> LearnResult<f64> {
        self.opt_f64(key).ok_or_else(|| missing(key))
    }

    fn opt_f64(&self, key: &str) -> Option<f64> {
        self.field(key).and_then(|v| v.as_f64())
    }

    fn bool_field(&self, key: &str) -> bool {
        self.opt_i64(key).unwrap_or(0) != 0
    }

    /// Parse a TEXT column holding serialized JSON
    fn json_field<T: serde::de::DeserializeOwned>(&self, key: &str) -> LearnResult<T> {
        let raw = self.str_field(key)?;
        serde_json::from_str(&raw).map_err(LearnError::from)
    }
}

impl RowExt for [(String, Value)] {
    fn field(&self, key: &str) -> Option<&Value> {
        self.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

fn missing(key: &str) -> LearnError {
    LearnError::Internal(anyhow::anyhow!("Missing field: {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_db_has_schema() {
        let store = LearnStore::in_memory().await.unwrap();
        let tables = store.list_tables().await.unwrap();
        for table in ["users", "posts", "roadmaps", "checkpoint_progress", "xp_history"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = LearnStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_row_access() {
        let store = LearnStore::in_memory().await.unwrap();

        let id = store
            .insert(
                "INSERT INTO users (name, email, password_hash) VALUES (?, ?, ?)",
                vec![
                    SqlValue::text("Ada"),
                    SqlValue::text("ada@learn.dev"),
                    SqlValue::text("x"),
                ],
            )
            .await
            .unwrap();
        assert!(id > 0);

        let row = store
            .query_one("SELECT * FROM users WHERE id = ?", vec![SqlValue::Integer(id)])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(row.str_field("name").unwrap(), "Ada");
        assert_eq!(row.i64_field("level").unwrap(), 1);
        assert_eq!(row.f64_field("avg_quiz_score").unwrap(), 0.0);
        assert!(row.opt_str("last_login_date").is_none());
        assert!(row.str_field("nope").is_err());
    }

    #[tokio::test]
    async fn test_json_field_and_text_stays_text() {
        let store = LearnStore::in_memory().await.unwrap();
        let user = store
            .insert(
                "INSERT INTO users (name, email, password_hash) VALUES ('a', 'a@b.cd', 'x')",
                vec![],
            )
            .await
            .unwrap();
        store
            .insert(
                "INSERT INTO posts (title, description, tags, author_id) VALUES (?, ?, ?, ?)",
                vec![
                    SqlValue::text("[1,2]"),
                    SqlValue::text("body"),
                    json_to_sql_value(&serde_json::json!(["rust", "sql"])),
                    SqlValue::Integer(user),
                ],
            )
            .await
            .unwrap();

        let row = store
            .query_one("SELECT title, tags FROM posts", vec![])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.str_field("title").unwrap(), "[1,2]");
        let tags: Vec<String> = row.json_field("tags").unwrap();
        assert_eq!(tags, vec!["rust", "sql"]);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let store = LearnStore::in_memory().await.unwrap();

        let result = store
            .with_transaction(|tx| {
                tx.execute(
                    "INSERT INTO users (name, email, password_hash) VALUES ('a', 'dup@x.io', 'x')",
                    [],
                )?;
                tx.execute(
                    "INSERT INTO users (name, email, password_hash) VALUES ('b', 'dup@x.io', 'x')",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(LearnError::Conflict(_))));

        let count = store.query_i64("SELECT COUNT(*) FROM users", vec![]).await.unwrap();
        assert_eq!(count, 0);
    }
}

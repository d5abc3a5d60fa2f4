//! # Authentication Module (Learn-Auth)
//!
//! Provides JWT-based authentication for LearnPath users.
//!
//! ## Features
//! - User registration/login with email and password
//! - Argon2id password hashing
//! - JWT access tokens (short-lived) and refresh tokens (long-lived)
//! - Session management with token refresh
//! - Daily login streak tracking
//!
//! ## Tables
//! - `users` - Credentials, role, XP/level and streak counters
//! - `sessions` - Tracks active refresh tokens

use crate::api::AppState;
use crate::config::Config;
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::events::{EventBus, LearnEvent};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{NaiveDate, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default access token expiry (1 hour)
const DEFAULT_ACCESS_TOKEN_DURATION: Duration = Duration::from_secs(3600);

/// Default refresh token expiry (7 days)
const DEFAULT_REFRESH_TOKEN_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Minimum password length
const MIN_PASSWORD_LENGTH: usize = 8;

lazy_static! {
    /// One `@`, no whitespace, and a dot somewhere in the domain
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

const USER_COLUMNS: &str = "id, name, email, role, xp, level, avg_quiz_score, current_streak, max_streak, \
                            last_login_date, avatar_id, created_at, updated_at";

// ============================================================================
// Core Types
// ============================================================================

/// Authentication service managing users and sessions
#[derive(Clone)]
pub struct AuthService {
    store: Arc<LearnStore>,
    events: EventBus,
    jwt_secret: Vec<u8>,
    config: Arc<Config>,
    access_token_duration: Duration,
    refresh_token_duration: Duration,
}

/// User data returned from authentication endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: String,
    pub xp: i64,
    pub level: i64,
    pub avg_quiz_score: f64,
    pub current_streak: i64,
    pub max_streak: i64,
    pub last_login_date: Option<String>,
    pub avatar_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Token pair returned after successful authentication
#[derive(Debug, Serialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
    pub user: User,
}

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: i64,
    /// User email
    pub email: String,
    /// `user` or `admin`
    pub role: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at time (Unix timestamp)
    pub iat: u64,
}

/// Authenticated user extracted from request headers
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i64,
    pub email: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    pub fn require_admin(&self) -> LearnResult<()> {
        if !self.is_admin() {
            return Err(LearnError::forbidden("Admin access required"));
        }
        Ok(())
    }
}

/// Authenticated user holding the admin role
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

/// New streak counters after a login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreakUpdate {
    pub current: i64,
    pub max: i64,
    /// The calendar day changed since the last login
    pub day_changed: bool,
}

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityRequest {
    pub community_id: i64,
}

/// Streak counters for a login on `today`
pub fn next_streak(last_login: Option<NaiveDate>, today: NaiveDate, current: i64, max: i64) -> StreakUpdate {
    let current = match last_login {
        None => 1,
        Some(last) if last == today => {
            return StreakUpdate {
                current,
                max,
                day_changed: false,
            }
        }
        Some(last) if last.succ_opt() == Some(today) => current + 1,
        Some(_) => 1,
    };
    StreakUpdate {
        current,
        max: max.max(current),
        day_changed: true,
    }
}

// ============================================================================
// AuthService Implementation
// ============================================================================

impl AuthService {
    /// Creates a new AuthService with the given store and JWT secret
    pub fn new(store: Arc<LearnStore>, events: EventBus, jwt_secret: Vec<u8>, config: Arc<Config>) -> Self {
        info!("🔐 Learn-Auth initialized");
        Self {
            store,
            events,
            jwt_secret,
            config,
            access_token_duration: DEFAULT_ACCESS_TOKEN_DURATION,
            refresh_token_duration: DEFAULT_REFRESH_TOKEN_DURATION,
        }
    }

    /// Generate a secure random JWT secret
    pub fn generate_secret() -> Vec<u8> {
        let mut secret = vec![0u8; 64];
        rand::thread_rng().fill(&mut secret[..]);
        secret
    }

    /// Hash a password using Argon2id
    fn hash_password(&self, password: &str) -> LearnResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();

        argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| LearnError::Internal(anyhow::anyhow!("Password hashing failed: {}", e)))
    }

    /// Verify a password against its hash
    fn verify_password(&self, password: &str, hash: &str) -> LearnResult<bool> {
        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| LearnError::Internal(anyhow::anyhow!("Invalid password hash: {}", e)))?;

        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    /// Generate a JWT access token
    fn generate_access_token(&self, user: &User) -> LearnResult<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| LearnError::Internal(anyhow::anyhow!("Time error: {}", e)))?;

        let claims = Claims {
            sub: user.id,
            email: user.email.clone(),
            role: user.role.clone(),
            iat: now.as_secs(),
            exp: (now + self.access_token_duration).as_secs(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|e| LearnError::Internal(anyhow::anyhow!("JWT encoding failed: {}", e)))
    }

    /// Generate a secure refresh token
    fn generate_refresh_token(&self) -> String {
        use base64::Engine;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Validate a JWT access token and return claims
    pub fn validate_token(&self, token: &str) -> LearnResult<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| LearnError::Unauthorized(format!("Invalid token: {}", e)))
    }

    /// Validate email format
    fn validate_email(&self, email: &str) -> LearnResult<()> {
        if !EMAIL_REGEX.is_match(email) {
            return Err(LearnError::invalid("Invalid email format"));
        }
        Ok(())
    }

    /// Validate password requirements
    fn validate_password(&self, password: &str) -> LearnResult<()> {
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(LearnError::invalid(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }
        Ok(())
    }

    // ========================================================================
    // User Operations
    // ========================================================================

    /// Register a new user
    pub async fn register(&self, req: RegisterRequest) -> LearnResult<AuthTokens> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(LearnError::invalid("Name is required"));
        }
        let email = req.email.trim().to_lowercase();
        self.validate_email(&email)?;
        self.validate_password(&req.password)?;

        let existing = self
            .store
            .query_one("SELECT id FROM users WHERE email = ?", vec![SqlValue::text(&email)])
            .await?;
        if existing.is_some() {
            return Err(LearnError::conflict("User already exists"));
        }

        let password_hash = self.hash_password(&req.password)?;
        let role = if self.config.is_admin_email(&email) {
            "admin"
        } else {
            "user"
        };

        let user_id = self
            .store
            .insert(
                "INSERT INTO users (name, email, password_hash, role) VALUES (?, ?, ?, ?)",
                vec![
                    SqlValue::text(name),
                    SqlValue::text(&email),
                    SqlValue::text(password_hash),
                    SqlValue::text(role),
                ],
            )
            .await?;
        info!("New user registered: {} ({})", email, role);

        let user = self.get_user_by_id(user_id).await?;
        self.create_session(user).await
    }

    /// Authenticate a user and return tokens
    pub async fn login(&self, req: LoginRequest) -> LearnResult<AuthTokens> {
        let email = req.email.trim().to_lowercase();
        let row = self
            .store
            .query_one(
                "SELECT id, password_hash FROM users WHERE email = ?",
                vec![SqlValue::text(&email)],
            )
            .await?
            .ok_or_else(|| LearnError::unauthorized("Invalid credentials"))?;

        let password_hash = row.str_field("password_hash")?;
        if !self.verify_password(&req.password, &password_hash)? {
            return Err(LearnError::unauthorized("Invalid credentials"));
        }

        let user_id = row.i64_field("id")?;
        self.record_login(user_id, Utc::now().date_naive()).await?;

        let user = self.get_user_by_id(user_id).await?;
        info!("User logged in: {}", user.email);
        self.create_session(user).await
    }

    /// Update the login streak for a login on `today`
    pub async fn record_login(&self, user_id: i64, today: NaiveDate) -> LearnResult<StreakUpdate> {
        let row = self
            .store
            .query_one(
                "SELECT last_login_date, current_streak, max_streak FROM users WHERE id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await?
            .ok_or_else(|| LearnError::not_found("User not found"))?;

        let seen = row.opt_str("last_login_date");
        let last = seen
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
        let update = next_streak(
            last,
            today,
            row.opt_i64("current_streak").unwrap_or(0),
            row.opt_i64("max_streak").unwrap_or(0),
        );
        if !update.day_changed {
            return Ok(update);
        }

        // Only the login that still sees the old date moves the streak
        let written = self
            .store
            .execute(
                "UPDATE users SET last_login_date = ?, current_streak = ?, max_streak = ?, updated_at = ? \
                 WHERE id = ? AND last_login_date IS ?",
                vec![
                    SqlValue::text(today.format("%Y-%m-%d").to_string()),
                    SqlValue::Integer(update.current),
                    SqlValue::Integer(update.max),
                    SqlValue::text(crate::db::now()),
                    SqlValue::Integer(user_id),
                    seen.map(SqlValue::Text).unwrap_or(SqlValue::Null),
                ],
            )
            .await?;
        if written == 0 {
            return Ok(StreakUpdate {
                day_changed: false,
                ..update
            });
        }
        debug!("User {} streak is now {}", user_id, update.current);

        self.events.publish(LearnEvent::DailyLogin {
            user_id,
            streak: update.current,
        });
        self.events.publish(LearnEvent::StreakUpdated { user_id });
        Ok(update)
    }

    /// Create a new session with tokens
    async fn create_session(&self, user: User) -> LearnResult<AuthTokens> {
        let access_token = self.generate_access_token(&user)?;
        let refresh_token = self.generate_refresh_token();

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.refresh_token_duration)
                .map_err(|e| LearnError::Internal(anyhow::anyhow!("Time error: {}", e)))?;

        self.store
            .execute(
                "INSERT INTO sessions (user_id, refresh_token, expires_at) VALUES (?, ?, ?)",
                vec![
                    SqlValue::Integer(user.id),
                    SqlValue::text(&refresh_token),
                    SqlValue::text(expires_at.to_rfc3339()),
                ],
            )
            .await?;

        Ok(AuthTokens {
            access_token,
            refresh_token,
            expires_in: self.access_token_duration.as_secs() as i64,
            token_type: "Bearer".to_string(),
            user,
        })
    }

    /// Refresh access token using refresh token; the old token is consumed
    pub async fn refresh(&self, req: RefreshRequest) -> LearnResult<AuthTokens> {
        let row = self
            .store
            .query_one(
                "SELECT user_id, expires_at FROM sessions WHERE refresh_token = ?",
                vec![SqlValue::text(&req.refresh_token)],
            )
            .await?
            .ok_or_else(|| LearnError::unauthorized("Invalid refresh token"))?;

        self.store
            .execute(
                "DELETE FROM sessions WHERE refresh_token = ?",
                vec![SqlValue::text(&req.refresh_token)],
            )
            .await?;

        let expired = chrono::DateTime::parse_from_rfc3339(&row.str_field("expires_at")?)
            .map(|t| t < Utc::now())
            .unwrap_or(true);
        if expired {
            return Err(LearnError::unauthorized("Refresh token expired"));
        }

        let user = self.get_user_by_id(row.i64_field("user_id")?).await?;
        self.create_session(user).await
    }

    /// Logout - invalidate refresh token
    pub async fn logout(&self, refresh_token: &str) -> LearnResult<()> {
        self.store
            .execute(
                "DELETE FROM sessions WHERE refresh_token = ?",
                vec![SqlValue::text(refresh_token)],
            )
            .await?;
        Ok(())
    }

    /// Get user by ID
    pub async fn get_user_by_id(&self, id: i64) -> LearnResult<User> {
        let row = self
            .store
            .query_one(
                format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
                vec![SqlValue::Integer(id)],
            )
            .await?
            .ok_or_else(|| LearnError::not_found("User not found"))?;

        row_to_user(&row)
    }

    /// Update the display name
    pub async fn update_user(&self, user_id: i64, req: UpdateUserRequest) -> LearnResult<User> {
        if let Some(name) = req.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(LearnError::invalid("Name cannot be empty"));
            }
            self.store
                .execute(
                    "UPDATE users SET name = ?, updated_at = ? WHERE id = ?",
                    vec![
                        SqlValue::text(name),
                        SqlValue::text(crate::db::now()),
                        SqlValue::Integer(user_id),
                    ],
                )
                .await?;
        }

        self.get_user_by_id(user_id).await
    }
}

/// Convert database row to User struct
fn row_to_user(row: &[(String, Value)]) -> LearnResult<User> {
    Ok(User {
        id: row.i64_field("id")?,
        name: row.str_field("name")?,
        email: row.str_field("email")?,
        role: row.str_field("role")?,
        xp: row.i64_field("xp")?,
        level: row.i64_field("level")?,
        avg_quiz_score: row.opt_f64("avg_quiz_score").unwrap_or(0.0),
        current_streak: row.i64_field("current_streak")?,
        max_streak: row.i64_field("max_streak")?,
        last_login_date: row.opt_str("last_login_date"),
        avatar_id: row.opt_i64("avatar_id"),
        created_at: row.str_field("created_at")?,
        updated_at: row.str_field("updated_at")?,
    })
}

// ============================================================================
// Auth Extractors
// ============================================================================

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = LearnError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| LearnError::unauthorized("Missing authorization header"))?;

        let claims = state.auth.validate_token(bearer.token())?;

        Ok(AuthUser {
            id: claims.sub,
            email: claims.email,
            role: claims.role,
        })
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = LearnError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        user.require_admin()?;
        Ok(AdminUser(user))
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /api/user/register
async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let tokens = state.auth.register(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": tokens
        })),
    ))
}

/// POST /api/user/login
async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let tokens = state.auth.login(req).await?;
    Ok(Json(json!({
        "success": true,
        "data": tokens
    })))
}

/// POST /api/user/refresh
async fn refresh_handler(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let tokens = state.auth.refresh(req).await?;
    Ok(Json(json!({
        "success": true,
        "data": tokens
    })))
}

/// POST /api/user/logout
async fn logout_handler(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, LearnError> {
    state.auth.logout(&req.refresh_token).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Logged out successfully"
    })))
}

/// GET /api/user/check-auth
async fn me_handler(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<impl IntoResponse, LearnError> {
    let user = state.auth.get_user_by_id(auth_user.id).await?;
    Ok(Json(json!({
        "success": true,
        "data": user
    })))
}

/// PUT /api/user/update
async fn update_user_handler(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let user = state.auth.update_user(auth_user.id, req).await?;
    Ok(Json(json!({
        "success": true,
        "data": user
    })))
}

/// POST /api/user/join-community
async fn join_community_handler(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<CommunityRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let joined = state.communities.join(auth_user.id, req.community_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": if joined { "Joined community" } else { "Already a member" }
    })))
}

/// POST /api/user/leave-community
async fn leave_community_handler(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<CommunityRequest>,
) -> Result<impl IntoResponse, LearnError> {
    state.communities.leave(auth_user.id, req.community_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Left community"
    })))
}

// ============================================================================
// Router
// ============================================================================

/// Creates the user router with all authentication endpoints
pub fn create_auth_router(state: AppState) -> Router {
    Router::new()
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/refresh", post(refresh_handler))
        .route("/logout", post(logout_handler))
        .route("/check-auth", get(me_handler))
        .route("/update", put(update_user_handler))
        .route("/join-community", post(join_community_handler))
        .route("/leave-community", post(leave_community_handler))
        .with_state(state)
}

// ============================================================================
// Tests
// ============================================================================

//! # Quizzes
//!
//! Multiple-choice quizzes generated by the AI client. Questions always have
//! four options labelled A to D; the public view never includes answers.
//!
//! ## Endpoints
//!
//! - `POST /api/quiz/generate` - generate and store a quiz
//! - `GET /api/quiz/:id` - public view of a quiz
//! - `POST /api/quiz/submit` - grade an attempt
//! - `GET /api/quiz/results/:user_id` - a user's attempts grouped by quiz
//! - `GET /api/quiz/user/:user_id` - paginated quizzes a user attempted

use crate::ai::{AiClient, GeneratedQuiz, QuizRequest};
use crate::api::{AppState, PageParams};
use crate::auth::AuthUser;
use crate::db::{LearnStore, RowExt, SqlValue};
use crate::error::{LearnError, LearnResult};
use crate::events::{EventBus, LearnEvent};

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const DEFAULT_DIFFICULTY: &str = "medium";
const DEFAULT_DOMAIN: &str = "general";

/// Default page size of a user's quiz listing
pub const USER_QUIZZES_PAGE_SIZE: i64 = 3;

// ============================================================================
// Answer matching
// ============================================================================

/// Index of a label like `C`, `c)` or `C. ` at the start of `text`
fn label_index(text: &str) -> Option<(usize, &str)> {
    let mut chars = text.chars();
    let letter = chars.next()?;
    if !letter.is_ascii_alphabetic() {
        return None;
    }
    let rest = chars.as_str();
    let body = if rest.is_empty() {
        rest
    } else if let Some(body) = rest.strip_prefix(')').or_else(|| rest.strip_prefix('.')) {
        body.trim_start()
    } else {
        return None;
    };
    let index = (letter.to_ascii_uppercase() as u8 - b'A') as usize;
    Some((index, body))
}

/// Option text without its `X) ` label
fn option_text(option: &str) -> &str {
    let trimmed = option.trim();
    match label_index(trimmed) {
        Some((_, body)) if !body.is_empty() => body,
        _ => trimmed,
    }
}

/// Resolve an answer against a question's options.
///
/// Accepts a bare letter (`"C"`, `"c"`), a labelled option (`"C) Paris"`),
/// or the option text itself, compared case-insensitively.
pub fn resolve_option(options: &[String], answer: &str) -> Option<usize> {
    let answer = answer.trim();
    if answer.is_empty() {
        return None;
    }
    if let Some((index, _)) = label_index(answer) {
        if index < options.len() {
            return Some(index);
        }
    }
    let wanted = option_text(answer).to_lowercase();
    options
        .iter()
        .position(|o| option_text(o).to_lowercase() == wanted)
}

/// `A` for 0, `B` for 1 and so on
pub fn option_letter(index: usize) -> String {
    char::from(b'A' + index as u8).to_string()
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PublicQuestion {
    pub id: i64,
    pub position: i64,
    pub question: String,
    pub options: Vec<String>,
}

/// A quiz without its answers
#[derive(Debug, Clone, Serialize)]
pub struct QuizView {
    pub id: i64,
    pub title: String,
    pub topic: String,
    pub domain: Option<String>,
    pub difficulty: String,
    pub tags: Vec<String>,
    pub created_by: Option<i64>,
    pub created_at: String,
    pub questions: Vec<PublicQuestion>,
}

/// One graded answer, as stored with the attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedAnswer {
    pub question_id: i64,
    pub selected_option: Option<String>,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionReview {
    pub question_id: i64,
    pub question: String,
    pub options: Vec<String>,
    pub selected_option: Option<String>,
    pub correct_option: String,
    pub is_correct: bool,
    pub explanation: String,
}

#[derive(Debug, Serialize)]
pub struct QuizResult {
    pub attempt_id: i64,
    pub quiz_id: i64,
    pub score: i64,
    pub total: i64,
    pub percentage: f64,
    pub review: Vec<QuestionReview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub id: i64,
    pub quiz_id: i64,
    pub score: i64,
    pub total: i64,
    pub percentage: f64,
    pub answers: Vec<GradedAnswer>,
    pub created_at: String,
}

/// A quiz with one user's attempts on it
#[derive(Debug, Serialize)]
pub struct AttemptedQuiz {
    pub quiz_id: i64,
    pub title: String,
    pub topic: String,
    pub difficulty: String,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Serialize)]
pub struct UserQuizzes {
    pub quizzes: Vec<AttemptedQuiz>,
    pub total_quizzes: i64,
    pub current_page: i64,
    pub total_pages: i64,
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GenerateQuizRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerInput {
    pub question_id: i64,
    #[serde(default)]
    pub selected_option: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub quiz_id: i64,
    #[serde(default)]
    pub answers: Vec<AnswerInput>,
}

fn percentage(score: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (score as f64 * 1000.0 / total as f64).round() / 10.0
}

fn persist_quiz(
    conn: &rusqlite::Connection,
    quiz: &GeneratedQuiz,
    title: &str,
    domain: &str,
    user_id: i64,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO quizzes (title, topic, domain, difficulty, tags, created_by) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            title,
            quiz.topic,
            domain,
            quiz.difficulty,
            serde_json::to_string(&quiz.tags).unwrap_or_else(|_| "[]".to_string()),
            user_id
        ],
    )?;
    let quiz_id = conn.last_insert_rowid();

    for (i, q) in quiz.questions.iter().enumerate() {
        let correct = resolve_option(&q.options, &q.correct_option)
            .map(option_letter)
            .unwrap_or_else(|| q.correct_option.clone());
        conn.execute(
            "INSERT INTO questions (quiz_id, position, question, options, correct_option, explanation) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                quiz_id,
                i as i64 + 1,
                q.question,
                serde_json::to_string(&q.options).unwrap_or_else(|_| "[]".to_string()),
                correct,
                q.explanation
            ],
        )?;
    }
    Ok(quiz_id)
}

fn row_to_attempt(row: &[(String, Value)]) -> LearnResult<Attempt> {
    let score = row.i64_field("score")?;
    let total = row.i64_field("total")?;
    Ok(Attempt {
        id: row.i64_field("id")?,
        quiz_id: row.i64_field("quiz_id")?,
        score,
        total,
        percentage: percentage(score, total),
        answers: row.json_field("answers").unwrap_or_default(),
        created_at: row.str_field("created_at")?,
    })
}

// ============================================================================
// QuizService Implementation
// ============================================================================

struct StoredQuestion {
    id: i64,
    question: String,
    options: Vec<String>,
    correct_option: String,
    explanation: String,
}

#[derive(Clone)]
pub struct QuizService {
    store: Arc<LearnStore>,
    events: EventBus,
    ai: Arc<dyn AiClient>,
}

impl QuizService {
    pub fn new(store: Arc<LearnStore>, events: EventBus, ai: Arc<dyn AiClient>) -> Self {
        Self { store, events, ai }
    }

    pub async fn generate(&self, user_id: i64, req: GenerateQuizRequest) -> LearnResult<QuizView> {
        let topic = req.topic.trim().to_string();
        if topic.is_empty() {
            return Err(LearnError::invalid("Topic is required"));
        }
        let domain = req
            .domain
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
        let request = QuizRequest {
            topic: topic.clone(),
            domain: domain.clone(),
            difficulty: req
                .difficulty
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| DEFAULT_DIFFICULTY.to_string()),
            tags: req.tags,
        };

        let mut quiz = self.ai.generate_quiz(&request).await?;
        crate::ai::validate_quiz(&quiz)?;
        if quiz.topic.trim().is_empty() {
            quiz.topic = topic;
        }
        if quiz.difficulty.trim().is_empty() {
            quiz.difficulty = request.difficulty.clone();
        }
        if quiz.tags.is_empty() {
            quiz.tags = request.tags.clone();
        }
        let title = req
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| quiz.title.trim().to_string());

        let quiz_id = self
            .store
            .with_transaction(move |tx| persist_quiz(tx, &quiz, &title, &domain, user_id))
            .await?;
        info!("📝 Generated quiz {} on '{}' for user {}", quiz_id, request.topic, user_id);

        self.get(quiz_id).await
    }

    async fn questions(&self, quiz_id: i64) -> LearnResult<Vec<StoredQuestion>> {
        let rows = self
            .store
            .query(
                "SELECT * FROM questions WHERE quiz_id = ? ORDER BY position",
                vec![SqlValue::Integer(quiz_id)],
            )
            .await?;
        rows.iter()
            .map(|r| {
                Ok(StoredQuestion {
                    id: r.i64_field("id")?,
                    question: r.str_field("question")?,
                    options: r.json_field("options")?,
                    correct_option: r.str_field("correct_option")?,
                    explanation: r.str_field("explanation")?,
                })
            })
            .collect()
    }

    /// Public view of a quiz
    pub async fn get(&self, quiz_id: i64) -> LearnResult<QuizView> {
        let row = self
            .store
            .query_one("SELECT * FROM quizzes WHERE id = ?", vec![SqlValue::Integer(quiz_id)])
            .await?
            .ok_or_else(|| LearnError::not_found("Quiz not found"))?;

        let questions = self
            .questions(quiz_id)
            .await?
            .into_iter()
            .enumerate()
            .map(|(i, q)| PublicQuestion {
                id: q.id,
                position: i as i64 + 1,
                question: q.question,
                options: q.options,
            })
            .collect();

        Ok(QuizView {
            id: quiz_id,
            title: row.str_field("title")?,
            topic: row.str_field("topic")?,
            domain: row.opt_str("domain"),
            difficulty: row.str_field("difficulty")?,
            tags: row.json_field("tags").unwrap_or_default(),
            created_by: row.opt_i64("created_by"),
            created_at: row.str_field("created_at")?,
            questions,
        })
    }

    /// Grade and record an attempt
    pub async fn submit(&self, user_id: i64, req: SubmitRequest) -> LearnResult<QuizResult> {
        self.store
            .query_one("SELECT id FROM quizzes WHERE id = ?", vec![SqlValue::Integer(req.quiz_id)])
            .await?
            .ok_or_else(|| LearnError::not_found("Quiz not found"))?;
        let questions = self.questions(req.quiz_id).await?;

        let mut review = Vec::with_capacity(questions.len());
        for q in questions {
            let selected = req
                .answers
                .iter()
                .find(|a| a.question_id == q.id)
                .and_then(|a| a.selected_option.clone())
                .filter(|s| !s.trim().is_empty());
            let correct = resolve_option(&q.options, &q.correct_option);
            let is_correct = match (&selected, correct) {
                (Some(answer), Some(correct)) => resolve_option(&q.options, answer) == Some(correct),
                _ => false,
            };
            review.push(QuestionReview {
                question_id: q.id,
                question: q.question,
                options: q.options,
                selected_option: selected,
                correct_option: q.correct_option,
                is_correct,
                explanation: q.explanation,
            });
        }

        let total = review.len() as i64;
        let score = review.iter().filter(|r| r.is_correct).count() as i64;
        let graded: Vec<GradedAnswer> = review
            .iter()
            .map(|r| GradedAnswer {
                question_id: r.question_id,
                selected_option: r.selected_option.clone(),
                is_correct: r.is_correct,
            })
            .collect();
        let answers = serde_json::to_string(&graded)?;
        let quiz_id = req.quiz_id;
        let now = crate::db::now();

        let attempt_id = self
            .store
            .with_transaction(move |tx| {
                tx.execute(
                    "INSERT INTO quiz_attempts (quiz_id, user_id, score, total, answers, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![quiz_id, user_id, score, total, answers, now],
                )?;
                let attempt_id = tx.last_insert_rowid();
                tx.execute(
                    "UPDATE users SET avg_quiz_score = \
                     (SELECT COALESCE(AVG(score * 100.0 / total), 0) FROM quiz_attempts WHERE user_id = ?1 AND total > 0), \
                     updated_at = ?2 WHERE id = ?1",
                    params![user_id, now],
                )?;
                Ok(attempt_id)
            })
            .await?;

        info!("User {} scored {}/{} on quiz {}", user_id, score, total, quiz_id);
        self.events.publish(LearnEvent::QuizCompleted {
            user_id,
            quiz_id,
            score,
            total,
        });

        Ok(QuizResult {
            attempt_id,
            quiz_id,
            score,
            total,
            percentage: percentage(score, total),
            review,
        })
    }

    async fn attempts(&self, user_id: i64, quiz_id: i64) -> LearnResult<Vec<Attempt>> {
        let rows = self
            .store
            .query(
                "SELECT * FROM quiz_attempts WHERE user_id = ? AND quiz_id = ? ORDER BY created_at DESC, id DESC",
                vec![SqlValue::Integer(user_id), SqlValue::Integer(quiz_id)],
            )
            .await?;
        rows.iter().map(|r| row_to_attempt(r)).collect()
    }

    async fn require_user(&self, user_id: i64) -> LearnResult<()> {
        self.store
            .query_one("SELECT id FROM users WHERE id = ?", vec![SqlValue::Integer(user_id)])
            .await?
            .ok_or_else(|| LearnError::not_found("User not found"))?;
        Ok(())
    }

    /// Every attempt of a user, grouped by quiz, most recently attempted first
    pub async fn results(&self, user_id: i64) -> LearnResult<Vec<AttemptedQuiz>> {
        self.require_user(user_id).await?;
        self.attempted(user_id, i64::MAX, 0).await
    }

    async fn attempted(&self, user_id: i64, limit: i64, offset: i64) -> LearnResult<Vec<AttemptedQuiz>> {
        let rows = self
            .store
            .query(
                "SELECT q.id, q.title, q.topic, q.difficulty, MAX(a.id) AS last_attempt \
                 FROM quiz_attempts a JOIN quizzes q ON q.id = a.quiz_id \
                 WHERE a.user_id = ? GROUP BY q.id ORDER BY last_attempt DESC LIMIT ? OFFSET ?",
                vec![
                    SqlValue::Integer(user_id),
                    SqlValue::Integer(limit),
                    SqlValue::Integer(offset),
                ],
            )
            .await?;

        let mut quizzes = Vec::with_capacity(rows.len());
        for row in rows {
            let quiz_id = row.i64_field("id")?;
            quizzes.push(AttemptedQuiz {
                quiz_id,
                title: row.str_field("title")?,
                topic: row.str_field("topic")?,
                difficulty: row.str_field("difficulty")?,
                attempts: self.attempts(user_id, quiz_id).await?,
            });
        }
        Ok(quizzes)
    }

    /// One page of the quizzes a user attempted, newest first
    pub async fn for_user(&self, user_id: i64, page: &PageParams) -> LearnResult<UserQuizzes> {
        self.require_user(user_id).await?;
        let page = page.resolve(USER_QUIZZES_PAGE_SIZE);
        let total = self
            .store
            .query_i64(
                "SELECT COUNT(DISTINCT quiz_id) FROM quiz_attempts WHERE user_id = ?",
                vec![SqlValue::Integer(user_id)],
            )
            .await?;
        let quizzes = self.attempted(user_id, page.limit, page.offset()).await?;

        Ok(UserQuizzes {
            quizzes,
            total_quizzes: total,
            current_page: page.page,
            total_pages: page.total_pages(total),
        })
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /api/quiz/generate
async fn generate_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<GenerateQuizRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let quiz = state.quizzes.generate(user.id, req).await?;
    Ok(Json(json!({
        "success": true,
        "data": quiz
    })))
}

/// GET /api/quiz/:id
async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let quiz = state.quizzes.get(id).await?;
    Ok(Json(json!({
        "success": true,
        "data": quiz
    })))
}

/// POST /api/quiz/submit
async fn submit_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, LearnError> {
    let result = state.quizzes.submit(user.id, req).await?;
    Ok(Json(json!({
        "success": true,
        "data": result
    })))
}

/// GET /api/quiz/results/:user_id
async fn results_handler(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, LearnError> {
    let results = state.quizzes.results(user_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": results
    })))
}

/// GET /api/quiz/user/:user_id
pub(crate) async fn user_quizzes_handler(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, LearnError> {
    let quizzes = state.quizzes.for_user(user_id, &page).await?;
    Ok(Json(json!({
        "success": true,
        "data": quizzes
    })))
}

pub fn create_quiz_router(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/submit", post(submit_handler))
        .route("/results/:user_id", get(results_handler))
        .route("/user/:user_id", get(user_quizzes_handler))
        .route("/:id", get(get_handler))
        .with_state(state)
}

//! # AI Generation Client
//!
//! Roadmap and quiz content comes from an external generation service.
//! Its output is trusted after light structural validation: the shape has
//! to be right, the content is stored as-is.

use crate::error::{LearnError, LearnResult};
use crate::quizzes::resolve_option;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Generated roadmap, in the service's wire format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRoadmap {
    #[serde(default)]
    pub main_topic: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub checkpoints: Vec<GeneratedCheckpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedCheckpoint {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_hours")]
    pub total_hours_needed: Option<f64>,
    #[serde(default)]
    pub resources: Vec<GeneratedResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedResource {
    pub name: String,
    pub url: String,
    #[serde(rename = "type", default = "default_resource_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub rank: Option<i64>,
}

fn default_resource_kind() -> String {
    "documentation".to_string()
}

/// Hours arrive as a number or a numeric string
fn lenient_hours<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Parameters for quiz generation
#[derive(Debug, Clone, Serialize)]
pub struct QuizRequest {
    pub topic: String,
    pub domain: String,
    pub difficulty: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuiz {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub questions: Vec<GeneratedQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuestion {
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_option: String,
    #[serde(default)]
    pub explanation: String,
}

/// Source of generated learning content
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn generate_roadmap(&self, topic: &str) -> LearnResult<GeneratedRoadmap>;

    async fn generate_quiz(&self, request: &QuizRequest) -> LearnResult<GeneratedQuiz>;
}

// ============================================================================
// Validation
// ============================================================================

/// Remove a surrounding markdown code fence, if any
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Decode a service response body: a JSON object, or a JSON string holding
/// (possibly fenced) JSON text
pub fn parse_payload(body: &str) -> LearnResult<Value> {
    let value: Value = serde_json::from_str(strip_code_fences(body))
        .map_err(|e| LearnError::Upstream(format!("Generation service returned invalid JSON: {}", e)))?;

    let value = match value {
        Value::String(inner) => serde_json::from_str(strip_code_fences(&inner))
            .map_err(|e| LearnError::Upstream(format!("Generation service returned invalid JSON: {}", e)))?,
        other => other,
    };

    if let Some(error) = value.get("error") {
        let message = error.as_str().map(String::from).unwrap_or_else(|| error.to_string());
        return Err(LearnError::Upstream(message));
    }
    Ok(value)
}

pub fn validate_roadmap(roadmap: &GeneratedRoadmap) -> LearnResult<()> {
    if roadmap.main_topic.trim().is_empty() {
        return Err(LearnError::Upstream("Generated roadmap has no main topic".into()));
    }
    if roadmap.description.trim().is_empty() {
        return Err(LearnError::Upstream("Generated roadmap has no description".into()));
    }
    if roadmap.checkpoints.is_empty() {
        return Err(LearnError::Upstream("Generated roadmap has no checkpoints".into()));
    }
    if roadmap.checkpoints.iter().any(|c| c.title.trim().is_empty()) {
        return Err(LearnError::Upstream("Generated checkpoint is missing a title".into()));
    }
    Ok(())
}

pub fn validate_quiz(quiz: &GeneratedQuiz) -> LearnResult<()> {
    if quiz.title.trim().is_empty() {
        return Err(LearnError::Upstream("Generated quiz has no title".into()));
    }
    if quiz.questions.is_empty() {
        return Err(LearnError::Upstream("Generated quiz has no questions".into()));
    }
    for (i, q) in quiz.questions.iter().enumerate() {
        if q.options.len() != 4 {
            return Err(LearnError::Upstream(format!(
                "Question {} has {} options, expected 4",
                i + 1,
                q.options.len()
            )));
        }
        if resolve_option(&q.options, &q.correct_option).is_none() {
            return Err(LearnError::Upstream(format!("Question {} has no valid correct option", i + 1)));
        }
        if q.explanation.trim().is_empty() {
            return Err(LearnError::Upstream(format!("Question {} has no explanation", i + 1)));
        }
    }
    Ok(())
}

// ============================================================================
// HTTP client
// ============================================================================

/// Client for the generation service's HTTP API
#[derive(Clone)]
pub struct HttpAiClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> LearnResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("🤖 AI generation service at {}", base_url);
        Ok(Self { client, base_url })
    }

    async fn post(&self, path: &str, body: &Value) -> LearnResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self.client.post(&url).headers(headers).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = match parse_payload(&text) {
                Err(LearnError::Upstream(m)) => m,
                _ => text,
            };
            return Err(LearnError::Upstream(format!(
                "Generation service responded {}: {}",
                status.as_u16(),
                message
            )));
        }

        parse_payload(&text)
    }
}

impl std::fmt::Debug for HttpAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn generate_roadmap(&self, topic: &str) -> LearnResult<GeneratedRoadmap> {
        let value = self.post("/api/generate-roadmap", &json!({ "topic": topic })).await?;
        let roadmap: GeneratedRoadmap = serde_json::from_value(value)
            .map_err(|e| LearnError::Upstream(format!("Malformed roadmap: {}", e)))?;
        validate_roadmap(&roadmap)?;
        Ok(roadmap)
    }

    async fn generate_quiz(&self, request: &QuizRequest) -> LearnResult<GeneratedQuiz> {
        let value = self
            .post("/api/generate-quiz", &serde_json::to_value(request)?)
            .await?;
        let quiz: GeneratedQuiz = serde_json::from_value(value)
            .map_err(|e| LearnError::Upstream(format!("Malformed quiz: {}", e)))?;
        validate_quiz(&quiz)?;
        Ok(quiz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};

    fn question(correct: &str) -> GeneratedQuestion {
        GeneratedQuestion {
            question: "Capital of France?".to_string(),
            options: vec!["A) Berlin".into(), "B) Madrid".into(), "C) Paris".into(), "D) Rome".into()],
            correct_option: correct.to_string(),
            explanation: "Paris is the capital.".to_string(),
        }
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_parse_payload_string_wrapped() {
        let body = serde_json::to_string("```json\n{\"mainTopic\":\"Rust\"}\n```").unwrap();
        let value = parse_payload(&body).unwrap();
        assert_eq!(value["mainTopic"], "Rust");
    }

    #[test]
    fn test_parse_payload_error_field() {
        let err = parse_payload(r#"{"error": "model overloaded"}"#).unwrap_err();
        assert!(matches!(err, LearnError::Upstream(m) if m == "model overloaded"));
        assert!(parse_payload("not json").is_err());
    }

    #[test]
    fn test_roadmap_hours_are_lenient() {
        let roadmap: GeneratedRoadmap = serde_json::from_value(json!({
            "mainTopic": "Rust",
            "description": "Systems language",
            "checkpoints": [
                { "title": "Basics", "totalHoursNeeded": "12" },
                { "title": "Ownership", "totalHoursNeeded": 8.5,
                  "resources": [{ "name": "Book", "url": "https://doc.rust-lang.org/book", "type": "documentation" }] },
                { "title": "Traits", "totalHoursNeeded": "a while" }
            ]
        }))
        .unwrap();

        assert_eq!(roadmap.checkpoints[0].total_hours_needed, Some(12.0));
        assert_eq!(roadmap.checkpoints[1].total_hours_needed, Some(8.5));
        assert_eq!(roadmap.checkpoints[1].resources[0].kind, "documentation");
        assert_eq!(roadmap.checkpoints[2].total_hours_needed, None);
        assert!(validate_roadmap(&roadmap).is_ok());
    }

    #[test]
    fn test_roadmap_validation() {
        let mut roadmap = GeneratedRoadmap {
            main_topic: "Rust".into(),
            description: "d".into(),
            checkpoints: vec![],
        };
        assert!(validate_roadmap(&roadmap).is_err());

        roadmap.checkpoints.push(GeneratedCheckpoint {
            title: " ".into(),
            description: String::new(),
            total_hours_needed: None,
            resources: vec![],
        });
        assert!(validate_roadmap(&roadmap).is_err());
    }

    #[test]
    fn test_quiz_validation() {
        let mut quiz = GeneratedQuiz {
            title: "Geography".into(),
            topic: "capitals".into(),
            difficulty: "beginner".into(),
            tags: vec![],
            questions: vec![question("C")],
        };
        assert!(validate_quiz(&quiz).is_ok());

        quiz.questions[0].options.pop();
        assert!(validate_quiz(&quiz).is_err());

        quiz.questions = vec![question("Z")];
        assert!(validate_quiz(&quiz).is_err());

        quiz.questions = vec![question("A")];
        quiz.questions[0].explanation.clear();
        assert!(validate_quiz(&quiz).is_err());
    }

    async fn fake_service() -> String {
        let app = Router::new()
            .route(
                "/api/generate-roadmap",
                post(|| async {
                    Json(json!({
                        "mainTopic": "Rust",
                        "description": "Learn Rust",
                        "checkpoints": [{ "title": "Basics", "description": "Syntax" }]
                    }))
                }),
            )
            .route(
                "/api/generate-quiz",
                post(|| async {
                    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "quota exceeded" })))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_http_client_against_fake_service() {
        let base = fake_service().await;
        let client = HttpAiClient::new(base, Duration::from_secs(5)).unwrap();

        let roadmap = client.generate_roadmap("rust").await.unwrap();
        assert_eq!(roadmap.main_topic, "Rust");
        assert_eq!(roadmap.checkpoints.len(), 1);

        let err = client
            .generate_quiz(&QuizRequest {
                topic: "rust".into(),
                domain: "Computer Science".into(),
                difficulty: "beginner".into(),
                tags: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LearnError::Upstream(m) if m.contains("500") && m.contains("quota exceeded")));
    }
}

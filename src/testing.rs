//! Shared fixtures for unit and router tests

use crate::ai::{AiClient, GeneratedCheckpoint, GeneratedQuestion, GeneratedQuiz, GeneratedResource, GeneratedRoadmap, QuizRequest};
use crate::api::{create_router, AppState};
use crate::config::Config;
use crate::db::{LearnStore, SqlValue};
use crate::error::{LearnError, LearnResult};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tower::util::ServiceExt;

/// Insert a user named "Test User" and return its id
pub(crate) async fn insert_user(store: &LearnStore, email: &str) -> i64 {
    store
        .insert(
            "INSERT INTO users (name, email, password_hash) VALUES (?, ?, ?)",
            vec![
                SqlValue::text("Test User"),
                SqlValue::text(email),
                SqlValue::text("not-a-real-hash"),
            ],
        )
        .await
        .unwrap()
}

/// Deterministic generation service
#[derive(Default)]
pub(crate) struct StubAi {
    roadmap_calls: AtomicUsize,
    quiz_calls: AtomicUsize,
    fail: AtomicBool,
}

impl StubAi {
    pub fn roadmap_calls(&self) -> usize {
        self.roadmap_calls.load(Ordering::SeqCst)
    }

    pub fn quiz_calls(&self) -> usize {
        self.quiz_calls.load(Ordering::SeqCst)
    }

    /// Make the next generation call fail
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> LearnResult<()> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(LearnError::Upstream("Generation service responded 503: busy".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AiClient for StubAi {
    async fn generate_roadmap(&self, topic: &str) -> LearnResult<GeneratedRoadmap> {
        self.roadmap_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        let checkpoint = |title: &str, hours: f64| GeneratedCheckpoint {
            title: title.to_string(),
            description: format!("{} for {}", title, topic),
            total_hours_needed: Some(hours),
            resources: vec![GeneratedResource {
                name: format!("{} guide", title),
                url: "https://example.com/guide".to_string(),
                kind: "documentation".to_string(),
                description: None,
                difficulty: Some("beginner".to_string()),
                tags: vec![topic.to_lowercase()],
                rank: Some(1),
            }],
        };
        Ok(GeneratedRoadmap {
            main_topic: format!("{} Programming", topic),
            description: format!("Learn {} step by step", topic),
            checkpoints: vec![
                checkpoint("Basics", 4.0),
                checkpoint("Intermediate", 8.0),
                checkpoint("Advanced", 12.0),
            ],
        })
    }

    async fn generate_quiz(&self, request: &QuizRequest) -> LearnResult<GeneratedQuiz> {
        self.quiz_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        let options = |items: [&str; 4]| items.iter().map(|s| s.to_string()).collect();
        Ok(GeneratedQuiz {
            title: format!("{} Basics", request.topic),
            topic: request.topic.clone(),
            difficulty: request.difficulty.clone(),
            tags: request.tags.clone(),
            questions: vec![
                GeneratedQuestion {
                    question: "What enforces memory safety at compile time?".to_string(),
                    options: options(["Garbage collector", "Borrow checker", "Runtime", "Linker"]),
                    correct_option: "B) Borrow checker".to_string(),
                    explanation: "The borrow checker validates references.".to_string(),
                },
                GeneratedQuestion {
                    question: "Which declares a mutable binding?".to_string(),
                    options: options(["let mut", "var", "mut let", "const"]),
                    correct_option: "A".to_string(),
                    explanation: "Bindings are immutable unless marked mut.".to_string(),
                },
            ],
        })
    }
}

/// A full router over an in-memory store and a temporary blob directory
pub(crate) struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub ai: Arc<StubAi>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            in_memory: true,
            jwt_secret: Some("test-secret".to_string()),
            storage_path: dir.path().to_path_buf(),
            admin_emails: vec!["admin@learn.dev".to_string()],
            ..Config::default()
        };
        let store = Arc::new(LearnStore::in_memory().await.unwrap());
        let ai = Arc::new(StubAi::default());
        let state = AppState::new(store, config, ai.clone()).await.unwrap();
        Self {
            router: create_router(state.clone()),
            state,
            ai,
            _dir: dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn json(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.json(Method::GET, uri, token, None).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.json(Method::POST, uri, token, Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.json(Method::PUT, uri, token, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.json(Method::DELETE, uri, token, Some(body)).await
    }

    /// Register an account and return its id and access token
    pub async fn register(&self, name: &str, email: &str) -> (i64, String) {
        let (status, body) = self
            .post(
                "/api/user/register",
                None,
                json!({ "name": name, "email": email, "password": "correct horse battery" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
        let id = body["data"]["user"]["id"].as_i64().unwrap();
        let token = body["data"]["access_token"].as_str().unwrap().to_string();
        (id, token)
    }

    /// Create a text-only post through the multipart endpoint
    pub async fn create_post(&self, token: &str, title: &str, community: Option<i64>) -> i64 {
        let boundary = "learnpath-test-boundary";
        let mut fields = vec![
            ("title", title.to_string()),
            ("description", format!("About {}", title)),
            ("tags", "rust, testing".to_string()),
        ];
        if let Some(id) = community {
            fields.push(("community", id.to_string()));
        }

        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            ));
        }
        body.push_str(&format!("--{}--\r\n", boundary));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/post/create")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, body) = self.send(request).await;
        assert_eq!(status, StatusCode::CREATED, "create post failed: {}", body);
        body["data"]["id"].as_i64().unwrap()
    }
}

//! # 🧭 LearnPath
//!
//! Backend for a learning platform where users follow AI-generated
//! roadmaps, take quizzes, earn XP and achievements, and talk in
//! community forums.
//!
//! ## Core Components
//!
//! - **Learn-Store**: SQLite document store in WAL mode ([`db`])
//! - **Learn-Auth**: Argon2 passwords, JWT access tokens, refresh sessions ([`auth`])
//! - **Progress engine**: checkpoint state machine ([`progress`]) driving [`roadmaps`]
//! - **Events**: activity bus feeding [`xp`] and [`achievements`] ([`events`])
//! - **Generation client**: roadmap and quiz content from an AI service ([`ai`])
//! - **Forum**: [`communities`], [`posts`], [`comments`] with file [`attachments`]

pub mod achievements;
pub mod ai;
pub mod api;
pub mod attachments;
pub mod auth;
pub mod comments;
pub mod communities;
pub mod config;
pub mod contributions;
pub mod db;
pub mod error;
pub mod events;
pub mod posts;
pub mod profiles;
pub mod progress;
pub mod quizzes;
pub mod roadmaps;
pub mod xp;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{LearnError, LearnResult};

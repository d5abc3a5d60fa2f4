//! # Configuration
//!
//! Runtime settings from CLI flags and `LEARNPATH_*` environment variables.
//! A `.env` file in the working directory is loaded first; environment
//! variables override flags.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LearnError, LearnResult};

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database file path
    pub db_path: String,
    /// Use in-memory database
    pub in_memory: bool,
    /// Host to bind to
    pub host: String,
    /// Server port
    pub port: u16,
    /// JWT secret for authentication
    pub jwt_secret: Option<String>,
    /// Root directory for attachment and avatar blobs
    pub storage_path: PathBuf,
    /// Base URL of the AI generation service
    pub ai_base_url: String,
    /// Request timeout for the AI generation service
    pub ai_timeout: Duration,
    /// Emails that are granted the admin role on registration
    pub admin_emails: Vec<String>,
    /// Print usage and exit
    pub show_help: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "learnpath.db".to_string(),
            in_memory: false,
            host: "0.0.0.0".to_string(),
            port: 3000,
            jwt_secret: None,
            storage_path: PathBuf::from("./learnpath_storage"),
            ai_base_url: "http://localhost:5000".to_string(),
            ai_timeout: Duration::from_secs(60),
            admin_emails: Vec::new(),
            show_help: false,
        }
    }
}

impl Config {
    /// Build configuration from process arguments and environment
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let args: Vec<String> = env::args().collect();
        let mut config = Self::from_args(&args);
        config.apply_env(|key| env::var(key).ok());
        config
    }

    /// Parse CLI flags (first element is the program name)
    pub fn from_args(args: &[String]) -> Self {
        let mut config = Config::default();
        let mut i = 1;

        while i < args.len() {
            let value = args.get(i + 1);
            match args[i].as_str() {
                "--db" | "-d" => {
                    if let Some(v) = value {
                        config.db_path = v.clone();
                        i += 1;
                    }
                }
                "--port" | "-p" => {
                    if let Some(v) = value {
                        config.port = v.parse().unwrap_or(config.port);
                        i += 1;
                    }
                }
                "--host" | "-h" => {
                    if let Some(v) = value {
                        config.host = v.clone();
                        i += 1;
                    }
                }
                "--storage" | "-s" => {
                    if let Some(v) = value {
                        config.storage_path = PathBuf::from(v);
                        i += 1;
                    }
                }
                "--memory" | "-m" => config.in_memory = true,
                "--help" => config.show_help = true,
                _ => {}
            }
            i += 1;
        }

        config
    }

    /// Apply `LEARNPATH_*` overrides from a variable lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("LEARNPATH_PORT") {
            self.port = port.parse().unwrap_or(self.port);
        }
        if let Some(db) = lookup("LEARNPATH_DB_PATH") {
            self.db_path = db;
        }
        if let Some(host) = lookup("LEARNPATH_HOST") {
            self.host = host;
        }
        if lookup("LEARNPATH_MEMORY").is_some() {
            self.in_memory = true;
        }
        if let Some(secret) = lookup("LEARNPATH_JWT_SECRET") {
            self.jwt_secret = Some(secret);
        }
        if let Some(storage) = lookup("LEARNPATH_STORAGE_PATH") {
            self.storage_path = PathBuf::from(storage);
        }
        if let Some(url) = lookup("LEARNPATH_AI_URL") {
            self.ai_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(secs) = lookup("LEARNPATH_AI_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.ai_timeout = Duration::from_secs(secs);
        }
        if let Some(emails) = lookup("LEARNPATH_ADMIN_EMAILS") {
            self.admin_emails = emails
                .split(',')
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect();
        }
    }

    /// Socket address the server binds to
    pub fn bind_addr(&self) -> LearnResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| LearnError::invalid(format!("Invalid bind address: {}", e)))
    }

    /// Whether an email is configured as an administrator
    pub fn is_admin_email(&self, email: &str) -> bool {
        let email = email.to_lowercase();
        self.admin_emails.iter().any(|e| *e == email)
    }
}

pub fn print_help() {
    println!(
        r#"
LearnPath - learning platform API

USAGE:
    learnpath [OPTIONS]

OPTIONS:
    -d, --db <PATH>        Database file path [default: learnpath.db]
    -p, --port <PORT>      Server port [default: 3000]
    -h, --host <HOST>      Host to bind to [default: 0.0.0.0]
    -s, --storage <DIR>    Blob storage directory [default: ./learnpath_storage]
    -m, --memory           Use in-memory database
        --help             Print this help message

ENVIRONMENT VARIABLES:
    LEARNPATH_PORT             Server port
    LEARNPATH_DB_PATH          Database file path
    LEARNPATH_HOST             Host to bind to
    LEARNPATH_MEMORY           Set to use in-memory database
    LEARNPATH_JWT_SECRET       JWT signing secret (random when unset)
    LEARNPATH_STORAGE_PATH     Blob storage directory
    LEARNPATH_AI_URL           AI generation service base URL
    LEARNPATH_AI_TIMEOUT_SECS  AI request timeout in seconds
    LEARNPATH_ADMIN_EMAILS     Comma separated admin emails
    RUST_LOG                   Log filter [default: learnpath=info,tower_http=info]
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cli_flags() {
        let config = Config::from_args(&args(&[
            "learnpath", "--db", "x.db", "-p", "8080", "--memory", "--storage", "/tmp/blobs",
        ]));
        assert_eq!(config.db_path, "x.db");
        assert_eq!(config.port, 8080);
        assert!(config.in_memory);
        assert_eq!(config.storage_path, PathBuf::from("/tmp/blobs"));
    }

    #[test]
    fn test_bad_port_keeps_default() {
        let config = Config::from_args(&args(&["learnpath", "--port", "nope"]));
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LEARNPATH_PORT", "9000"),
            ("LEARNPATH_AI_URL", "http://ai:5000/"),
            ("LEARNPATH_ADMIN_EMAILS", "Root@Example.com, ops@example.com,"),
            ("LEARNPATH_AI_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::from_args(&args(&["learnpath", "-p", "8080"]));
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.port, 9000);
        assert_eq!(config.ai_base_url, "http://ai:5000");
        assert_eq!(config.ai_timeout, Duration::from_secs(5));
        assert!(config.is_admin_email("root@example.com"));
        assert!(config.is_admin_email("OPS@example.com"));
        assert!(!config.is_admin_email("user@example.com"));
    }

    #[test]
    fn test_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 3000);
    }
}

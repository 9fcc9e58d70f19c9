// src/error.rs

//! Unified error handling for the collector.

use std::fmt;

use thiserror::Error;

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error (bad partition count, zero credentials, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential could not be authenticated
    #[error("Authentication failed for {username}: {message}")]
    Auth { username: String, message: String },

    /// Remote API returned an unusable response after retries
    #[error("API error for {context}: {message}")]
    Api { context: String, message: String },

    /// Checkpoint/batch persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Worker stopped at a batch boundary after a cancellation request;
    /// its checkpoint remains valid for resume
    #[error("collection cancelled")]
    Cancelled,
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an authentication error.
    pub fn auth(username: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Auth {
            username: username.into(),
            message: message.to_string(),
        }
    }

    /// Create an API error with context.
    pub fn api(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Api {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

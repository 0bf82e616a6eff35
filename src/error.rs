//! Error taxonomy for the message pipeline.
//!
//! Only a parse failure rejects a message outright. Classifier and store
//! failures are transient from the sender's point of view: the caller must
//! answer with a temporary failure and never fall back to a default verdict.

use std::time::Duration;

/// The raw byte stream could not be interpreted as an email message.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message is empty")]
    Empty,
    #[error("message has no header section: {0}")]
    MissingHeaders(String),
    #[error("malformed MIME structure: {0}")]
    Mime(#[from] mailparse::MailParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("failed to load model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },
    #[error("model produced an invalid probability: {0}")]
    InvalidProbability(f64),
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("classifier did not answer within {0:?}")]
    ClassifierTimeout(Duration),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("store did not answer within {0:?}")]
    StoreTimeout(Duration),
}

impl PipelineError {
    /// True when the message must be refused permanently rather than retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, PipelineError::Parse(_))
    }
}

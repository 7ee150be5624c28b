// src/errors.rs
use std::error::Error as StdError;
use std::fmt;

/// Behavioral error taxonomy (spec §7). These are the kinds a caller
/// needs to branch on, not a 1:1 mirror of every failure site.
#[derive(Debug, Clone)]
pub enum Error {
    /// Timeout, 5xx — recovered locally with retry/backoff, never user-visible.
    NetworkTransient(String),
    /// 404, DNS failure — recorded in the retry ledger and skipped.
    NetworkPermanent(String),
    /// A listing couldn't be parsed out of a scraper payload.
    ParseFailed(String),
    /// List-page price disagreed with the detail-page price beyond tolerance.
    PriceMismatch { url: String, list_price: i64, detail_price: i64 },
    /// Two or more master properties matched a listing's identity key.
    AmbiguousMatch(String),
    /// A composite-unique insert collided with a concurrent writer.
    UniqueConstraint(String),
    /// A safe-point observed the task's pause flag set.
    TaskPaused,
    /// A safe-point observed the task's cancel flag set; unwinds to the
    /// orchestrator's per-pair boundary.
    TaskCancelled,
    /// DB connectivity loss or schema corruption — aborts the whole task.
    FatalSchemaError(String),
    Db(String),
    NotFound(String),
    BadInput(String),
    Precondition(String),
    Conflict(String),
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NetworkTransient(msg) => write!(f, "transient network error: {msg}"),
            Error::NetworkPermanent(msg) => write!(f, "permanent network error: {msg}"),
            Error::ParseFailed(msg) => write!(f, "parse failed: {msg}"),
            Error::PriceMismatch { url, list_price, detail_price } => write!(
                f,
                "price mismatch at {url}: list={list_price} detail={detail_price}"
            ),
            Error::AmbiguousMatch(msg) => write!(f, "ambiguous match: {msg}"),
            Error::UniqueConstraint(msg) => write!(f, "unique constraint violated: {msg}"),
            Error::TaskPaused => write!(f, "task paused"),
            Error::TaskCancelled => write!(f, "task cancelled"),
            Error::FatalSchemaError(msg) => write!(f, "fatal schema error: {msg}"),
            Error::Db(msg) => write!(f, "database error: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::BadInput(msg) => write!(f, "bad input: {msg}"),
            Error::Precondition(msg) => write!(f, "precondition failed: {msg}"),
            Error::Conflict(msg) => write!(f, "conflict: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl StdError for Error {}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::UniqueConstraint(err.to_string())
            }
            _ => Error::Db(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16()) == Some(404) {
            Error::NetworkPermanent(err.to_string())
        } else {
            Error::NetworkTransient(err.to_string())
        }
    }
}

/// A user-visible error, carrying the context spec §7 requires for every
/// surfaced failure.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VisibleError {
    pub timestamp: chrono::NaiveDateTime,
    pub source_site: Option<String>,
    pub area: Option<String>,
    pub url: Option<String>,
    pub human_message: String,
    pub kind: String,
}

impl VisibleError {
    pub fn new(kind: &str, human_message: impl Into<String>) -> Self {
        VisibleError {
            timestamp: chrono::Utc::now().naive_utc(),
            source_site: None,
            area: None,
            url: None,
            human_message: human_message.into(),
            kind: kind.to_string(),
        }
    }

    pub fn with_context(
        mut self,
        source_site: Option<String>,
        area: Option<String>,
        url: Option<String>,
    ) -> Self {
        self.source_site = source_site;
        self.area = area;
        self.url = url;
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;

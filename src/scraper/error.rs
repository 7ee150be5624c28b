use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub enum ScraperError {
    Network(String),
    Blocked(String),
    HtmlParse(String),
    MissingField(String),
    UnexpectedShape(String),
}

impl fmt::Display for ScraperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScraperError::Network(msg) => write!(f, "network error: {msg}"),
            ScraperError::Blocked(msg) => write!(f, "blocked by site: {msg}"),
            ScraperError::HtmlParse(msg) => write!(f, "HTML parse error: {msg}"),
            ScraperError::MissingField(msg) => write!(f, "missing field: {msg}"),
            ScraperError::UnexpectedShape(msg) => write!(f, "unexpected page shape: {msg}"),
        }
    }
}

impl StdError for ScraperError {}

impl From<ScraperError> for crate::errors::Error {
    fn from(err: ScraperError) -> Self {
        match err {
            ScraperError::Network(msg) => crate::errors::Error::NetworkTransient(msg),
            ScraperError::Blocked(msg) => crate::errors::Error::NetworkPermanent(msg),
            ScraperError::HtmlParse(msg) | ScraperError::MissingField(msg) | ScraperError::UnexpectedShape(msg) => {
                crate::errors::Error::ParseFailed(msg)
            }
        }
    }
}

impl From<reqwest::Error> for ScraperError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16()) == Some(404) {
            ScraperError::Blocked(err.to_string())
        } else {
            ScraperError::Network(err.to_string())
        }
    }
}

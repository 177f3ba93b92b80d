use thiserror::Error;
use tokio::sync::mpsc;

use crate::record::ResultRecord;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Required startup input is missing or malformed.
    #[error("Config Error: {0}")]
    Config(String),

    /// Network hiccup, timeout or empty body. Worth another attempt.
    #[error("Transient Error for roll {roll}: {reason}")]
    Transient { roll: String, reason: String },

    #[error("Gave up on roll {roll} after {attempts} attempts. Last error: {last}")]
    RetryExhausted {
        roll: String,
        attempts: u32,
        last: String,
    },

    /// The document is neither a PASSED nor a FAILED page.
    #[error("Extraction Error for roll {roll}: {reason}")]
    Extraction { roll: String, reason: String },

    #[error("Persistence Error: {0}")]
    Persistence(String),

    #[error("Proxy probe failed: {0}")]
    ProxyProbe(String),

    #[error("Cancelled before the task could finish.")]
    Cancelled,

    #[error("The selector you are trying to scrape for is missing. Selector: {0}")]
    ParseMissingSelector(String),

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),
    #[error("Couldn't send a record through a channel.")]
    RuntimeSendError,

    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl Error {
    /// Only transient failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}

impl From<mpsc::error::SendError<ResultRecord>> for Error {
    fn from(_value: mpsc::error::SendError<ResultRecord>) -> Self {
        Error::RuntimeSendError
    }
}

use thiserror::Error;

/// Announce failures. All are transient: the announcer retries with
/// backoff.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid tracker url: {0}")]
    InvalidUrl(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("request timed out")]
    Timeout,
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    /// The remote could not be reached or refused the credentials.
    #[error("repository inaccessible: {url}: {message}")]
    Inaccessible { url: String, message: String },

    #[error("fetch of '{revision}' from {url} failed: {message}")]
    FetchFailed {
        url: String,
        revision: String,
        message: String,
    },

    #[error("fetch of {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    #[error("internal repository error: {0}")]
    Internal(String),
}

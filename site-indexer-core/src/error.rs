use thiserror::Error;

/// Errors raised by calls against the remote repository, either directly or through the local proxy.
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote returned status {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote write failed during {stage}: {source}")]
    RemoteWrite {
        stage: &'static str,
        #[source]
        source: RepoError,
    },

    #[error("Publish job {job_id} failed: {message}")]
    PublishFailed { job_id: String, message: String },

    #[error("Publish job {job_id} requires approval before the channel items can be published: {message}")]
    ApprovalRequired { job_id: String, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Indexing cancelled")]
    Cancelled,

    #[error("Repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl IndexError {
    pub fn write(stage: &'static str, source: RepoError) -> Self {
        IndexError::RemoteWrite { stage, source }
    }
}

use reqwest::{StatusCode, Url};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("an I/O error occurred: {0}")]
    GenericIo(#[from] std::io::Error),

    #[error("http client error: {0}")]
    HttpClientError(#[from] reqwest::Error),

    #[error("request to {url} failed with status {status}")]
    HttpStatus { url: Url, status: StatusCode },

    #[error("deserialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("xml error: {0}")]
    XmlError(#[from] quick_xml::Error),

    #[error("archive error: {0}")]
    ArchiveError(#[from] zip::result::ZipError),

    #[error("malformed update metadata: {0}")]
    MalformedMetadata(String),

    #[error("invalid build number: {0:?}")]
    InvalidBuildNumber(String),

    #[error("patch {file} is corrupted: missing entry {entry}")]
    CorruptedPatch { file: String, entry: String },

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("bad base64 data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("plugin {0} has no download url")]
    NoDownloadUrl(String),

    #[error("unknown download session {0}")]
    UnknownSession(String),

    #[error("background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("plugin auto-update was disabled")]
    AutoUpdateDisabled,
}

impl UpdaterError {
    /// Network failures that are expected to go away by themselves
    /// (timeouts, unresolvable hosts, missing resources).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpClientError(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status() == Some(StatusCode::NOT_FOUND)
            }
            Self::HttpStatus { status, .. } => *status == StatusCode::NOT_FOUND,
            _ => false,
        }
    }

    /// Whether this error only signals that the work was stopped on purpose.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::AutoUpdateDisabled)
    }
}

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy for the ingestion and rename pipelines.
///
/// Every variant maps to exactly one [`FailurePolicy`] through [`ErrorKind::policy`],
/// so call sites decide between aborting the run and skipping a record by kind
/// rather than by catching everything.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch {
        url: String,
        status: Option<u16>,
        reason: String,
        retryable: bool,
    },

    #[error("catalog extraction failed: {0}")]
    Extraction(String),

    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),

    #[error("image encode failed: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to prepare directory {}: {reason}", path.display())]
    Layout { path: PathBuf, reason: String },

    #[error("failed to write {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid record: {0}")]
    Record(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Extraction,
    Decode,
    Layout,
    Persist,
    Record,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    AbortRun,
    SkipRecord,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Extraction => "extraction",
            Self::Decode => "decode",
            Self::Layout => "layout",
            Self::Persist => "persist",
            Self::Record => "record",
            Self::Config => "config",
        }
    }

    /// Policy applied when this kind surfaces inside the per-record loop.
    /// Page fetch failures happen before the loop and are always fatal there.
    pub fn policy(self) -> FailurePolicy {
        match self {
            Self::Extraction | Self::Config => FailurePolicy::AbortRun,
            Self::Fetch | Self::Decode | Self::Layout | Self::Persist | Self::Record => {
                FailurePolicy::SkipRecord
            }
        }
    }
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Extraction(_) => ErrorKind::Extraction,
            Self::Decode(_) | Self::Encode(_) => ErrorKind::Decode,
            Self::Layout { .. } => ErrorKind::Layout,
            Self::Persist { .. } => ErrorKind::Persist,
            Self::Record(_) => ErrorKind::Record,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { retryable: true, .. })
    }

    pub(crate) fn persist(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Persist {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn layout(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Layout {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, FailurePolicy, IngestError};

    #[test]
    fn extraction_and_config_abort_the_run() {
        assert_eq!(ErrorKind::Extraction.policy(), FailurePolicy::AbortRun);
        assert_eq!(ErrorKind::Config.policy(), FailurePolicy::AbortRun);
    }

    #[test]
    fn per_record_kinds_are_skipped() {
        for kind in [
            ErrorKind::Fetch,
            ErrorKind::Decode,
            ErrorKind::Layout,
            ErrorKind::Persist,
            ErrorKind::Record,
        ] {
            assert_eq!(kind.policy(), FailurePolicy::SkipRecord, "{}", kind.as_str());
        }
    }

    #[test]
    fn only_flagged_fetch_errors_are_retryable() {
        let transient = IngestError::Fetch {
            url: "https://example.test/a".to_string(),
            status: Some(503),
            reason: "HTTP 503".to_string(),
            retryable: true,
        };
        let permanent = IngestError::Fetch {
            url: "https://example.test/a".to_string(),
            status: Some(404),
            reason: "HTTP 404".to_string(),
            retryable: false,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!IngestError::Record("missing img".to_string()).is_retryable());
        assert_eq!(transient.kind(), ErrorKind::Fetch);
    }
}

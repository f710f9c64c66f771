//! Failure taxonomy for receipt ingestion.
//!
//! Every way an upload can be refused or fail is a variant of
//! [`IngestError`]. The HTTP layer maps each variant to exactly one status
//! code and machine-readable code; nothing else in the pipeline decides how a
//! failure is presented.

use axum::http::StatusCode;

/// Errors surfaced by the ingestion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("No receipt image provided")]
    NoFileProvided,

    #[error("Only image files are allowed (got '{0}')")]
    InvalidMediaType(String),

    #[error("File too large. Maximum size is {limit} bytes.")]
    SizeExceeded { limit: usize },

    #[error("Failed to process receipt with OCR service")]
    RecognitionUnavailable(String),

    #[error("OCR processing failed")]
    RecognitionRejected,

    #[error("Duplicate receipt detected. Same merchant and amount processed recently.")]
    DuplicateReceipt,

    #[error("Internal server error")]
    Internal(#[source] anyhow::Error),
}

impl IngestError {
    /// HTTP status returned to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::NoFileProvided
            | IngestError::InvalidMediaType(_)
            | IngestError::SizeExceeded { .. }
            | IngestError::RecognitionRejected => StatusCode::BAD_REQUEST,
            IngestError::DuplicateReceipt => StatusCode::CONFLICT,
            IngestError::RecognitionUnavailable(_) | IngestError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::NoFileProvided => "no_file_provided",
            IngestError::InvalidMediaType(_) => "invalid_media_type",
            IngestError::SizeExceeded { .. } => "size_exceeded",
            IngestError::RecognitionUnavailable(_) => "recognition_unavailable",
            IngestError::RecognitionRejected => "recognition_rejected",
            IngestError::DuplicateReceipt => "duplicate_receipt",
            IngestError::Internal(_) => "internal_error",
        }
    }

    /// Optional detail string for the response body.
    pub fn details(&self) -> Option<String> {
        match self {
            IngestError::RecognitionUnavailable(reason) => Some(reason.clone()),
            IngestError::Internal(err) => Some(format!("{:#}", err)),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Internal(err)
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(IngestError::NoFileProvided.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            IngestError::InvalidMediaType("application/pdf".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            IngestError::SizeExceeded { limit: 10 }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            IngestError::RecognitionRejected.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(IngestError::DuplicateReceipt.status(), StatusCode::CONFLICT);
        assert_eq!(
            IngestError::RecognitionUnavailable("timed out".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            IngestError::Internal(anyhow::anyhow!("disk full")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_details_only_for_server_side_failures() {
        assert!(IngestError::DuplicateReceipt.details().is_none());
        assert_eq!(
            IngestError::RecognitionUnavailable("connection refused".into()).details(),
            Some("connection refused".to_string())
        );
        let internal = IngestError::Internal(anyhow::anyhow!("disk full"));
        assert!(internal.details().unwrap().contains("disk full"));
    }
}

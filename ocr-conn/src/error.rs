use thiserror::Error;

/// Rejections raised while turning uploaded bytes into a [`crate::NormalizedImage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt image: {0}")]
    CorruptImage(String),

    #[error("image too large: {0}")]
    ImageTooLarge(String),
}

impl NormalizeError {
    pub(crate) fn corrupt(detail: impl std::fmt::Display) -> Self {
        Self::CorruptImage(detail.to_string())
    }
}

/// Failures reported by a recognition backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecognitionError {
    #[error("recognition deadline exceeded")]
    Timeout,

    #[error("recognition cancelled")]
    Cancelled,

    #[error("recognition backend failure: {0}")]
    Backend(String),
}

impl RecognitionError {
    pub fn backend(detail: impl std::fmt::Display) -> Self {
        Self::Backend(detail.to_string())
    }
}

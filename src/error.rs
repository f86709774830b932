use std::fmt;

/// Failures that end an invocation. Carried inside `anyhow::Error`; callers
/// can `downcast_ref::<OverlayError>()` to tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayError {
    Inference,
    ImageDecode,
    ImageEncode,
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayError::Inference => write!(f, "bubble detection failed"),
            OverlayError::ImageDecode => write!(f, "input image could not be decoded"),
            OverlayError::ImageEncode => write!(f, "output image could not be encoded"),
        }
    }
}

impl std::error::Error for OverlayError {}

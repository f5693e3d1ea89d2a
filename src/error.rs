//! Error types for amspatch.

use std::path::PathBuf;

use thiserror::Error;

use crate::scanner::Width;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while validating or patching an OS image.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not a TI-68k OS update file: {0}")]
    Format(String),

    #[error("unknown calculator model: 0x{0:02X}")]
    UnknownModel(u8),

    #[error("unsupported OS version code: {0}")]
    UnsupportedVersion(u8),

    #[error("unexpected basecode size 0x{actual:X} for {model} (version code {version_code})")]
    SizeMismatch {
        model: String,
        version_code: u8,
        actual: u32,
    },

    #[error("checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("{width} 0x{value:X} not found within 0x{window:X} bytes of offset 0x{start:X}")]
    PatternNotFound {
        value: u32,
        width: Width,
        start: usize,
        window: usize,
    },

    #[error("reached the end of the image while looking for {width} 0x{value:X}")]
    StreamExhausted { value: u32, width: Width },

    #[error("offset {offset} is outside the image")]
    OutOfRange { offset: i64 },

    #[error("image truncated: {wanted} bytes wanted at offset 0x{offset:X}")]
    TruncatedImage { offset: usize, wanted: usize },

    #[error("attribute 0x{0:X} not present in the system frame")]
    AttributeNotFound(u32),

    #[error("unexpected layout: {0}")]
    UnexpectedLayout(String),

    #[error("output file already exists: {}", .0.display())]
    OutputExists(PathBuf),

    #[error("output file creation failed: {0}")]
    OutputCreationFailed(String),

    #[error("output file write failed: {0}")]
    OutputWriteFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad classes callers act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input is not a supported OS image.
    BadInput,
    /// The image failed its integrity check.
    ChecksumMismatch,
    /// A pattern or structure was not where the OS is known to keep it.
    UnexpectedLayout,
    /// Reading or writing files failed.
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Format(_)
            | Self::UnknownModel(_)
            | Self::UnsupportedVersion(_)
            | Self::SizeMismatch { .. }
            | Self::OutputExists(_) => ErrorKind::BadInput,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::PatternNotFound { .. }
            | Self::StreamExhausted { .. }
            | Self::OutOfRange { .. }
            | Self::TruncatedImage { .. }
            | Self::AttributeNotFound(_)
            | Self::UnexpectedLayout(_) => ErrorKind::UnexpectedLayout,
            Self::OutputCreationFailed(_) | Self::OutputWriteFailed(_) | Self::Io(_) => {
                ErrorKind::Io
            }
        }
    }

    /// Whether a best-effort stage may swallow this error and carry on.
    ///
    /// Only failures to locate something qualify. A bounds violation while
    /// writing means the image is already half-modified and must abort.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PatternNotFound { .. } | Self::StreamExhausted { .. } | Self::UnexpectedLayout(_)
        )
    }

    /// Process exit status reported by the command-line tool.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Format(_) => 3,
            Self::UnknownModel(_) => 4,
            Self::UnsupportedVersion(_) => 5,
            Self::SizeMismatch { .. } => 6,
            Self::OutputExists(_) => 7,
            Self::OutputCreationFailed(_) | Self::OutputWriteFailed(_) | Self::Io(_) => 8,
            Self::ChecksumMismatch { .. } => 9,
            _ => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Format("x".into()).kind(), ErrorKind::BadInput);
        assert_eq!(
            Error::ChecksumMismatch { stored: 1, computed: 2 }.kind(),
            ErrorKind::ChecksumMismatch
        );
        assert_eq!(
            Error::AttributeNotFound(0x300).kind(),
            ErrorKind::UnexpectedLayout
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::UnexpectedLayout("x".into()).is_recoverable());
        assert!(!Error::OutOfRange { offset: -1 }.is_recoverable());
        assert!(!Error::ChecksumMismatch { stored: 0, computed: 1 }.is_recoverable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Format("x".into()).exit_code(), 3);
        assert_eq!(Error::OutputExists(PathBuf::from("out")).exit_code(), 7);
        assert_eq!(Error::ChecksumMismatch { stored: 0, computed: 1 }.exit_code(), 9);
        assert_eq!(
            Error::StreamExhausted { value: 0x4E75, width: Width::Word }.exit_code(),
            10
        );
    }
}

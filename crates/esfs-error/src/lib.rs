#![forbid(unsafe_code)]
//! Error types for EssenceFS.
//!
//! Defines `EsfsError` and a `Result<T>` alias used throughout the
//! workspace, plus the mapping onto the OS status codes the VFS surface
//! reports to callers.

use esfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all EssenceFS operations.
#[derive(Debug, Error)]
pub enum EsfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Parse(#[from] ParseError),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("invalid volume: {0}")]
    Format(String),

    #[error("volume requires driver version {required}, this driver is version {driver}")]
    UnsupportedVersion { required: u16, driver: u16 },

    #[error("volume was not unmounted cleanly")]
    AlreadyMounted,

    #[error("volume is read-only after a consistency failure")]
    ReadOnly,

    #[error("no space left on volume")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("incorrect node type")]
    IncorrectNodeType,

    #[error("incorrect file access")]
    IncorrectFileAccess,

    #[error("invalid handle")]
    InvalidHandle,

    #[error("name too long")]
    NameTooLong,
}

/// Status codes reported across the VFS surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OsStatus {
    Success = 0,
    IncorrectNodeType = -1,
    IncorrectFileAccess = -2,
    InvalidHandle = -3,
    IoFailure = -4,
}

impl EsfsError {
    /// Collapse this error onto the status code callers observe.
    #[must_use]
    pub fn to_status(&self) -> OsStatus {
        match self {
            Self::IncorrectNodeType => OsStatus::IncorrectNodeType,
            Self::IncorrectFileAccess | Self::NameTooLong | Self::NoSpace => {
                OsStatus::IncorrectFileAccess
            }
            Self::InvalidHandle | Self::NotFound(_) => OsStatus::InvalidHandle,
            Self::Io(_)
            | Self::Parse(_)
            | Self::Corruption { .. }
            | Self::Format(_)
            | Self::UnsupportedVersion { .. }
            | Self::AlreadyMounted
            | Self::ReadOnly => OsStatus::IoFailure,
        }
    }
}

/// Result alias using `EsfsError`.
pub type Result<T> = std::result::Result<T, EsfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            EsfsError::IncorrectNodeType.to_status(),
            OsStatus::IncorrectNodeType
        );
        assert_eq!(
            EsfsError::NameTooLong.to_status(),
            OsStatus::IncorrectFileAccess
        );
        assert_eq!(
            EsfsError::NotFound("x".into()).to_status(),
            OsStatus::InvalidHandle
        );
        assert_eq!(
            EsfsError::Corruption {
                block: 1,
                detail: "bad".into()
            }
            .to_status(),
            OsStatus::IoFailure
        );
        assert_eq!(OsStatus::Success as i32, 0);
    }
}

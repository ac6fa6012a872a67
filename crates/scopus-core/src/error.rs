//! Common error type for walking input containers

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::retry::Retryable;

/// Error from opening or iterating an input path (directory, tar or zip).
///
/// Wraps either a local I/O error on a concrete path, or a structural
/// problem with an archive that re-reading will not fix.
#[derive(Debug)]
pub enum IngestError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Archive {
        path: PathBuf,
        message: String,
    },
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "IO on {}: {source}", path.display()),
            Self::Archive { path, message } => {
                write!(f, "archive {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Archive { .. } => None,
        }
    }
}

impl IngestError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn from_zip(path: &Path, e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(source) => Self::io(path, source),
            other => Self::Archive {
                path: path.to_path_buf(),
                message: other.to_string(),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.is_retryable(),
            Self::Archive { .. } => false,
        }
    }
}

impl Retryable for IngestError {
    fn is_retryable(&self) -> bool {
        IngestError::is_retryable(self)
    }
}

/// I/O kinds that will not change on a second attempt.
pub(crate) fn is_permanent_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::StorageFull
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_not_retryable() {
        let err = IngestError::io(Path::new("/x"), std::io::Error::new(ErrorKind::NotFound, "gone"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn io_interrupted_retryable() {
        let err = IngestError::io(
            Path::new("/x"),
            std::io::Error::new(ErrorKind::Interrupted, "signal"),
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn archive_not_retryable() {
        let err = IngestError::Archive {
            path: PathBuf::from("a.zip"),
            message: "bad header".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("a.zip"));
    }

    #[test]
    fn zip_io_maps_to_io() {
        let err = IngestError::from_zip(
            Path::new("a.zip"),
            zip::result::ZipError::Io(std::io::Error::other("flaky share")),
        );
        assert!(matches!(err, IngestError::Io { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn display_io_has_prefix() {
        let err = IngestError::io(Path::new("/data/x.xml"), std::io::Error::other("boom"));
        let msg = format!("{err}");
        assert!(msg.starts_with("IO on /data/x.xml"));
    }
}

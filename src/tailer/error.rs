// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::Path;
use thiserror::Error;

/// Classification of a tailing error. Startup treats `DirectoryNotFound` as
/// fatal; everything else is recoverable and flows through the errors channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FileNotFound,
    DirectoryNotFound,
    Unspecified,
}

/// Error emitted by tailers and readers.
///
/// Carries a human message, an optional underlying I/O cause, and an optional
/// list of structured key/value fields for logging.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TailError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<io::Error>,
    fields: Vec<(String, String)>,
}

impl TailError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            fields: Vec::new(),
        }
    }

    pub fn unspecified(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unspecified, message)
    }

    pub fn file_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileNotFound, message)
    }

    pub fn directory_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DirectoryNotFound, message)
    }

    /// Classify an open() failure: a missing file is `FileNotFound` only when
    /// the configuration demands strict existence.
    pub fn from_open(path: &Path, err: io::Error, fail_on_missing: bool) -> Self {
        let kind = if fail_on_missing && err.kind() == io::ErrorKind::NotFound {
            ErrorKind::FileNotFound
        } else {
            ErrorKind::Unspecified
        };
        Self::new(kind, format!("open file {} failed", path.display())).with_cause(err)
    }

    pub fn with_cause(mut self, cause: io::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&io::Error> {
        self.cause.as_ref()
    }

    /// Structured fields for the logger; empty for unstructured errors.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

pub type Result<T> = std::result::Result<T, TailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_kind_message_and_fields() {
        let err = TailError::unspecified("read dir /var/log failed")
            .with_cause(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            .with_field("component", "watcher")
            .with_field("path", "/var/log");

        assert_eq!(err.kind(), ErrorKind::Unspecified);
        assert_eq!(err.to_string(), "read dir /var/log failed");
        assert!(err.cause().is_some());
        assert_eq!(err.fields().len(), 2);
    }

    #[test]
    fn open_error_is_file_not_found_only_when_strict() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let err = TailError::from_open(Path::new("/tmp/x.log"), missing, true);
        assert_eq!(err.kind(), ErrorKind::FileNotFound);

        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let err = TailError::from_open(Path::new("/tmp/x.log"), missing, false);
        assert_eq!(err.kind(), ErrorKind::Unspecified);
    }

    #[test]
    fn source_chains_to_cause() {
        use std::error::Error as _;
        let err = TailError::file_not_found("file gone")
            .with_cause(io::Error::new(io::ErrorKind::NotFound, "enoent"));
        assert!(err.source().is_some());
    }
}

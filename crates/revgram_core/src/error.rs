//! Fault taxonomy shared by the reverser crates.
//!
//! Each crate reports its own error enum; the reversal loop folds them into
//! a [`Fault`] to decide whether the fault ends one trace, one iteration,
//! or the whole session.

use std::path::PathBuf;

/// Result type used at crate boundaries
pub type FaultResult<T> = Result<T, Fault>;

/// Cross-crate fault classification
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// Malformed trace log, fatal to that one trace
    #[error("malformed trace log: {reason}")]
    Decode {
        /// Decoder message
        reason: String,
    },

    /// Matcher and catalogue disagree about a type
    #[error("matcher/catalogue desync: {reason}")]
    MatchInternal {
        /// Description of the inconsistency
        reason: String,
    },

    /// Document rejected by the grammar compiler
    #[error("grammar rejected: {}", .messages.join("; "))]
    Compile {
        /// Compiler messages in report order
        messages: Vec<String>,
    },

    /// Trace or compiler process unreachable, or a protocol violation
    #[error("external collaborator failed: {reason}")]
    Collaborator {
        /// What went wrong
        reason: String,
    },

    /// Document bookkeeping violated (duplicate or missing node)
    #[error("inconsistent document: {reason}")]
    Consistency {
        /// What went wrong
        reason: String,
    },

    /// Artifact I/O failed
    #[error("i/o failure at {}: {source}", .path.display())]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl Fault {
    /// Create an I/O fault for a path
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the fault aborts only the current iteration
    ///
    /// Decode, compile and collaborator faults are confined to the
    /// iteration that raised them; the session restores its last persisted
    /// document and keeps going.
    #[must_use]
    pub fn is_iteration_local(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::Compile { .. } | Self::Collaborator { .. }
        )
    }

    /// Short machine-readable label for logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::MatchInternal { .. } => "match_internal",
            Self::Compile { .. } => "compile",
            Self::Collaborator { .. } => "collaborator",
            Self::Consistency { .. } => "consistency",
            Self::Io { .. } => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = Fault::Compile {
            messages: vec!["unused struct a".to_string(), "unused union b".to_string()],
        };
        assert_eq!(
            fault.to_string(),
            "grammar rejected: unused struct a; unused union b"
        );
    }

    #[test]
    fn test_iteration_local() {
        let decode = Fault::Decode {
            reason: "short read".to_string(),
        };
        assert!(decode.is_iteration_local());

        let internal = Fault::MatchInternal {
            reason: "dangling type".to_string(),
        };
        assert!(!internal.is_iteration_local());
        assert_eq!(internal.label(), "match_internal");
    }

    #[test]
    fn test_io_fault_keeps_path() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let fault = Fault::io("/tmp/blob.bin", err);
        let s = fault.to_string();
        assert!(s.contains("/tmp/blob.bin"));
        assert!(s.contains("gone"));
    }
}

//! Last-resort output when a session cannot finish.
//!
//! Downstream tooling expects a grammar file for every harness, so any
//! fault or panic escaping the reversal loop is turned into a minimal
//! document that feeds the whole input as one opaque blob.

use crate::harness::fallback_document;
use crate::persist::write_text;
use revgram_core::Fault;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Process exit status after writing the fallback document
pub const FALLBACK_EXIT_CODE: i32 = 7;

/// What ended the session
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    /// A fault propagated out of the loop
    #[error("{0}")]
    Fault(#[from] Fault),
    /// The loop panicked
    #[error("panic: {0}")]
    Panic(String),
}

/// The session failed and the fallback document was written (or not)
#[derive(Debug, thiserror::Error)]
#[error("reversal of {id} failed: {failure}")]
pub struct FallbackError {
    /// Harness id
    pub id: String,
    /// Cause
    pub failure: Failure,
    /// Where the fallback document went, `None` if it could not be written
    pub written: Option<PathBuf>,
}

impl FallbackError {
    /// Exit status the process should end with
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        FALLBACK_EXIT_CODE
    }
}

/// Run `body`, writing the fallback document to `output` if it fails
///
/// # Errors
///
/// Returns [`FallbackError`] when `body` returns a fault or panics
pub fn run_or_fallback<T, F>(id: &str, output: &Path, body: F) -> Result<T, FallbackError>
where
    F: FnOnce() -> Result<T, Fault>,
{
    let failure = match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(fault)) => Failure::Fault(fault),
        Err(payload) => Failure::Panic(panic_message(payload)),
    };
    error!(id, error = %failure, "reversal failed, writing fallback");
    let written = match write_fallback(id, output) {
        Ok(()) => {
            info!(path = %output.display(), "fallback written");
            Some(output.to_path_buf())
        }
        Err(fault) => {
            error!(path = %output.display(), error = %fault, "cannot write fallback");
            None
        }
    };
    Err(FallbackError {
        id: id.to_string(),
        failure,
        written,
    })
}

fn write_fallback(id: &str, output: &Path) -> Result<(), Fault> {
    let doc = fallback_document(id)?;
    write_text(output, &doc.to_string())?;
    Ok(())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revgram_grammar::parse_document;

    #[test]
    fn test_success_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("h.txt");
        assert_eq!(run_or_fallback("h", &out, || Ok(3)).unwrap(), 3);
        assert!(!out.exists());
    }

    #[test]
    fn test_fault_writes_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("h.txt");
        let err = run_or_fallback::<(), _>("h", &out, || {
            Err(Fault::Consistency {
                reason: "broken".to_string(),
            })
        })
        .unwrap_err();
        assert_eq!(err.exit_code(), 7);
        assert_eq!(err.written.as_deref(), Some(out.as_path()));
        let text = std::fs::read_to_string(&out).unwrap();
        let doc = parse_document(&text, "h").unwrap();
        assert!(doc.calls().any(|c| c.name == "syz_harness_type1$h_fallback"));
        assert!(doc.record("h_fallback").unwrap().packed);
    }

    #[test]
    fn test_panic_writes_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("h.txt");
        let err = run_or_fallback::<(), _>("h", &out, || panic!("tracer vanished")).unwrap_err();
        assert!(matches!(err.failure, Failure::Panic(ref m) if m == "tracer vanished"));
        assert!(out.exists());
    }
}

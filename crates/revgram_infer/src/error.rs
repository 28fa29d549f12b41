//! Inference errors.

use revgram_core::Fault;
use revgram_grammar::{DocumentError, TypeRef};
use revgram_match::MatchError;

/// Inference errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferError {
    /// The catalogue has no descriptor for a reference
    #[error("dangling type {0}")]
    DanglingType(TypeRef),

    /// Matching failed
    #[error(transparent)]
    Match(#[from] MatchError),

    /// Document bookkeeping failed while inserting a type
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl From<InferError> for Fault {
    fn from(err: InferError) -> Self {
        match err {
            InferError::DanglingType(ty) => Fault::MatchInternal {
                reason: format!("dangling type {ty}"),
            },
            InferError::Match(e) => e.into(),
            InferError::Document(e) => e.into(),
        }
    }
}

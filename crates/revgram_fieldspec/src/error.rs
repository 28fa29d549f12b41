//! Field specification errors.

use revgram_core::Fault;
use revgram_grammar::DocumentError;

/// Field specification parse or lowering failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldSpecError {
    /// Malformed line
    #[error("line {line}: {message}")]
    Syntax {
        /// 1-based line number
        line: usize,
        /// What was wrong
        message: String,
    },
    /// Type other than `string`
    #[error("field {field}: unsupported type {ty}")]
    UnsupportedType {
        /// Field name
        field: String,
        /// Declared type
        ty: String,
    },
    /// Fixed value without an integer width
    #[error("field {field}: value needs a size of 1, 2, 4 or 8")]
    ValueSize {
        /// Field name
        field: String,
    },
    /// Count or size names a field that does not exist or has no width
    #[error("length dependency {target}[{size}] is not resolved")]
    UnresolvedLength {
        /// Field whose length is given
        target: String,
        /// Field meant to hold it
        size: String,
    },
    /// Two fields take their length from the same field
    #[error("field {size} gives the length of more than one field")]
    SharedLength {
        /// Size field
        size: String,
    },
    /// Reference to a record that is not declared
    #[error("undefined record {name}")]
    UndefinedRecord {
        /// Record name
        name: String,
    },
    /// Document bookkeeping
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl From<FieldSpecError> for Fault {
    fn from(err: FieldSpecError) -> Self {
        Fault::Compile {
            messages: vec![err.to_string()],
        }
    }
}

//! REVGRAM Field Specifications
//!
//! Parser and printer for the simplified field description of a harness
//! input, and its lowering into the first grammar document.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod lower;
pub mod model;
pub mod parse;

pub use error::FieldSpecError;
pub use lower::{COMMAND_COUNT_NAME, COMMAND_NAME, INPUT_NAME, lower, scoped_name};
pub use model::{FieldSpec, NormalField, SpecField, SpecRecord, SpecSize};
pub use parse::{parse, parse_file};

//! REVGRAM Constraint Matching
//!
//! Matches captured trace events against the signature catalogue.
//! Resource handles are tracked in trace order and the bytes seen at
//! loosely matched positions are kept as provenance for inference.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bindings;
pub mod config;
pub mod glob;
pub mod matcher;
pub mod provenance;

pub use bindings::ResourceBindings;
pub use config::{Duplicator, HandleSource, MatchConfig, ResourceSeed};
pub use glob::glob_matches;
pub use matcher::{ArgStrictness, MatchEngine, MatchError, MatchOutcome, is_same_val};
pub use provenance::{Provenance, ProvenanceKey};

//! REVGRAM Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! It is shared by every stage of the grammar reverser: the fault taxonomy
//! surfaced at the reversal loop boundary, content fingerprints, the
//! structural path hash used to align fields across traces, and session ids.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;

// Re-exports
pub use error::{Fault, FaultResult};
pub use hash::{Fingerprint, FingerprintError, PathHash, StructHasher};
pub use id::SessionId;

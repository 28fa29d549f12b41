//! REVGRAM Trace Differencing & Field Inference
//!
//! Samples harness inputs from the current grammar, traces each sample
//! next to its complement, and turns blob bytes that reappear in loosely
//! matched arguments into candidate field types.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decode;
pub mod error;
pub mod infer;
pub mod lcs;
pub mod sample;

pub use decode::{BlobDecoder, Decoded, Step};
pub use error::InferError;
pub use infer::{InferenceReport, Run, infer_fields};
pub use lcs::{CommonSubstr, Span, longest_common_substrings, trim_common};
pub use sample::{
    FieldOwner, Leaf, MAX_SAMPLE_ATTEMPTS, Sample, Sampler, Value, serialize_with_layout,
};

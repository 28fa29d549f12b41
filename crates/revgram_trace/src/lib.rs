//! REVGRAM Trace Log
//!
//! Record types for one captured harness run and the decoder for the
//! tracer's binary log format. Opcode arities come from an explicit
//! [`ArityTable`] so several architectures can be decoded side by side.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arity;
pub mod encoding;
pub mod event;

pub use arity::{ArityTable, DEFAULT_ARITY};
pub use encoding::{DecodeError, TraceDecoder, TraceEncoder, encode_trace};
pub use event::{MemSide, MemSnapshot, Trace, TraceEvent};

//! REVGRAM Engine
//!
//! The reversal loop and everything around it: configuration, the client
//! for the trace-generation process, compile repair, persistence of the
//! grammar document, and the fallback written when a session fails.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod fallback;
pub mod harness;
pub mod persist;
pub mod repair;
pub mod reverser;
pub mod tracer;

pub use config::{ConfigError, ProtocolLines, ReverserConfig, TracerConfig};
pub use fallback::{FALLBACK_EXIT_CODE, FallbackError, Failure, run_or_fallback};
pub use harness::{HARNESS_CALL, HarnessNames, HarnessShape};
pub use persist::PersistError;
pub use repair::{DEFAULT_REPAIR_ROUNDS, repair};
pub use reverser::{IterationOutcome, Reverser, Session, SessionOutcome, load_base, reverse};
pub use tracer::{LineClient, TraceSource, TracerError, TracerProcess};

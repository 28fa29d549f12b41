//! Binary trace log encoding.
//!
//! The log is a stream of records, each starting with a one-byte tag. All
//! integers are little-endian.
//!
//! | tag | record    | body |
//! |-----|-----------|------|
//! | 0   | op-start  | opcode (8B), then `arity(opcode)` argument words (8B each) |
//! | 1   | in-mem    | address (8B), length (4B), payload |
//! | 2   | out-mem   | address (8B), length (4B), payload |
//! | 3   | op-end    | return value (8B), coverage count (8B), coverage addresses (8B each) |
//!
//! An op-end closes the open event and appends it to the trace.

use crate::arity::ArityTable;
use crate::event::{MemSide, MemSnapshot, Trace, TraceEvent};
use bytes::{Buf, BufMut};
use revgram_core::Fault;
use std::io::{self, Read, Write};
use std::path::Path;

/// Tag of an op-start record
pub const TAG_OP_START: u8 = 0;
/// Tag of an input memory snapshot
pub const TAG_IN_MEM: u8 = 1;
/// Tag of an output memory snapshot
pub const TAG_OUT_MEM: u8 = 2;
/// Tag of an op-end record
pub const TAG_OP_END: u8 = 3;

/// Decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Input ended inside a record
    #[error("truncated {record} record at offset {offset}")]
    Truncated {
        /// Offset of the record's tag byte
        offset: usize,
        /// Record name
        record: &'static str,
    },

    /// Tag byte is not a known record
    #[error("unknown record tag {tag} at offset {offset}")]
    UnknownTag {
        /// Offset of the tag byte
        offset: usize,
        /// The tag
        tag: u8,
    },

    /// Memory or end record with no open event
    #[error("record tag {tag} at offset {offset} has no open event")]
    Orphan {
        /// Offset of the tag byte
        offset: usize,
        /// The tag
        tag: u8,
    },

    /// Log could not be read
    #[error("cannot read trace log {path}: {reason}")]
    Io {
        /// Path of the log
        path: String,
        /// I/O error message
        reason: String,
    },
}

impl From<DecodeError> for Fault {
    fn from(err: DecodeError) -> Self {
        Fault::Decode {
            reason: err.to_string(),
        }
    }
}

/// Decoder from the binary log into a [`Trace`]
#[derive(Debug, Clone, Default)]
pub struct TraceDecoder {
    arity: ArityTable,
}

impl TraceDecoder {
    /// Create a new decoder using `arity` to size op-start records
    #[must_use]
    pub fn new(arity: ArityTable) -> Self {
        Self { arity }
    }

    /// The arity table in use
    #[must_use]
    pub fn arity(&self) -> &ArityTable {
        &self.arity
    }

    /// Decode a complete log
    ///
    /// A clean end of input between records ends the trace; an event still
    /// open at that point never returned and is not appended. A new
    /// op-start while an event is open discards the open one for the same
    /// reason.
    ///
    /// # Errors
    ///
    /// Returns error on a short read, an unknown tag, or a memory/end record
    /// outside an event. No partial event is ever appended.
    pub fn decode(&self, data: &[u8]) -> Result<Trace, DecodeError> {
        let mut buf = data;
        let mut events = Vec::new();
        let mut open: Option<TraceEvent> = None;

        while buf.has_remaining() {
            let offset = data.len() - buf.remaining();
            let tag = buf.get_u8();
            match tag {
                TAG_OP_START => {
                    let record = "op-start";
                    need(buf, 8, offset, record)?;
                    let opcode = buf.get_u64_le();
                    let argc = self.arity.arity(opcode);
                    need(buf, argc.saturating_mul(8), offset, record)?;
                    let args = (0..argc).map(|_| buf.get_u64_le()).collect();
                    if let Some(dropped) = open.replace(TraceEvent::new(opcode, args)) {
                        tracing::debug!(
                            opcode = dropped.opcode,
                            offset,
                            "discarding event that never returned"
                        );
                    }
                }
                TAG_IN_MEM | TAG_OUT_MEM => {
                    let record = if tag == TAG_IN_MEM { "in-mem" } else { "out-mem" };
                    need(buf, 12, offset, record)?;
                    let addr = buf.get_u64_le();
                    let len = usize::try_from(buf.get_u32_le()).unwrap_or(usize::MAX);
                    need(buf, len, offset, record)?;
                    let payload = buf[..len].to_vec();
                    buf.advance(len);
                    let side = if tag == TAG_IN_MEM {
                        MemSide::Input
                    } else {
                        MemSide::Output
                    };
                    open.as_mut()
                        .ok_or(DecodeError::Orphan { offset, tag })?
                        .push_mem(side, MemSnapshot::new(addr, payload));
                }
                TAG_OP_END => {
                    let record = "op-end";
                    need(buf, 16, offset, record)?;
                    let retval = buf.get_u64_le();
                    let count = usize::try_from(buf.get_u64_le()).unwrap_or(usize::MAX);
                    need(buf, count.saturating_mul(8), offset, record)?;
                    let coverage = (0..count).map(|_| buf.get_u64_le()).collect();
                    let event = open.take().ok_or(DecodeError::Orphan { offset, tag })?;
                    events.push(event.with_retval(retval).with_coverage(coverage));
                }
                other => return Err(DecodeError::UnknownTag { offset, tag: other }),
            }
        }

        if let Some(dropped) = open {
            tracing::debug!(opcode = dropped.opcode, "log ended inside an event");
        }
        Ok(Trace::new(events))
    }

    /// Decode a log from a reader
    ///
    /// # Errors
    ///
    /// Returns error if reading fails or the log is malformed
    pub fn decode_reader<R: Read>(&self, mut reader: R) -> Result<Trace, DecodeError> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| DecodeError::Io {
                path: "<reader>".to_string(),
                reason: e.to_string(),
            })?;
        self.decode(&data)
    }

    /// Decode a log file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is malformed
    pub fn decode_file(&self, path: &Path) -> Result<Trace, DecodeError> {
        let data = std::fs::read(path).map_err(|e| DecodeError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let trace = self.decode(&data)?;
        tracing::debug!(path = %path.display(), events = trace.len(), "decoded trace log");
        Ok(trace)
    }
}

fn need(buf: &[u8], n: usize, offset: usize, record: &'static str) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::Truncated { offset, record });
    }
    Ok(())
}

/// Encoder from events into the binary log
pub struct TraceEncoder<W> {
    writer: W,
}

impl<W: Write> TraceEncoder<W> {
    /// Create a new encoder
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode one event as op-start, snapshots, op-end
    ///
    /// The event's argument count must agree with the arity table the log
    /// will be decoded with.
    ///
    /// # Errors
    ///
    /// Returns error if writing fails
    pub fn encode_event(&mut self, event: &TraceEvent) -> io::Result<()> {
        let mut out = Vec::with_capacity(32 + event.args.len() * 8);
        out.put_u8(TAG_OP_START);
        out.put_u64_le(event.opcode);
        for &arg in &event.args {
            out.put_u64_le(arg);
        }
        for (side, mems) in [
            (MemSide::Input, &event.in_mems),
            (MemSide::Output, &event.out_mems),
        ] {
            for mem in mems {
                let len = u32::try_from(mem.data.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "snapshot exceeds 4 GiB")
                })?;
                out.put_u8(side.tag());
                out.put_u64_le(mem.addr);
                out.put_u32_le(len);
                out.put_slice(&mem.data);
            }
        }
        out.put_u8(TAG_OP_END);
        out.put_u64_le(event.retval);
        out.put_u64_le(event.coverage.len() as u64);
        for &addr in &event.coverage {
            out.put_u64_le(addr);
        }
        self.writer.write_all(&out)
    }

    /// Encode every event of a trace
    ///
    /// # Errors
    ///
    /// Returns error if writing fails
    pub fn encode_trace(&mut self, trace: &Trace) -> io::Result<()> {
        for event in trace.events() {
            self.encode_event(event)?;
        }
        Ok(())
    }

    /// Flush the writer
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Consume and return the inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Encode a trace into a fresh buffer
///
/// # Errors
///
/// Returns error if a snapshot is too large for the format
pub fn encode_trace(trace: &Trace) -> io::Result<Vec<u8>> {
    let mut encoder = TraceEncoder::new(Vec::new());
    encoder.encode_trace(trace)?;
    Ok(encoder.into_inner())
}

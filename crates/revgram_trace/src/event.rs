//! Trace event types.
//!
//! A [`Trace`] is the ordered list of operations one harness run issued,
//! each with the argument words, the memory the tracer captured around it,
//! the return value, and the coverage it produced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which side of the operation a memory snapshot was taken on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemSide {
    /// Memory read by the operation (captured before it ran)
    Input,
    /// Memory written by the operation (captured after it returned)
    Output,
}

impl MemSide {
    /// Record tag in the binary log
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Input => crate::encoding::TAG_IN_MEM,
            Self::Output => crate::encoding::TAG_OUT_MEM,
        }
    }
}

/// Captured bytes at an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemSnapshot {
    /// Start address
    pub addr: u64,
    /// Captured bytes
    pub data: Vec<u8>,
}

impl MemSnapshot {
    /// Create a new snapshot
    #[must_use]
    pub fn new(addr: u64, data: Vec<u8>) -> Self {
        Self { addr, data }
    }
}

/// One captured operation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Operation number
    pub opcode: u64,
    /// Raw argument words
    pub args: Vec<u64>,
    /// Snapshots of memory read by the operation
    pub in_mems: Vec<MemSnapshot>,
    /// Snapshots of memory written by the operation
    pub out_mems: Vec<MemSnapshot>,
    /// Return value
    pub retval: u64,
    /// Coverage addresses
    pub coverage: Vec<u64>,
}

impl TraceEvent {
    /// Create an event with no memory or coverage
    #[must_use]
    pub fn new(opcode: u64, args: Vec<u64>) -> Self {
        Self {
            opcode,
            args,
            ..Self::default()
        }
    }

    /// Attach a snapshot
    #[must_use]
    pub fn with_mem(mut self, side: MemSide, addr: u64, data: Vec<u8>) -> Self {
        self.push_mem(side, MemSnapshot::new(addr, data));
        self
    }

    /// Set the return value
    #[must_use]
    pub fn with_retval(mut self, retval: u64) -> Self {
        self.retval = retval;
        self
    }

    /// Set the coverage addresses
    #[must_use]
    pub fn with_coverage(mut self, coverage: Vec<u64>) -> Self {
        self.coverage = coverage;
        self
    }

    /// Append a snapshot to the given side
    pub fn push_mem(&mut self, side: MemSide, snapshot: MemSnapshot) {
        match side {
            MemSide::Input => self.in_mems.push(snapshot),
            MemSide::Output => self.out_mems.push(snapshot),
        }
    }

    /// Argument word at `idx`, zero when the event recorded fewer words
    #[must_use]
    pub fn arg(&self, idx: usize) -> u64 {
        self.args.get(idx).copied().unwrap_or(0)
    }

    /// Read the contiguous bytes starting at `addr`
    ///
    /// Snapshots of the requested sides are overlaid into one sparse
    /// address map (output snapshots win over input ones). Bytes are then
    /// read from `addr` until the first gap. An empty result means nothing
    /// was captured at `addr`.
    #[must_use]
    pub fn read_memory(&self, addr: u64, input: bool, output: bool) -> Vec<u8> {
        let mut map: BTreeMap<u64, u8> = BTreeMap::new();
        let mut overlay = |mems: &[MemSnapshot]| {
            for mem in mems {
                for (i, &b) in mem.data.iter().enumerate() {
                    map.insert(mem.addr.wrapping_add(i as u64), b);
                }
            }
        };
        if input {
            overlay(&self.in_mems);
        }
        if output {
            overlay(&self.out_mems);
        }

        let mut out = Vec::new();
        let mut cursor = addr;
        while let Some(&b) = map.get(&cursor) {
            out.push(b);
            cursor = match cursor.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }
        out
    }
}

/// Ordered events captured from one run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    /// Create a trace from events
    #[must_use]
    pub fn new(events: Vec<TraceEvent>) -> Self {
        Self { events }
    }

    /// Events in capture order
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the trace is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Consume and return the events
    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}

const BAR: &str = "==============================";

impl fmt::Display for MemSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Addr: 0x{:x}, size: 0x{:x}", self.addr, self.data.len())?;
        for (row, chunk) in self.data.chunks(16).enumerate() {
            write!(f, "{:04x}:", row * 16)?;
            for b in chunk {
                write!(f, " {b:02x}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{BAR}")?;
        let args: Vec<String> = self.args.iter().map(|a| format!("0x{a:x}")).collect();
        writeln!(
            f,
            "op_0x{:x}({}) = 0x{:x}",
            self.opcode,
            args.join(", "),
            self.retval
        )?;
        writeln!(f, "InMems:")?;
        for mem in &self.in_mems {
            write!(f, "{mem}")?;
        }
        writeln!(f, "OutMems:")?;
        for mem in &self.out_mems {
            write!(f, "{mem}")?;
        }
        writeln!(f, "Cov:")?;
        for row in self.coverage.chunks(8) {
            let addrs: Vec<String> = row.iter().map(|a| format!("{a:x}")).collect();
            writeln!(f, "{}", addrs.join(" "))?;
        }
        Ok(())
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for event in &self.events {
            write!(f, "{event}")?;
        }
        Ok(())
    }
}

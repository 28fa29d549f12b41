//! Trace matching against signature candidates.
//!
//! Matching runs in two passes. [`MatchEngine::classify_pair`] compares two
//! runs of related blobs and decides, per argument, whether a mismatch
//! disqualifies a candidate (strict) or is only noted (loose).
//! [`MatchEngine::match_trace`] then walks every candidate's argument types
//! against one trace, tracking resource handles and recording the bytes
//! seen at loose positions.

use crate::bindings::ResourceBindings;
use crate::config::{HandleSource, MatchConfig};
use crate::glob::glob_matches;
use crate::provenance::{Provenance, ProvenanceKey};
use revgram_core::{Fault, PathHash};
use revgram_grammar::{
    ArrayLen, BufferKind, Catalogue, Dir, Field, IntKind, Signature, SignatureId, TypeDescriptor,
    TypeRef,
};
use revgram_trace::{Trace, TraceEvent};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Largest errno an operation reports as a negative return
const MAX_ERRNO: i64 = 4095;

/// Matcher errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    /// Catalogue and matcher disagree about a type
    #[error("matcher/catalogue desync: {reason}")]
    Internal {
        /// What was found where
        reason: String,
    },
}

impl MatchError {
    fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}

impl From<MatchError> for Fault {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::Internal { reason } => Fault::MatchInternal { reason },
        }
    }
}

/// Per-argument strictness for one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgStrictness {
    /// Opcode both runs agreed on
    pub opcode: u64,
    /// Strict flag per argument position
    pub args: Vec<bool>,
}

impl ArgStrictness {
    /// Whether argument `idx` is strict; missing positions are loose
    #[must_use]
    pub fn is_strict(&self, idx: usize) -> bool {
        self.args.get(idx).copied().unwrap_or(false)
    }
}

/// Result of matching one trace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    /// Matching signatures per event, in catalogue order
    pub candidates: Vec<Vec<SignatureId>>,
    /// Bytes captured at loose positions of matching signatures
    pub provenance: Provenance,
}

/// Whether `arg` equals `val`, tolerating 32-bit sign extension
#[must_use]
pub fn is_same_val(arg: u64, val: u64) -> bool {
    arg == val || (arg <= u64::from(u32::MAX) && i64::from(arg as u32 as i32) == val as i64)
}

fn fits_width(value: u64, size: u64) -> bool {
    size >= 8 || value < (1u64 << (size * 8))
}

fn le_bytes(value: u64, size: u64) -> Vec<u8> {
    match size {
        1 | 2 | 4 | 8 => value.to_le_bytes()[..size as usize].to_vec(),
        _ => Vec::new(),
    }
}

fn buffer_matches(kind: &BufferKind, mem: &[u8]) -> bool {
    match kind {
        BufferKind::Random | BufferKind::Text { .. } => true,
        BufferKind::Ranged { min, max } => (*min..=*max).contains(&(mem.len() as u64)),
        BufferKind::String { values, noz } if values.is_empty() => *noz || mem.contains(&0),
        BufferKind::String { values, .. } => values.iter().any(|v| mem.starts_with(v)),
        BufferKind::Filename { noz } => *noz || mem.contains(&0),
        BufferKind::Glob { pattern } => glob_matches(pattern, mem),
    }
}

/// Matches traces against a catalogue
#[derive(Debug, Clone)]
pub struct MatchEngine<'c> {
    catalogue: &'c Catalogue,
    config: MatchConfig,
}

impl<'c> MatchEngine<'c> {
    /// Create an engine over a compiled catalogue
    #[must_use]
    pub fn new(catalogue: &'c Catalogue, config: MatchConfig) -> Self {
        Self { catalogue, config }
    }

    /// Resource configuration in use
    #[must_use]
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Classify argument positions of two runs as strict or loose
    ///
    /// Walks the shared prefix of both traces while opcodes agree and
    /// stops at the first opcode without a plain signature.
    #[must_use]
    pub fn classify_pair(&self, a: &Trace, b: &Trace) -> Vec<ArgStrictness> {
        let mut out = Vec::new();
        for (ea, eb) in a.events().iter().zip(b.events()) {
            if ea.opcode != eb.opcode {
                break;
            }
            let Some((_, sig)) = self.catalogue.plain_signature(ea.opcode) else {
                break;
            };
            let args = (0..ea.args.len())
                .map(|idx| self.arg_is_strict(sig, idx, ea, eb))
                .collect();
            out.push(ArgStrictness {
                opcode: ea.opcode,
                args,
            });
        }
        out
    }

    fn arg_is_strict(&self, sig: &Signature, idx: usize, a: &TraceEvent, b: &TraceEvent) -> bool {
        let Some(field) = sig.args.get(idx) else {
            return false;
        };
        match self.catalogue.get(field.ty) {
            Some(TypeDescriptor::Pointer { dir, .. }) if dir.reads_input() => {
                let read = |e: &TraceEvent| {
                    e.read_memory(e.arg(idx), dir.reads_input(), dir.reads_output())
                };
                let ma = read(a);
                !ma.is_empty() && ma == read(b)
            }
            _ => a.arg(idx) == b.arg(idx),
        }
    }

    /// Match the classified prefix of a trace
    ///
    /// Events past the end of `strictness` are not examined.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::Internal`] when an event's opcode differs from
    /// its classification, or a type reference cannot be resolved or sits
    /// where the catalogue says it cannot.
    pub fn match_trace(
        &self,
        trace: &Trace,
        strictness: &[ArgStrictness],
    ) -> Result<MatchOutcome, MatchError> {
        let mut bindings = ResourceBindings::seeded(&self.config);
        let mut outcome = MatchOutcome::default();

        for (idx, (event, strict)) in trace.events().iter().zip(strictness).enumerate() {
            if event.opcode != strict.opcode {
                return Err(MatchError::internal(format!(
                    "event {idx} has opcode {} but was classified as {}",
                    event.opcode, strict.opcode
                )));
            }
            let mut matched = Vec::new();
            for &id in self.catalogue.candidates(event.opcode) {
                let sig = self.signature(id)?;
                if sig.is_pseudo() {
                    continue;
                }
                let mut walk = Walk {
                    cat: self.catalogue,
                    config: &self.config,
                    event,
                    sig,
                    bindings: &mut bindings,
                    captures: Provenance::new(),
                    event_idx: idx,
                    sig_id: id,
                    arg: 0,
                    path: PathHash::ROOT,
                    dir: Dir::In,
                    strict: false,
                };
                if walk.run(strict)? {
                    let captures = walk.captures;
                    outcome.provenance.extend(captures);
                    matched.push(id);
                }
            }
            for &id in &matched {
                self.match_ret(event, self.signature(id)?, &mut bindings)?;
            }
            debug!(
                event = idx,
                opcode = event.opcode,
                candidates = matched.len(),
                "event matched"
            );
            outcome.candidates.push(matched);
        }
        Ok(outcome)
    }

    fn signature(&self, id: SignatureId) -> Result<&'c Signature, MatchError> {
        let cat: &'c Catalogue = self.catalogue;
        cat.signature(id)
            .ok_or_else(|| MatchError::internal(format!("dangling signature {}", id.0)))
    }

    fn match_ret(
        &self,
        event: &TraceEvent,
        sig: &Signature,
        bindings: &mut ResourceBindings,
    ) -> Result<(), MatchError> {
        if (-MAX_ERRNO..=-1).contains(&(event.retval as i64)) {
            return Ok(());
        }
        if let Some(ty) = sig.ret {
            let desc = self
                .catalogue
                .get(ty)
                .ok_or_else(|| MatchError::internal(format!("dangling return type {ty}")))?;
            match desc {
                TypeDescriptor::Resource { name, kinds, .. } => {
                    bindings.bind(event.retval, name, kinds.iter().map(String::as_str));
                }
                other => {
                    debug!(signature = %sig.name, kind = other.label(), "ignoring non-resource return");
                }
            }
        }
        if let Some(dup) = self.config.duplicator(&sig.call_name) {
            let fetch = |src: HandleSource| match src {
                HandleSource::Arg(i) => event.arg(i),
                HandleSource::Ret => event.retval,
            };
            bindings.duplicate(fetch(dup.old), fetch(dup.new), &self.config.duplicable_kind);
        }
        Ok(())
    }
}

/// State of one candidate walk over one event
struct Walk<'a> {
    cat: &'a Catalogue,
    config: &'a MatchConfig,
    event: &'a TraceEvent,
    sig: &'a Signature,
    bindings: &'a mut ResourceBindings,
    captures: Provenance,
    event_idx: usize,
    sig_id: SignatureId,
    arg: usize,
    path: PathHash,
    dir: Dir,
    strict: bool,
}

impl<'a> Walk<'a> {
    fn run(&mut self, strictness: &ArgStrictness) -> Result<bool, MatchError> {
        let (sig, event) = (self.sig, self.event);
        for (idx, (field, &word)) in sig.args.iter().zip(&event.args).enumerate() {
            self.arg = idx;
            self.path = PathHash::ROOT;
            self.dir = field.dir.unwrap_or(Dir::In);
            self.strict = strictness.is_strict(idx);
            if !self.num(field.ty, word)? && self.strict {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn desc(&self, ty: TypeRef) -> Result<&'a TypeDescriptor, MatchError> {
        let cat: &'a Catalogue = self.cat;
        cat.get(ty)
            .ok_or_else(|| MatchError::internal(format!("dangling type {ty}")))
    }

    fn capture(&mut self, ty: TypeRef, desc: &TypeDescriptor, bytes: &[u8]) {
        if self.strict
            || self.dir == Dir::Out
            || matches!(desc, TypeDescriptor::Pointer { .. } | TypeDescriptor::Vma)
        {
            return;
        }
        let key = ProvenanceKey {
            event: self.event_idx,
            signature: self.sig_id,
            arg: self.arg,
            path: self.path,
            ty,
        };
        self.captures.record(key, bytes.to_vec());
    }

    /// Match a value held in one word
    fn num(&mut self, ty: TypeRef, value: u64) -> Result<bool, MatchError> {
        let desc = self.desc(ty)?;
        let saved = self.path;
        self.path = saved.extend(ty.edge());
        let width = self.cat.size_of(ty).unwrap_or(0);
        self.capture(ty, desc, &le_bytes(value, width));

        let result = match desc {
            TypeDescriptor::Resource {
                name,
                kinds,
                special_values,
                ..
            } => Ok(if self.dir == Dir::Out {
                self.bindings
                    .bind(value, name, kinds.iter().map(String::as_str));
                true
            } else {
                self.resource_in(name, special_values, value)
            }),
            TypeDescriptor::Const { value: c, .. } => Ok(is_same_val(value, *c)),
            TypeDescriptor::Int {
                size,
                kind: IntKind::Plain,
            } => Ok(fits_width(value, *size)),
            TypeDescriptor::Int {
                kind: IntKind::Range { .. },
                ..
            } => Ok(true),
            TypeDescriptor::Flags {
                values,
                bitmask: true,
                ..
            } => {
                let mask = values.iter().fold(0u64, |m, v| m | v);
                Ok(value | mask == mask)
            }
            TypeDescriptor::Flags { values, .. } => Ok(values.contains(&value)),
            TypeDescriptor::Len { .. } | TypeDescriptor::Proc { .. } | TypeDescriptor::Vma => {
                Ok(true)
            }
            TypeDescriptor::Pointer { dir, elem } => self.pointer(*dir, *elem, value),
            TypeDescriptor::Buffer { .. }
            | TypeDescriptor::Array { .. }
            | TypeDescriptor::Record { .. }
            | TypeDescriptor::Union { .. } => Err(MatchError::internal(format!(
                "{} {ty} passed as a word",
                desc.label()
            ))),
        };
        self.path = saved;
        result
    }

    fn resource_in(&mut self, name: &str, special_values: &[u64], handle: u64) -> bool {
        let special = special_values.iter().any(|&v| is_same_val(handle, v));
        // A release still drops a bound handle that equals a special value.
        let bound = self.bindings.compatible(handle, name);
        if !bound.is_empty() && self.config.release_ops.contains(&self.sig.call_name) {
            for n in &bound {
                self.bindings.release(handle, n);
            }
        }
        special || !bound.is_empty() || self.config.no_alloc_kinds.contains(name)
    }

    fn pointer(&mut self, dir: Dir, elem: TypeRef, addr: u64) -> Result<bool, MatchError> {
        if addr == 0 {
            return Ok(true);
        }
        let mem = self
            .event
            .read_memory(addr, dir.reads_input(), dir.reads_output());
        if mem.is_empty() {
            return Ok(false);
        }
        let saved = self.dir;
        self.dir = dir;
        let result = self.mem(elem, &mem);
        self.dir = saved;
        result
    }

    /// Match a value laid out in memory
    fn mem(&mut self, ty: TypeRef, mem: &[u8]) -> Result<bool, MatchError> {
        let desc = self.desc(ty)?;
        let saved = self.path;
        self.path = saved.extend(ty.edge());
        self.capture(ty, desc, mem);

        let result = match desc {
            TypeDescriptor::Buffer { kind, .. } => Ok(buffer_matches(kind, mem)),
            TypeDescriptor::Array { elem, len } => self.array(*elem, *len, mem),
            TypeDescriptor::Record { fields, size, .. } => self.record(fields, *size, mem),
            TypeDescriptor::Union { fields, .. } => self.union(fields, mem),
            _ => self.scalar(ty, desc, mem),
        };
        self.path = saved;
        result
    }

    fn array(&mut self, elem: TypeRef, len: ArrayLen, mem: &[u8]) -> Result<bool, MatchError> {
        let Some(esz) = self.cat.size_of(elem).filter(|&s| s > 0) else {
            return Ok(true);
        };
        let limit = match len {
            ArrayLen::Variable => u64::MAX,
            ArrayLen::Fixed(n) => n,
            ArrayLen::Range { min, max } => {
                let n = mem.len() as u64;
                if n < min.saturating_mul(esz) || n > max.saturating_mul(esz) {
                    return Ok(false);
                }
                max
            }
        };
        let base = self.path;
        let mut matched = true;
        let chunks = mem.chunks_exact(esz as usize).take(usize::try_from(limit).unwrap_or(usize::MAX));
        for (idx, chunk) in chunks.enumerate() {
            self.path = base.extend(idx as u64);
            if !self.mem(elem, chunk)? {
                matched = false;
                if self.strict {
                    break;
                }
            }
        }
        self.path = base;
        Ok(matched)
    }

    fn record(&mut self, fields: &[Field], size: Option<u64>, mem: &[u8]) -> Result<bool, MatchError> {
        if size.is_some_and(|s| (mem.len() as u64) < s) {
            return Ok(false);
        }
        let base = self.path;
        let outer_dir = self.dir;
        let mut offset = 0usize;
        let mut matched = true;
        for (idx, field) in fields.iter().enumerate() {
            if field.overlay {
                offset = 0;
            }
            self.path = base.extend(idx as u64);
            self.dir = field.dir.unwrap_or(outer_dir);
            let rest = mem.get(offset..).unwrap_or(&[]);
            let (chunk, last) = match self.cat.size_of(field.ty) {
                Some(fsize) => {
                    let fsize = fsize as usize;
                    let Some(chunk) = rest.get(..fsize) else {
                        matched = false;
                        break;
                    };
                    offset += fsize;
                    (chunk, false)
                }
                None => (rest, true),
            };
            if !self.mem(field.ty, chunk)? {
                matched = false;
                if self.strict {
                    break;
                }
            }
            if last {
                break;
            }
        }
        self.path = base;
        self.dir = outer_dir;
        Ok(matched)
    }

    fn union(&mut self, fields: &[Field], mem: &[u8]) -> Result<bool, MatchError> {
        let base = self.path;
        let outer_dir = self.dir;
        let mut matched = false;
        for (idx, field) in fields.iter().enumerate() {
            self.path = base.extend(idx as u64);
            self.dir = field.dir.unwrap_or(outer_dir);
            if self.mem(field.ty, mem)? {
                matched = true;
                if self.strict {
                    break;
                }
            }
        }
        self.path = base;
        self.dir = outer_dir;
        Ok(matched)
    }

    fn scalar(&mut self, ty: TypeRef, desc: &TypeDescriptor, mem: &[u8]) -> Result<bool, MatchError> {
        let Some(size) = self.cat.size_of(ty) else {
            return Err(MatchError::internal(format!(
                "variable-size {} {ty} read as a scalar",
                desc.label()
            )));
        };
        if size > 8 {
            return Err(MatchError::internal(format!(
                "{size}-byte {} {ty} read as a scalar",
                desc.label()
            )));
        }
        let size = size as usize;
        let Some(bytes) = mem.get(..size) else {
            return Ok(false);
        };
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(bytes);
        self.num(ty, u64::from_le_bytes(buf))
    }
}

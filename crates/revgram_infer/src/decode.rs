//! Blob decoding against a compiled input type.
//!
//! The decoder walks the grammar consuming bytes and rebuilds the value
//! tree the blob encodes. Running out of bytes is not an error: the value
//! built so far comes back with `exhausted` set.

use crate::error::InferError;
use crate::sample::Value;
use revgram_grammar::{ArrayLen, BufferKind, Catalogue, PADDING_PREFIX, TypeDescriptor, TypeRef};
use serde::{Deserialize, Serialize};

const MAX_ELEMENTS: usize = 1 << 16;

/// Result of one recursive decoding step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The value was fully read
    Done(Value),
    /// Input ended inside the value, which holds what was read
    Exhausted(Value),
}

impl Step {
    fn into_parts(self) -> (Value, bool) {
        match self {
            Self::Done(v) => (v, false),
            Self::Exhausted(v) => (v, true),
        }
    }
}

/// Decoded blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decoded {
    /// Rebuilt value
    pub value: Value,
    /// Input ended before the value was complete
    pub exhausted: bool,
    /// Bytes consumed
    pub consumed: usize,
}

/// Decoder of blobs into value trees
pub struct BlobDecoder<'c> {
    cat: &'c Catalogue,
}

struct Cursor<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Cursor<'b> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Take up to `n` bytes, reporting whether all were available
    fn take(&mut self, n: usize) -> (&'b [u8], bool) {
        let end = self.pos.saturating_add(n).min(self.bytes.len());
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        (out, out.len() == n)
    }

    fn int(&mut self, size: u64) -> (u64, bool) {
        let (raw, complete) = self.take(size as usize);
        let mut buf = [0u8; 8];
        let n = raw.len().min(8);
        buf[..n].copy_from_slice(&raw[..n]);
        (u64::from_le_bytes(buf), complete)
    }
}

impl<'c> BlobDecoder<'c> {
    /// Create a decoder over `cat`
    #[must_use]
    pub fn new(cat: &'c Catalogue) -> Self {
        Self { cat }
    }

    /// Decode `bytes` as a value of `ty`
    ///
    /// # Errors
    ///
    /// Returns error if `ty` or a type it reaches is not in the catalogue
    pub fn decode(&self, ty: TypeRef, bytes: &[u8]) -> Result<Decoded, InferError> {
        let mut cur = Cursor { bytes, pos: 0 };
        let (value, exhausted) = self.step(ty, &mut cur, 0)?.into_parts();
        Ok(Decoded {
            value,
            exhausted,
            consumed: cur.pos,
        })
    }

    /// Decode one value, leaving at least `reserve` bytes for whatever
    /// follows when the value has no fixed size
    fn step(&self, ty: TypeRef, cur: &mut Cursor<'_>, reserve: u64) -> Result<Step, InferError> {
        let desc = self.cat.get(ty).ok_or(InferError::DanglingType(ty))?;
        let fixed = |cur: &mut Cursor<'_>, size: u64| {
            let (value, complete) = cur.int(size);
            let v = Value::Fixed { ty, size, value };
            if complete { Step::Done(v) } else { Step::Exhausted(v) }
        };
        Ok(match desc {
            TypeDescriptor::Int { size, .. } => {
                let (value, complete) = cur.int(*size);
                let v = Value::Int {
                    ty,
                    size: *size,
                    value,
                };
                if complete { Step::Done(v) } else { Step::Exhausted(v) }
            }
            TypeDescriptor::Resource { size, .. }
            | TypeDescriptor::Const { size, .. }
            | TypeDescriptor::Flags { size, .. }
            | TypeDescriptor::Len { size, .. }
            | TypeDescriptor::Proc { size, .. } => fixed(cur, *size),
            TypeDescriptor::Pointer { .. } | TypeDescriptor::Vma => fixed(cur, 8),
            TypeDescriptor::Buffer { kind, size } => {
                let want = match size {
                    Some(n) => *n as usize,
                    None => self.variable_len(kind, cur, reserve),
                };
                let (bytes, complete) = cur.take(want);
                let v = Value::Data {
                    ty,
                    bytes: bytes.to_vec(),
                };
                if complete { Step::Done(v) } else { Step::Exhausted(v) }
            }
            TypeDescriptor::Array { elem, len } => self.array(ty, *elem, len, cur, reserve)?,
            TypeDescriptor::Record { fields, .. } => {
                let mut items = Vec::with_capacity(fields.len());
                for (idx, field) in fields.iter().enumerate() {
                    if field.name.starts_with(PADDING_PREFIX) {
                        let len = self.cat.size_of(field.ty).unwrap_or(0);
                        let (_, complete) = cur.take(len as usize);
                        items.push(Value::Padding { len });
                        if !complete {
                            return Ok(Step::Exhausted(Value::Group { ty, items }));
                        }
                        continue;
                    }
                    let after: u64 = fields[idx + 1..]
                        .iter()
                        .map(|f| self.cat.min_size_of(f.ty))
                        .sum();
                    let (v, exhausted) = self.step(field.ty, cur, reserve + after)?.into_parts();
                    items.push(v);
                    if exhausted {
                        return Ok(Step::Exhausted(Value::Group { ty, items }));
                    }
                }
                Step::Done(Value::Group { ty, items })
            }
            TypeDescriptor::Union { fields, size, .. } => {
                let start = cur.pos;
                let mut first = None;
                for (index, field) in fields.iter().enumerate() {
                    cur.pos = start;
                    let step = self.step(field.ty, cur, reserve)?;
                    let fits = size.is_none_or(|s| (cur.pos - start) as u64 <= s);
                    match step {
                        Step::Done(v) if fits => {
                            return Ok(self.close_union(ty, index, v, *size, start, cur));
                        }
                        Step::Done(v) | Step::Exhausted(v) => {
                            if first.is_none() {
                                first = Some((index, v, cur.pos));
                            }
                        }
                    }
                }
                match first {
                    Some((index, v, end)) => {
                        cur.pos = end;
                        let pad = size.map_or(0, |s| s.saturating_sub(v.size()));
                        Step::Exhausted(Value::Union {
                            ty,
                            index,
                            option: Box::new(v),
                            pad,
                        })
                    }
                    None => Step::Exhausted(Value::Padding { len: 0 }),
                }
            }
        })
    }

    fn close_union(
        &self,
        ty: TypeRef,
        index: usize,
        option: Value,
        size: Option<u64>,
        start: usize,
        cur: &mut Cursor<'_>,
    ) -> Step {
        let used = (cur.pos - start) as u64;
        let pad = size.map_or(0, |s| s.saturating_sub(used));
        let (_, complete) = cur.take(pad as usize);
        let v = Value::Union {
            ty,
            index,
            option: Box::new(option),
            pad,
        };
        if complete { Step::Done(v) } else { Step::Exhausted(v) }
    }

    fn variable_len(&self, kind: &BufferKind, cur: &Cursor<'_>, reserve: u64) -> usize {
        let avail = cur.remaining().saturating_sub(reserve as usize);
        let rest = &cur.bytes[cur.pos..cur.pos + avail];
        let terminated = matches!(
            kind,
            BufferKind::String { noz: false, .. }
                | BufferKind::Filename { noz: false }
                | BufferKind::Glob { .. }
        );
        match rest.iter().position(|b| *b == 0) {
            Some(nul) if terminated => nul + 1,
            _ => avail,
        }
    }

    fn array(
        &self,
        ty: TypeRef,
        elem: TypeRef,
        len: &ArrayLen,
        cur: &mut Cursor<'_>,
        reserve: u64,
    ) -> Result<Step, InferError> {
        let (min, max) = match *len {
            ArrayLen::Fixed(n) => (n as usize, n as usize),
            ArrayLen::Range { min, max } => (min as usize, max as usize),
            ArrayLen::Variable => (0, MAX_ELEMENTS),
        };
        let mut items = Vec::new();
        while items.len() < max.min(MAX_ELEMENTS) {
            let before = cur.pos;
            if items.len() >= min && (cur.remaining() as u64) <= reserve {
                break;
            }
            let (v, exhausted) = self.step(elem, cur, reserve)?.into_parts();
            items.push(v);
            if exhausted {
                return Ok(Step::Exhausted(Value::Group { ty, items }));
            }
            if cur.pos == before && items.len() >= min {
                break;
            }
        }
        Ok(Step::Done(Value::Group { ty, items }))
    }
}

impl std::fmt::Display for Decoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)?;
        if self.exhausted {
            writeln!(f, "(blob exhausted after {} bytes)", self.consumed)?;
        } else {
            writeln!(f, "({} bytes)", self.consumed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Sample, Sampler};
    use revgram_grammar::{GrammarCompiler, SurfaceCompiler, parse_document};

    fn compile(doc: &str) -> (Catalogue, TypeRef) {
        let doc = parse_document(doc, "h").unwrap();
        let cat = SurfaceCompiler::new().compile(&[], &doc).unwrap();
        let (_, sig) = cat.signature_by_name("h_call").unwrap();
        let elem = match cat.get(sig.args[0].ty) {
            Some(TypeDescriptor::Pointer { elem, .. }) => *elem,
            other => panic!("unexpected {other:?}"),
        };
        (cat, elem)
    }

    const DOC: &str = "h_names = \"ab\", \"cdef\"
h_u [
	a	array[int8, 4]
	b	int16
] [size[4]]
h_in {
	n	len[tail, int8]
	v	int32
	u	h_u
	s	string[h_names]
	x	array[int16, 2]
	tail	array[int8]
} [packed]
h_call(buf ptr[in, h_in])
";

    #[test]
    fn test_samples_decode_to_same_bytes() {
        let (cat, ty) = compile(DOC);
        let decoder = BlobDecoder::new(&cat);
        for seed in 0..32 {
            let Some(sample) = Sampler::new(&cat, seed).sample(ty).unwrap() else {
                continue;
            };
            let blob = sample.to_bytes();
            let decoded = decoder.decode(ty, &blob).unwrap();
            assert!(!decoded.exhausted, "seed {seed}");
            assert_eq!(decoded.consumed, blob.len());
            assert_eq!(Sample::new(decoded.value).to_bytes(), blob, "seed {seed}");
        }
    }

    #[test]
    fn test_truncated_blob_is_exhausted() {
        let (cat, ty) = compile(DOC);
        let decoded = BlobDecoder::new(&cat).decode(ty, &[3, 1, 2]).unwrap();
        assert!(decoded.exhausted);
        assert_eq!(decoded.consumed, 3);
        let Value::Group { items, .. } = &decoded.value else {
            panic!("expected a record");
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Value::Fixed { value: 3, .. }));
        assert!(decoded.to_string().contains("exhausted"));
    }

    #[test]
    fn test_empty_blob() {
        let (cat, ty) = compile(DOC);
        let decoded = BlobDecoder::new(&cat).decode(ty, &[]).unwrap();
        assert!(decoded.exhausted);
        assert_eq!(decoded.consumed, 0);
    }

    #[test]
    fn test_dangling_type() {
        let (cat, _) = compile(DOC);
        let err = BlobDecoder::new(&cat)
            .decode(TypeRef(u32::MAX), &[1])
            .unwrap_err();
        assert!(matches!(err, InferError::DanglingType(_)));
    }
}

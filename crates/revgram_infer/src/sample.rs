//! Sampled harness inputs and their blob encoding.
//!
//! A [`Sample`] is a value tree shaped by the compiled input type. It is
//! generated from a seeded [`ChaCha8Rng`] so a session replays exactly,
//! complemented to produce the second run of a differential pair, and
//! serialized into the blob the harness receives together with a layout
//! that ties every data byte back to the document field that owns it.

use crate::error::InferError;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use revgram_grammar::{
    ArrayLen, BufferKind, Catalogue, IntKind, PADDING_PREFIX, TypeDescriptor, TypeRef,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use tracing::debug;

/// Regeneration bound when data values collide on their first byte
pub const MAX_SAMPLE_ATTEMPTS: usize = 256;

const MAX_BLOB_LEN: u64 = 16;
const MAX_ARRAY_LEN: u64 = 4;
const MAX_DEPTH: usize = 16;

/// One node of a sampled value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Integer drawn by the sampler
    Int {
        /// Type
        ty: TypeRef,
        /// Width in bytes
        size: u64,
        /// Value
        value: u64,
    },
    /// Integer the sampler did not choose: constants, flags, lengths,
    /// handles and addresses
    Fixed {
        /// Type
        ty: TypeRef,
        /// Width in bytes
        size: u64,
        /// Value
        value: u64,
    },
    /// Raw bytes
    Data {
        /// Type
        ty: TypeRef,
        /// Bytes
        bytes: Vec<u8>,
    },
    /// Zero bytes required by the layout
    Padding {
        /// Byte count
        len: u64,
    },
    /// Record fields or array elements
    Group {
        /// Type
        ty: TypeRef,
        /// Members in layout order
        items: Vec<Value>,
    },
    /// Chosen union alternative
    Union {
        /// Type
        ty: TypeRef,
        /// Alternative index
        index: usize,
        /// Alternative value
        option: Box<Value>,
        /// Zero bytes after the alternative up to the union size
        pad: u64,
    },
}

fn mask(size: u64) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

fn write_int(out: &mut Vec<u8>, value: u64, size: u64) {
    let bytes = value.to_le_bytes();
    let size = size as usize;
    out.extend_from_slice(&bytes[..size.min(8)]);
    out.resize(out.len() + size.saturating_sub(8), 0);
}

impl Value {
    /// Encoded length in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Int { size, .. } | Self::Fixed { size, .. } => *size,
            Self::Data { bytes, .. } => bytes.len() as u64,
            Self::Padding { len } => *len,
            Self::Group { items, .. } => items.iter().map(Value::size).sum(),
            Self::Union { option, pad, .. } => option.size() + pad,
        }
    }

    /// Type of this node, `None` for padding
    #[must_use]
    pub fn ty(&self) -> Option<TypeRef> {
        match self {
            Self::Int { ty, .. }
            | Self::Fixed { ty, .. }
            | Self::Data { ty, .. }
            | Self::Group { ty, .. }
            | Self::Union { ty, .. } => Some(*ty),
            Self::Padding { .. } => None,
        }
    }

    fn complement(&self) -> Self {
        match self {
            Self::Data { ty, bytes } => Self::Data {
                ty: *ty,
                bytes: bytes.iter().map(|b| !b).collect(),
            },
            Self::Group { ty, items } => Self::Group {
                ty: *ty,
                items: items.iter().map(Value::complement).collect(),
            },
            Self::Union {
                ty,
                index,
                option,
                pad,
            } => Self::Union {
                ty: *ty,
                index: *index,
                option: Box::new(option.complement()),
                pad: *pad,
            },
            Self::Int { .. } | Self::Fixed { .. } | Self::Padding { .. } => self.clone(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int { size, value, .. } | Self::Fixed { size, value, .. } => {
                write_int(out, *value, *size);
            }
            Self::Data { bytes, .. } => out.extend_from_slice(bytes),
            Self::Padding { len } => out.resize(out.len() + *len as usize, 0),
            Self::Group { items, .. } => items.iter().for_each(|v| v.write(out)),
            Self::Union { option, pad, .. } => {
                option.write(out);
                out.resize(out.len() + *pad as usize, 0);
            }
        }
    }

    fn first_bytes(&self, seen: &mut BTreeSet<u8>) -> bool {
        match self {
            Self::Data { bytes, .. } => bytes.first().is_none_or(|b| seen.insert(*b)),
            Self::Group { items, .. } => items.iter().all(|v| v.first_bytes(seen)),
            Self::Union { option, .. } => option.first_bytes(seen),
            Self::Int { .. } | Self::Fixed { .. } | Self::Padding { .. } => true,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl Value {
    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        match self {
            Self::Int { ty, size, value } | Self::Fixed { ty, size, value } => {
                writeln!(f, "{indent}{ty}: int{} 0x{value:x}", size * 8)
            }
            Self::Data { ty, bytes } => writeln!(f, "{indent}{ty}: data {}", hex::encode(bytes)),
            Self::Padding { len } => writeln!(f, "{indent}pad {len}"),
            Self::Group { ty, items } => {
                writeln!(f, "{indent}{ty}: {{")?;
                for item in items {
                    item.render(f, depth + 1)?;
                }
                writeln!(f, "{indent}}}")
            }
            Self::Union {
                ty, index, option, ..
            } => {
                writeln!(f, "{indent}{ty}: [{index}]")?;
                option.render(f, depth + 1)
            }
        }
    }
}

/// Sampled value for the harness input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    root: Value,
}

impl Sample {
    /// Wrap a value tree
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Root value
    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Bitwise complement of every data leaf, structure kept
    ///
    /// Integers are left alone so magic values, counts and lengths still
    /// steer the harness down the same path.
    #[must_use]
    pub fn complement(&self) -> Self {
        Self {
            root: self.root.complement(),
        }
    }

    /// Encoded blob
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.root.size() as usize);
        self.root.write(&mut out);
        out
    }

    /// Whether no two non-empty data values start with the same byte
    #[must_use]
    pub fn has_distinct_first_bytes(&self) -> bool {
        self.root.first_bytes(&mut BTreeSet::new())
    }
}

/// Document field a data leaf belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldOwner {
    /// Record name
    pub record: String,
    /// Field name
    pub field: String,
}

/// Position of one data value in a blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Byte range in the blob
    pub span: Range<usize>,
    /// Innermost record field holding the value
    pub owner: Option<FieldOwner>,
    /// Size of that field's type, `None` if variable
    pub field_size: Option<u64>,
    /// The value has no fixed size, directly or through a varlen union
    pub varlen: bool,
}

#[derive(Clone, Default)]
struct LayoutCtx {
    owner: Option<FieldOwner>,
    field_size: Option<u64>,
    union_varlen: bool,
}

/// Encode `sample` and record where each data value landed
#[must_use]
pub fn serialize_with_layout(sample: &Sample, cat: &Catalogue) -> (Vec<u8>, Vec<Leaf>) {
    let mut out = Vec::new();
    let mut leaves = Vec::new();
    layout(cat, &sample.root, &LayoutCtx::default(), &mut out, &mut leaves);
    (out, leaves)
}

fn layout(cat: &Catalogue, v: &Value, ctx: &LayoutCtx, out: &mut Vec<u8>, leaves: &mut Vec<Leaf>) {
    match v {
        Value::Data { ty, bytes } => {
            let start = out.len();
            out.extend_from_slice(bytes);
            leaves.push(Leaf {
                span: start..out.len(),
                owner: ctx.owner.clone(),
                field_size: ctx.field_size,
                varlen: ctx.union_varlen || cat.is_varlen(*ty),
            });
        }
        Value::Group { ty, items } => {
            if let Some(TypeDescriptor::Record { name, fields, .. }) = cat.get(*ty) {
                for (item, field) in items.iter().zip(fields) {
                    let inner = LayoutCtx {
                        owner: Some(FieldOwner {
                            record: name.clone(),
                            field: field.name.clone(),
                        }),
                        field_size: cat.size_of(field.ty),
                        union_varlen: false,
                    };
                    layout(cat, item, &inner, out, leaves);
                }
            } else {
                let inner = LayoutCtx {
                    union_varlen: false,
                    ..ctx.clone()
                };
                for item in items {
                    layout(cat, item, &inner, out, leaves);
                }
            }
        }
        Value::Union { ty, option, pad, .. } => {
            let inner = LayoutCtx {
                union_varlen: cat.is_varlen(*ty),
                ..ctx.clone()
            };
            layout(cat, option, &inner, out, leaves);
            out.resize(out.len() + *pad as usize, 0);
        }
        Value::Int { .. } | Value::Fixed { .. } | Value::Padding { .. } => v.write(out),
    }
}

/// Seeded generator of values for catalogue types
pub struct Sampler<'c> {
    cat: &'c Catalogue,
    rng: ChaCha8Rng,
}

impl<'c> Sampler<'c> {
    /// Create a sampler seeded with `seed`
    #[must_use]
    pub fn new(cat: &'c Catalogue, seed: u64) -> Self {
        Self {
            cat,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Sample `ty`, regenerating while data values share a first byte
    ///
    /// Returns `Ok(None)` when every attempt collided.
    ///
    /// # Errors
    ///
    /// Returns error if `ty` or a type it reaches is not in the catalogue
    pub fn sample(&mut self, ty: TypeRef) -> Result<Option<Sample>, InferError> {
        for attempt in 0..MAX_SAMPLE_ATTEMPTS {
            let sample = Sample::new(self.value(ty, 0)?);
            if sample.has_distinct_first_bytes() {
                return Ok(Some(sample));
            }
            debug!(attempt, "data values collide, regenerating");
        }
        Ok(None)
    }

    /// Sample one value of `ty` without the collision check
    ///
    /// # Errors
    ///
    /// Returns error if `ty` or a type it reaches is not in the catalogue
    pub fn sample_value(&mut self, ty: TypeRef) -> Result<Value, InferError> {
        self.value(ty, 0)
    }

    fn value(&mut self, ty: TypeRef, depth: usize) -> Result<Value, InferError> {
        let cat = self.cat;
        let desc = cat.get(ty).ok_or(InferError::DanglingType(ty))?;
        let fixed = |size: u64, value: u64| Value::Fixed { ty, size, value };
        Ok(match desc {
            TypeDescriptor::Resource {
                special_values,
                size,
                ..
            } => fixed(*size, special_values.first().copied().unwrap_or(0) & mask(*size)),
            TypeDescriptor::Const { value, size } => fixed(*size, *value & mask(*size)),
            TypeDescriptor::Int { size, kind } => Value::Int {
                ty,
                size: *size,
                value: self.int(kind) & mask(*size),
            },
            TypeDescriptor::Flags {
                values,
                size,
                bitmask,
                ..
            } => {
                let value = if values.is_empty() {
                    0
                } else if *bitmask {
                    values
                        .iter()
                        .filter(|_| self.rng.gen_bool(0.5))
                        .fold(0, |acc, v| acc | v)
                } else {
                    values[self.rng.gen_range(0..values.len())]
                };
                fixed(*size, value & mask(*size))
            }
            TypeDescriptor::Len { size, .. } => fixed(*size, 0),
            TypeDescriptor::Proc {
                size,
                start,
                per_proc,
            } => {
                let value = start.wrapping_add(self.rng.next_u64() % (*per_proc).max(1));
                fixed(*size, value & mask(*size))
            }
            TypeDescriptor::Pointer { .. } | TypeDescriptor::Vma => fixed(8, 0),
            TypeDescriptor::Buffer { kind, size } => Value::Data {
                ty,
                bytes: self.buffer(kind, *size),
            },
            TypeDescriptor::Array { elem, len } => {
                let count = match len {
                    _ if depth >= MAX_DEPTH => 0,
                    ArrayLen::Variable => self.rng.gen_range(1..=MAX_ARRAY_LEN),
                    ArrayLen::Fixed(n) => *n,
                    ArrayLen::Range { min, max } => {
                        self.rng.gen_range(*min..=(*max).min(min + MAX_ARRAY_LEN))
                    }
                };
                let items = (0..count)
                    .map(|_| self.value(*elem, depth + 1))
                    .collect::<Result<_, _>>()?;
                Value::Group { ty, items }
            }
            TypeDescriptor::Record { fields, .. } => {
                let mut items = Vec::with_capacity(fields.len());
                for field in fields {
                    if field.name.starts_with(PADDING_PREFIX) {
                        items.push(Value::Padding {
                            len: cat.size_of(field.ty).unwrap_or(0),
                        });
                    } else {
                        items.push(self.value(field.ty, depth + 1)?);
                    }
                }
                fix_lengths(cat, fields, &mut items);
                Value::Group { ty, items }
            }
            TypeDescriptor::Union { fields, size, .. } => {
                if fields.is_empty() {
                    return Ok(Value::Padding {
                        len: size.unwrap_or(0),
                    });
                }
                let index = self.rng.gen_range(0..fields.len());
                let option = self.value(fields[index].ty, depth + 1)?;
                let pad = size.map_or(0, |s| s.saturating_sub(option.size()));
                Value::Union {
                    ty,
                    index,
                    option: Box::new(option),
                    pad,
                }
            }
        })
    }

    fn int(&mut self, kind: &IntKind) -> u64 {
        match *kind {
            IntKind::Plain => self.rng.next_u64(),
            IntKind::Range { begin, end, .. } if begin >= end => begin,
            IntKind::Range { begin, end, align } => {
                let v = self.rng.gen_range(begin..=end);
                if align == 0 {
                    v
                } else {
                    begin + (v - begin) / align * align
                }
            }
        }
    }

    fn random_bytes(&mut self, len: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; len as usize];
        self.rng.fill_bytes(&mut bytes);
        bytes
    }

    fn text(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.gen_range(b'a'..=b'z')).collect()
    }

    fn buffer(&mut self, kind: &BufferKind, size: Option<u64>) -> Vec<u8> {
        let mut bytes = match kind {
            BufferKind::Random | BufferKind::Text { .. } => {
                let len = size.unwrap_or_else(|| self.rng.gen_range(1..=MAX_BLOB_LEN));
                self.random_bytes(len)
            }
            BufferKind::Ranged { min, max } => {
                let len = size.unwrap_or_else(|| {
                    self.rng
                        .gen_range(*min..=(*max).min(min + MAX_BLOB_LEN).max(*min))
                });
                self.random_bytes(len)
            }
            BufferKind::String { values, noz } if values.is_empty() => {
                let room = size.map_or(8, |s| s.saturating_sub(u64::from(!*noz)));
                let len = self.rng.gen_range(0..=room) as usize;
                let mut s = self.text(len.max(usize::from(room > 0)));
                if !*noz {
                    s.push(0);
                }
                s
            }
            BufferKind::String { values, .. } => {
                values[self.rng.gen_range(0..values.len())].clone()
            }
            BufferKind::Filename { noz } => {
                let mut name = b"./file".to_vec();
                name.extend(self.text(1));
                if !*noz {
                    name.push(0);
                }
                name
            }
            BufferKind::Glob { .. } => b"/\0".to_vec(),
        };
        if let Some(n) = size {
            bytes.resize(n as usize, 0);
        }
        bytes
    }
}

/// Set each length field to the size of its target sibling
fn fix_lengths(cat: &Catalogue, fields: &[revgram_grammar::Field], items: &mut [Value]) {
    for (idx, field) in fields.iter().enumerate() {
        let Some(TypeDescriptor::Len { path, bytes, .. }) = cat.get(field.ty) else {
            continue;
        };
        let Some(target) = path
            .first()
            .and_then(|t| fields.iter().position(|f| &f.name == t))
        else {
            continue;
        };
        let count = match &items[target] {
            v if *bytes => v.size(),
            Value::Group { ty, items: elems } if matches!(cat.get(*ty), Some(TypeDescriptor::Array { .. })) => {
                elems.len() as u64
            }
            v => v.size(),
        };
        if let Value::Fixed { value, size, .. } = &mut items[idx] {
            *value = count & mask(*size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revgram_grammar::{GrammarCompiler, SurfaceCompiler, parse_document};

    pub(crate) fn compile(doc: &str) -> Catalogue {
        let doc = parse_document(doc, "h").unwrap();
        SurfaceCompiler::new().compile(&[], &doc).unwrap()
    }

    pub(crate) fn input_type(cat: &Catalogue) -> TypeRef {
        let (_, sig) = cat.signature_by_name("h_call").unwrap();
        match cat.get(sig.args[0].ty) {
            Some(TypeDescriptor::Pointer { elem, .. }) => *elem,
            other => panic!("unexpected {other:?}"),
        }
    }

    const DOC: &str = "h_u [
	a	array[int8, 4]
	b	int32
] [size[4]]
h_in {
	n	len[data, int8]
	head	int16
	tag	const[7, int8]
	u	h_u
	data	array[int8]
} [packed]
h_call(buf ptr[in, h_in])
";

    #[test]
    fn test_sample_is_reproducible() {
        let cat = compile(DOC);
        let ty = input_type(&cat);
        let a = Sampler::new(&cat, 42).sample(ty).unwrap().unwrap();
        let b = Sampler::new(&cat, 42).sample(ty).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_lengths_and_constants() {
        let cat = compile(DOC);
        let ty = input_type(&cat);
        let sample = Sampler::new(&cat, 7).sample(ty).unwrap().unwrap();
        let blob = sample.to_bytes();
        let Value::Group { items, .. } = sample.root() else {
            panic!("expected a record");
        };
        let data_len = items[4].size();
        assert_eq!(u64::from(blob[0]), data_len);
        assert_eq!(blob[3], 7);
        assert_eq!(blob.len() as u64, 1 + 2 + 1 + 4 + data_len);
    }

    #[test]
    fn test_complement_keeps_structure() {
        let cat = compile(DOC);
        let ty = input_type(&cat);
        let sample = Sampler::new(&cat, 3).sample(ty).unwrap().unwrap();
        let a = sample.to_bytes();
        let b = sample.complement().to_bytes();
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0], b[0], "length kept");
        assert_eq!(a[3], b[3], "constant kept");
        assert_eq!(a[1..3], b[1..3], "integer kept");
        assert_eq!(a[a.len() - 1], !b[b.len() - 1], "data complemented");
    }

    #[test]
    fn test_complement_keeps_pinned_integers() {
        let cat = compile(
            "h_in {
	magic	int32[0x4c4f4746]
	count	int8[1]
	body	array[int8, 4]
} [packed]
h_call(buf ptr[in, h_in])
",
        );
        let ty = input_type(&cat);
        for seed in 0..8 {
            let sample = Sampler::new(&cat, seed).sample(ty).unwrap().unwrap();
            let a = sample.to_bytes();
            let b = sample.complement().to_bytes();
            assert_eq!(a[..5], [0x46, 0x47, 0x4f, 0x4c, 1]);
            assert_eq!(a[..5], b[..5]);
            for i in 5..9 {
                assert_eq!(a[i], !b[i]);
            }
            let Value::Group { items, .. } = sample.complement().root().clone() else {
                panic!("expected a record");
            };
            assert!(matches!(items[0], Value::Int { value: 0x4c4f_4746, size: 4, .. }));
            assert!(matches!(items[1], Value::Int { value: 1, size: 1, .. }));
        }
    }

    #[test]
    fn test_layout_owners() {
        let cat = compile(DOC);
        let ty = input_type(&cat);
        let sample = Sampler::new(&cat, 11).sample(ty).unwrap().unwrap();
        let (blob, leaves) = serialize_with_layout(&sample, &cat);
        assert_eq!(blob, sample.to_bytes());
        let data = leaves
            .iter()
            .find(|l| l.owner.as_ref().is_some_and(|o| o.field == "data"))
            .unwrap();
        assert_eq!(data.span.end, blob.len());
        assert!(data.varlen);
        assert_eq!(data.field_size, None);
        for leaf in leaves.iter().filter(|l| l.owner.as_ref().is_some_and(|o| o.field == "u")) {
            assert_eq!(leaf.span, 4..8);
            assert_eq!(leaf.field_size, Some(4));
            assert!(!leaf.varlen);
        }
    }

    #[test]
    fn test_first_byte_collision_detected() {
        let ty = TypeRef(0);
        let sample = Sample::new(Value::Group {
            ty,
            items: vec![
                Value::Data {
                    ty,
                    bytes: vec![1, 2],
                },
                Value::Data {
                    ty,
                    bytes: vec![],
                },
                Value::Data {
                    ty,
                    bytes: vec![1, 9],
                },
            ],
        });
        assert!(!sample.has_distinct_first_bytes());
    }
}

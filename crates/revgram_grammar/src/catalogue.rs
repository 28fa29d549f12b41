//! Compiled signature catalogue.
//!
//! Holds the type arena and the operation signatures, indexed by opcode so
//! the matcher can find candidates for a trace event without a global
//! lookup table.

use crate::types::{ArrayLen, BufferKind, Field, Signature, TypeDescriptor, TypeRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Recursion bound for size estimation through self-referencing types
const MAX_SIZE_DEPTH: usize = 32;

/// Index of a signature in a [`Catalogue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignatureId(pub u32);

impl SignatureId {
    /// Arena index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Type arena plus signatures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalogue {
    types: Vec<TypeDescriptor>,
    signatures: Vec<Signature>,
    by_opcode: BTreeMap<u64, Vec<SignatureId>>,
    by_name: BTreeMap<String, SignatureId>,
}

impl Catalogue {
    /// Create an empty catalogue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a descriptor
    pub fn push_type(&mut self, desc: TypeDescriptor) -> TypeRef {
        let idx = u32::try_from(self.types.len()).unwrap_or(u32::MAX);
        self.types.push(desc);
        TypeRef(idx)
    }

    /// Replace a descriptor in place, used to finish recursive records
    pub(crate) fn set_type(&mut self, r: TypeRef, desc: TypeDescriptor) {
        if let Some(slot) = self.types.get_mut(r.index()) {
            *slot = desc;
        }
    }

    /// Append a signature
    pub fn push_signature(&mut self, sig: Signature) -> SignatureId {
        let id = SignatureId(u32::try_from(self.signatures.len()).unwrap_or(u32::MAX));
        if let Some(op) = sig.opcode {
            self.by_opcode.entry(op).or_default().push(id);
        }
        self.by_name.insert(sig.name.clone(), id);
        self.signatures.push(sig);
        id
    }

    /// Descriptor for a reference
    #[must_use]
    pub fn get(&self, r: TypeRef) -> Option<&TypeDescriptor> {
        self.types.get(r.index())
    }

    /// Number of descriptors
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// All signatures in declaration order
    #[must_use]
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Signature by id
    #[must_use]
    pub fn signature(&self, id: SignatureId) -> Option<&Signature> {
        self.signatures.get(id.index())
    }

    /// Signature by full name
    #[must_use]
    pub fn signature_by_name(&self, name: &str) -> Option<(SignatureId, &Signature)> {
        let id = *self.by_name.get(name)?;
        Some((id, self.signature(id)?))
    }

    /// Signatures sharing an opcode, in declaration order
    #[must_use]
    pub fn candidates(&self, opcode: u64) -> &[SignatureId] {
        self.by_opcode.get(&opcode).map_or(&[], Vec::as_slice)
    }

    /// First non-variant, non-pseudo signature for an opcode
    #[must_use]
    pub fn plain_signature(&self, opcode: u64) -> Option<(SignatureId, &Signature)> {
        self.candidates(opcode).iter().find_map(|&id| {
            let sig = self.signature(id)?;
            (!sig.is_variant() && !sig.is_pseudo()).then_some((id, sig))
        })
    }

    /// Fixed size in bytes, `None` when variable or unknown
    #[must_use]
    pub fn size_of(&self, r: TypeRef) -> Option<u64> {
        match self.get(r)? {
            TypeDescriptor::Resource { size, .. }
            | TypeDescriptor::Const { size, .. }
            | TypeDescriptor::Int { size, .. }
            | TypeDescriptor::Flags { size, .. }
            | TypeDescriptor::Len { size, .. }
            | TypeDescriptor::Proc { size, .. } => Some(*size),
            TypeDescriptor::Pointer { .. } | TypeDescriptor::Vma => Some(8),
            TypeDescriptor::Buffer { size, .. }
            | TypeDescriptor::Record { size, .. }
            | TypeDescriptor::Union { size, .. } => *size,
            TypeDescriptor::Array { elem, len } => match len {
                ArrayLen::Fixed(n) => self.size_of(*elem)?.checked_mul(*n),
                ArrayLen::Range { min, max } if min == max => self.size_of(*elem)?.checked_mul(*min),
                _ => None,
            },
        }
    }

    /// Whether the type has no fixed size
    #[must_use]
    pub fn is_varlen(&self, r: TypeRef) -> bool {
        self.size_of(r).is_none()
    }

    /// Smallest number of bytes a value of the type can occupy
    #[must_use]
    pub fn min_size_of(&self, r: TypeRef) -> u64 {
        self.min_size_at(r, 0)
    }

    fn min_size_at(&self, r: TypeRef, depth: usize) -> u64 {
        if depth > MAX_SIZE_DEPTH {
            return 0;
        }
        if let Some(size) = self.size_of(r) {
            return size;
        }
        let Some(desc) = self.get(r) else {
            return 0;
        };
        match desc {
            TypeDescriptor::Buffer { kind, .. } => match kind {
                BufferKind::Ranged { min, .. } => *min,
                BufferKind::String { values, .. } => {
                    values.iter().map(|v| v.len() as u64).min().unwrap_or(0)
                }
                BufferKind::Random
                | BufferKind::Filename { .. }
                | BufferKind::Glob { .. }
                | BufferKind::Text { .. } => 0,
            },
            TypeDescriptor::Array { elem, len } => {
                let count = match len {
                    ArrayLen::Variable => 0,
                    ArrayLen::Fixed(n) => *n,
                    ArrayLen::Range { min, .. } => *min,
                };
                count.saturating_mul(self.min_size_at(*elem, depth + 1))
            }
            TypeDescriptor::Record { fields, .. } => fields
                .iter()
                .map(|f| self.min_size_at(f.ty, depth + 1))
                .fold(0u64, u64::saturating_add),
            TypeDescriptor::Union { fields, .. } => fields
                .iter()
                .map(|f| self.min_size_at(f.ty, depth + 1))
                .min()
                .unwrap_or(0),
            // Fixed-size variants returned above.
            TypeDescriptor::Resource { .. }
            | TypeDescriptor::Const { .. }
            | TypeDescriptor::Int { .. }
            | TypeDescriptor::Flags { .. }
            | TypeDescriptor::Len { .. }
            | TypeDescriptor::Pointer { .. }
            | TypeDescriptor::Vma
            | TypeDescriptor::Proc { .. } => 0,
        }
    }

    /// Natural alignment in bytes
    #[must_use]
    pub fn align_of(&self, r: TypeRef) -> u64 {
        let Some(desc) = self.get(r) else {
            return 1;
        };
        match desc {
            TypeDescriptor::Resource { size, .. }
            | TypeDescriptor::Const { size, .. }
            | TypeDescriptor::Int { size, .. }
            | TypeDescriptor::Flags { size, .. }
            | TypeDescriptor::Len { size, .. }
            | TypeDescriptor::Proc { size, .. } => (*size).clamp(1, 8),
            TypeDescriptor::Pointer { .. } | TypeDescriptor::Vma => 8,
            TypeDescriptor::Buffer { .. } => 1,
            TypeDescriptor::Array { elem, .. } => self.align_of(*elem),
            TypeDescriptor::Record { packed: true, .. } => 1,
            TypeDescriptor::Record { fields, .. } | TypeDescriptor::Union { fields, .. } => {
                fields_align(self, fields)
            }
        }
    }
}

fn fields_align(cat: &Catalogue, fields: &[Field]) -> u64 {
    fields.iter().map(|f| cat.align_of(f.ty)).max().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntKind;

    fn int(cat: &mut Catalogue, size: u64) -> TypeRef {
        cat.push_type(TypeDescriptor::Int {
            size,
            kind: IntKind::Plain,
        })
    }

    #[test]
    fn test_sizes() {
        let mut cat = Catalogue::new();
        let i32_ = int(&mut cat, 4);
        let blob = cat.push_type(TypeDescriptor::Buffer {
            kind: BufferKind::Random,
            size: None,
        });
        let arr = cat.push_type(TypeDescriptor::Array {
            elem: i32_,
            len: ArrayLen::Fixed(3),
        });
        let rec = cat.push_type(TypeDescriptor::Record {
            name: "r".to_string(),
            fields: vec![Field::new("a", i32_), Field::new("b", blob)],
            packed: true,
            size: None,
        });
        assert_eq!(cat.size_of(i32_), Some(4));
        assert_eq!(cat.size_of(arr), Some(12));
        assert!(cat.is_varlen(blob));
        assert!(cat.is_varlen(rec));
        assert_eq!(cat.min_size_of(rec), 4);
        assert_eq!(cat.align_of(rec), 1);
        assert_eq!(cat.size_of(TypeRef(99)), None);
    }

    #[test]
    fn test_min_size_of_union_and_strings() {
        let mut cat = Catalogue::new();
        let s = cat.push_type(TypeDescriptor::Buffer {
            kind: BufferKind::String {
                values: vec![b"ab\0".to_vec(), b"abcdef\0".to_vec()],
                noz: false,
            },
            size: None,
        });
        let i64_ = int(&mut cat, 8);
        let u = cat.push_type(TypeDescriptor::Union {
            name: "u".to_string(),
            fields: vec![Field::new("s", s), Field::new("i", i64_)],
            size: None,
        });
        assert_eq!(cat.min_size_of(s), 3);
        assert_eq!(cat.min_size_of(u), 3);
        assert_eq!(cat.align_of(u), 8);
    }

    #[test]
    fn test_candidates_and_plain_signature() {
        let mut cat = Catalogue::new();
        let fd = int(&mut cat, 4);
        let sig = |name: &str| Signature {
            name: name.to_string(),
            call_name: crate::types::call_name_of(name).to_string(),
            opcode: Some(16),
            args: vec![Field::new("fd", fd)],
            ret: None,
        };
        cat.push_signature(sig("ioctl$TCGETS"));
        let plain = cat.push_signature(sig("ioctl"));
        assert_eq!(cat.candidates(16).len(), 2);
        assert_eq!(cat.plain_signature(16).map(|(id, _)| id), Some(plain));
        assert!(cat.candidates(17).is_empty());
        assert!(cat.signature_by_name("ioctl$TCGETS").is_some());
    }
}

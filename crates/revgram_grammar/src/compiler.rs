//! Lowering of grammar documents into a typed [`Catalogue`].
//!
//! Base documents carry the known operation signatures and the types they
//! use. The working document is the grammar under inference; its nodes
//! must all be reachable from some operation, otherwise the compiler
//! rejects it with `unused <kind> <name>` messages that the repair
//! heuristics act on.

use crate::catalogue::Catalogue;
use crate::document::{Document, FieldDef, Node, RecordNode, ResourceNode, TypeExpr};
use crate::types::{
    ArrayLen, BufferKind, Dir, Field, IntKind, Signature, TypeDescriptor, TypeRef, call_name_of,
};
use revgram_core::Fault;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Document rejected by a compiler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// One message per problem, de-duplicated, in discovery order
    #[error("grammar rejected: {}", messages.join("; "))]
    Rejected {
        /// Compiler messages
        messages: Vec<String>,
    },
}

impl CompileError {
    /// Rejection messages
    #[must_use]
    pub fn messages(&self) -> &[String] {
        match self {
            Self::Rejected { messages } => messages,
        }
    }
}

impl From<CompileError> for Fault {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Rejected { messages } => Fault::Compile { messages },
        }
    }
}

/// Validates documents into typed signatures
pub trait GrammarCompiler {
    /// Compile `doc` on top of `base`
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::Rejected`] listing every problem found
    fn compile(&self, base: &[Document], doc: &Document) -> Result<Catalogue, CompileError>;
}

/// Compiler for the in-crate surface syntax
#[derive(Debug, Clone, Copy, Default)]
pub struct SurfaceCompiler;

impl SurfaceCompiler {
    /// Create a new compiler
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl GrammarCompiler for SurfaceCompiler {
    fn compile(&self, base: &[Document], doc: &Document) -> Result<Catalogue, CompileError> {
        let mut lowering = Lowering::default();
        for d in base {
            lowering.collect(d, false);
        }
        lowering.collect(doc, true);
        lowering.lower_calls();
        lowering.check_unused();
        lowering.finish()
    }
}

/// Width in bytes of an `intN` builtin
#[must_use]
pub fn int_width(name: &str) -> Option<u64> {
    match name {
        "int8" => Some(1),
        "int16" => Some(2),
        "int32" => Some(4),
        "int64" | "intptr" => Some(8),
        _ => None,
    }
}

const DEFAULT_WIDTH: u64 = 8;

/// Name prefix of alignment fields the compiler inserts into records
pub const PADDING_PREFIX: &str = "_pad";

#[derive(Default)]
struct Lowering<'a> {
    nodes: BTreeMap<&'a str, (&'a Node, bool)>,
    order: Vec<&'a str>,
    cat: Catalogue,
    named: BTreeMap<String, TypeRef>,
    /// Records being lowered, with the pointer depth at entry
    in_progress: Vec<(String, usize)>,
    ptr_depth: usize,
    used: BTreeSet<String>,
    errors: Vec<String>,
}

impl<'a> Lowering<'a> {
    fn error(&mut self, message: String) {
        if !self.errors.contains(&message) {
            self.errors.push(message);
        }
    }

    fn collect(&mut self, doc: &'a Document, working: bool) {
        for node in doc.nodes() {
            let name = node.name();
            if self.nodes.contains_key(name) {
                self.error(format!("duplicate definition {name}"));
                continue;
            }
            self.nodes.insert(name, (node, working));
            self.order.push(name);
        }
    }

    fn lower_calls(&mut self) {
        let order = self.order.clone();
        for name in order {
            let Some(&(node, _)) = self.nodes.get(name) else {
                continue;
            };
            let Node::Call(call) = node else {
                continue;
            };
            let mut args = Vec::with_capacity(call.args.len());
            for arg in &call.args {
                if let Some(field) = self.field(arg, &call.args) {
                    args.push(field);
                }
            }
            let ret = call.ret.as_ref().and_then(|r| self.lower(r, &[]));
            if args.len() != call.args.len() {
                continue;
            }
            self.cat.push_signature(Signature {
                name: call.name.clone(),
                call_name: call_name_of(&call.name).to_string(),
                opcode: call.opcode,
                args,
                ret,
            });
        }
    }

    fn check_unused(&mut self) {
        let unused: Vec<String> = self
            .order
            .iter()
            .filter_map(|name| {
                let (node, working) = self.nodes.get(name)?;
                let unused =
                    *working && !matches!(node, Node::Call(_)) && !self.used.contains(*name);
                unused.then(|| format!("unused {} {name}", node.kind_label()))
            })
            .collect();
        for message in unused {
            self.error(message);
        }
    }

    fn finish(self) -> Result<Catalogue, CompileError> {
        if self.errors.is_empty() {
            Ok(self.cat)
        } else {
            debug!(count = self.errors.len(), "grammar rejected");
            Err(CompileError::Rejected {
                messages: self.errors,
            })
        }
    }

    fn field(&mut self, def: &FieldDef, siblings: &[FieldDef]) -> Option<Field> {
        let ty = self.lower(&def.ty, siblings)?;
        Some(Field {
            name: def.name.clone(),
            ty,
            dir: def.dir,
            overlay: def.overlay,
        })
    }

    fn width_arg(&mut self, owner: &str, arg: Option<&TypeExpr>) -> Option<u64> {
        match arg {
            None => Some(DEFAULT_WIDTH),
            Some(TypeExpr::Ident { name, args }) if args.is_empty() => match int_width(name) {
                Some(w) => Some(w),
                None => {
                    self.error(format!("bad width {name} for {owner}"));
                    None
                }
            },
            Some(other) => {
                self.error(format!("bad width {other} for {owner}"));
                None
            }
        }
    }

    fn bad_args(&mut self, name: &str) -> Option<TypeRef> {
        self.error(format!("bad arguments for {name}"));
        None
    }

    fn lower(&mut self, expr: &TypeExpr, siblings: &[FieldDef]) -> Option<TypeRef> {
        let TypeExpr::Ident { name, args } = expr else {
            self.error(format!("expected a type, got {expr}"));
            return None;
        };
        let name = name.as_str();

        if let Some(size) = int_width(name) {
            let kind = match args.as_slice() {
                [] => IntKind::Plain,
                [TypeExpr::Int(v)] => IntKind::Range {
                    begin: *v,
                    end: *v,
                    align: 0,
                },
                [TypeExpr::Range(begin, end)] => IntKind::Range {
                    begin: *begin,
                    end: *end,
                    align: 0,
                },
                [TypeExpr::Range(begin, end), TypeExpr::Int(align)] => IntKind::Range {
                    begin: *begin,
                    end: *end,
                    align: *align,
                },
                _ => return self.bad_args(name),
            };
            return Some(self.cat.push_type(TypeDescriptor::Int { size, kind }));
        }

        match name {
            "const" => {
                let [TypeExpr::Int(value), rest @ ..] = args.as_slice() else {
                    return self.bad_args(name);
                };
                if rest.len() > 1 {
                    return self.bad_args(name);
                }
                let size = self.width_arg(name, rest.first())?;
                Some(self.cat.push_type(TypeDescriptor::Const {
                    value: *value,
                    size,
                }))
            }
            "flags" => {
                let [TypeExpr::Ident { name: set, args: set_args }, rest @ ..] = args.as_slice()
                else {
                    return self.bad_args(name);
                };
                if !set_args.is_empty() || rest.len() > 1 {
                    return self.bad_args(name);
                }
                let values = match self.nodes.get(set.as_str()) {
                    Some((Node::Flags(f), _)) => f.values.clone(),
                    Some(_) => {
                        self.error(format!("{set} is not a flags set"));
                        return None;
                    }
                    None => {
                        self.error(format!("undefined flags {set}"));
                        return None;
                    }
                };
                self.used.insert(set.clone());
                let size = self.width_arg(name, rest.first())?;
                let bitmask = !values.is_empty() && values.iter().all(|v| v.is_power_of_two());
                Some(self.cat.push_type(TypeDescriptor::Flags {
                    name: set.clone(),
                    values,
                    size,
                    bitmask,
                }))
            }
            "len" | "bytesize" => {
                let [TypeExpr::Ident { name: target, args: target_args }, rest @ ..] =
                    args.as_slice()
                else {
                    return self.bad_args(name);
                };
                if !target_args.is_empty() || rest.len() > 1 {
                    return self.bad_args(name);
                }
                if !siblings.iter().any(|f| &f.name == target) {
                    self.error(format!("len target {target} not found"));
                    return None;
                }
                let size = self.width_arg(name, rest.first())?;
                Some(self.cat.push_type(TypeDescriptor::Len {
                    path: vec![target.clone()],
                    size,
                    bytes: name == "bytesize",
                }))
            }
            "ptr" | "ptr64" => {
                let [TypeExpr::Ident { name: dir, args: dir_args }, elem] = args.as_slice() else {
                    return self.bad_args(name);
                };
                let Some(dir) = Dir::parse(dir).filter(|_| dir_args.is_empty()) else {
                    self.error(format!("bad direction {dir} for {name}"));
                    return None;
                };
                self.ptr_depth += 1;
                let elem = self.lower(elem, &[]);
                self.ptr_depth -= 1;
                let elem = elem?;
                Some(self.cat.push_type(TypeDescriptor::Pointer { dir, elem }))
            }
            "array" => self.array(args, siblings),
            "void" => {
                if !args.is_empty() {
                    return self.bad_args(name);
                }
                Some(self.cat.push_type(TypeDescriptor::Buffer {
                    kind: BufferKind::Ranged { min: 0, max: 0 },
                    size: Some(0),
                }))
            }
            "string" | "stringnoz" => self.string(name, args),
            "filename" => {
                if !args.is_empty() {
                    return self.bad_args(name);
                }
                Some(self.cat.push_type(TypeDescriptor::Buffer {
                    kind: BufferKind::Filename { noz: false },
                    size: None,
                }))
            }
            "glob" => {
                let [TypeExpr::Str(pattern)] = args.as_slice() else {
                    return self.bad_args(name);
                };
                Some(self.cat.push_type(TypeDescriptor::Buffer {
                    kind: BufferKind::Glob {
                        pattern: String::from_utf8_lossy(pattern).into_owned(),
                    },
                    size: None,
                }))
            }
            "text" => {
                let [TypeExpr::Ident { name: arch, .. }] = args.as_slice() else {
                    return self.bad_args(name);
                };
                Some(self.cat.push_type(TypeDescriptor::Buffer {
                    kind: BufferKind::Text { arch: arch.clone() },
                    size: None,
                }))
            }
            "vma" | "vma64" => Some(self.cat.push_type(TypeDescriptor::Vma)),
            "proc" => {
                let [TypeExpr::Int(start), TypeExpr::Int(per_proc), rest @ ..] = args.as_slice()
                else {
                    return self.bad_args(name);
                };
                if rest.len() > 1 {
                    return self.bad_args(name);
                }
                let size = self.width_arg(name, rest.first())?;
                Some(self.cat.push_type(TypeDescriptor::Proc {
                    size,
                    start: *start,
                    per_proc: *per_proc,
                }))
            }
            _ => self.named_type(name, args),
        }
    }

    fn array(&mut self, args: &[TypeExpr], siblings: &[FieldDef]) -> Option<TypeRef> {
        let (elem, len) = match args {
            [elem] => (elem, ArrayLen::Variable),
            [elem, TypeExpr::Int(n)] => (elem, ArrayLen::Fixed(*n)),
            [elem, TypeExpr::Range(min, max)] if min <= max => {
                (elem, ArrayLen::Range { min: *min, max: *max })
            }
            _ => return self.bad_args("array"),
        };
        let is_bytes = matches!(elem, TypeExpr::Ident { name, args } if name == "int8" && args.is_empty());
        if is_bytes {
            let (kind, size) = match len {
                ArrayLen::Variable => (BufferKind::Random, None),
                ArrayLen::Fixed(n) => (BufferKind::Ranged { min: n, max: n }, Some(n)),
                ArrayLen::Range { min, max } => {
                    (BufferKind::Ranged { min, max }, (min == max).then_some(min))
                }
            };
            return Some(self.cat.push_type(TypeDescriptor::Buffer { kind, size }));
        }
        let elem = self.lower(elem, siblings)?;
        Some(self.cat.push_type(TypeDescriptor::Array { elem, len }))
    }

    fn string(&mut self, name: &str, args: &[TypeExpr]) -> Option<TypeRef> {
        let noz = name == "stringnoz";
        let (first, size) = match args {
            [] => (None, None),
            [first] => (Some(first), None),
            [first, TypeExpr::Int(size)] => (Some(first), Some(*size)),
            _ => return self.bad_args(name),
        };
        let mut values: Vec<Vec<u8>> = match first {
            None => Vec::new(),
            Some(TypeExpr::Str(s)) => vec![s.clone()],
            Some(TypeExpr::Ident { name: inner, args: inner_args }) if inner_args.is_empty() => {
                if inner == "filename" {
                    if size.is_some() {
                        return self.bad_args(name);
                    }
                    return Some(self.cat.push_type(TypeDescriptor::Buffer {
                        kind: BufferKind::Filename { noz },
                        size: None,
                    }));
                }
                match self.nodes.get(inner.as_str()) {
                    Some((Node::StrFlags(s), _)) => {
                        let values = s.values.clone();
                        self.used.insert(inner.clone());
                        values
                    }
                    Some(_) => {
                        self.error(format!("{inner} is not a string flags set"));
                        return None;
                    }
                    None => {
                        self.error(format!("undefined string flags {inner}"));
                        return None;
                    }
                }
            }
            Some(_) => return self.bad_args(name),
        };
        if !noz {
            for v in &mut values {
                v.push(0);
            }
        }
        let size = match size {
            Some(size) => {
                for v in &mut values {
                    if v.len() as u64 > size {
                        self.error(format!(
                            "string value {:?} is longer than size {size}",
                            String::from_utf8_lossy(v)
                        ));
                        return None;
                    }
                    v.resize(usize::try_from(size).unwrap_or(usize::MAX), 0);
                }
                Some(size)
            }
            None => match values.first() {
                Some(first) if values.iter().all(|v| v.len() == first.len()) => {
                    Some(first.len() as u64)
                }
                _ => None,
            },
        };
        Some(self.cat.push_type(TypeDescriptor::Buffer {
            kind: BufferKind::String { values, noz },
            size,
        }))
    }

    fn named_type(&mut self, name: &str, args: &[TypeExpr]) -> Option<TypeRef> {
        let Some(&(node, _)) = self.nodes.get(name) else {
            self.error(format!("undefined type {name}"));
            return None;
        };
        if !args.is_empty() {
            return self.bad_args(name);
        }
        self.used.insert(name.to_string());
        match node {
            Node::Record(r) => self.record(r),
            Node::Resource(r) => self.resource(r),
            Node::Flags(_) | Node::StrFlags(_) | Node::Call(_) => {
                self.error(format!("{} {name} used as a type", node.kind_label()));
                None
            }
        }
    }

    fn record(&mut self, r: &RecordNode) -> Option<TypeRef> {
        let recursive = self
            .in_progress
            .iter()
            .any(|(n, depth)| *n == r.name && *depth == self.ptr_depth);
        if recursive {
            let kind = if r.is_union { "union" } else { "struct" };
            self.error(format!("recursive {kind} {}", r.name));
            return None;
        }
        if let Some(&ty) = self.named.get(&r.name) {
            return Some(ty);
        }
        let slot = self.cat.push_type(TypeDescriptor::Record {
            name: r.name.clone(),
            fields: Vec::new(),
            packed: r.packed,
            size: None,
        });
        self.named.insert(r.name.clone(), slot);
        self.in_progress.push((r.name.clone(), self.ptr_depth));

        let mut fields = Vec::with_capacity(r.fields.len());
        let mut ok = true;
        for def in &r.fields {
            match self.field(def, &r.fields) {
                Some(f) => fields.push(f),
                None => ok = false,
            }
        }
        self.in_progress.pop();
        if !ok {
            return None;
        }

        let desc = if r.is_union {
            self.finish_union(r, fields)?
        } else {
            self.finish_struct(r, fields)?
        };
        self.cat.set_type(slot, desc);
        Some(slot)
    }

    fn finish_union(&mut self, r: &RecordNode, fields: Vec<Field>) -> Option<TypeDescriptor> {
        if fields.is_empty() {
            self.error(format!("union {} has no fields", r.name));
            return None;
        }
        let sizes: Vec<Option<u64>> = fields.iter().map(|f| self.cat.size_of(f.ty)).collect();
        let size = if r.varlen {
            None
        } else if let Some(limit) = r.size {
            for (f, size) in fields.iter().zip(&sizes) {
                if !size.is_some_and(|s| s <= limit) {
                    self.error(format!(
                        "union {} field {} does not fit size {limit}",
                        r.name, f.name
                    ));
                    return None;
                }
            }
            Some(limit)
        } else if sizes.iter().any(Option::is_none) {
            None
        } else {
            sizes.iter().flatten().copied().max()
        };
        Some(TypeDescriptor::Union {
            name: r.name.clone(),
            fields,
            size,
        })
    }

    fn finish_struct(&mut self, r: &RecordNode, fields: Vec<Field>) -> Option<TypeDescriptor> {
        let mut laid = Vec::with_capacity(fields.len());
        let mut offset = 0u64;
        let mut end = 0u64;
        let mut varlen = false;
        let mut pads = 0usize;
        let mut align = 1u64;

        for field in fields {
            if field.overlay {
                offset = 0;
            }
            if !r.packed {
                let a = self.cat.align_of(field.ty);
                align = align.max(a);
                let skew = offset % a;
                if skew != 0 && !varlen {
                    let pad = a - skew;
                    laid.push(self.padding(&mut pads, pad));
                    offset += pad;
                }
            }
            match self.cat.size_of(field.ty) {
                Some(size) => offset = offset.saturating_add(size),
                None => varlen = true,
            }
            end = end.max(offset);
            laid.push(field);
        }

        if !r.packed && !varlen {
            let skew = end % align;
            if skew != 0 {
                let pad = align - skew;
                laid.push(self.padding(&mut pads, pad));
                end += pad;
            }
        }

        let size = match (r.size, varlen) {
            (Some(_), true) => {
                self.error(format!("varlen struct {} has size attribute", r.name));
                return None;
            }
            (Some(limit), false) if end > limit => {
                self.error(format!(
                    "struct {} has size {end} larger than size attribute {limit}",
                    r.name
                ));
                return None;
            }
            (Some(limit), false) => {
                if end < limit {
                    laid.push(self.padding(&mut pads, limit - end));
                }
                Some(limit)
            }
            (None, true) => None,
            (None, false) => Some(end),
        };
        Some(TypeDescriptor::Record {
            name: r.name.clone(),
            fields: laid,
            packed: r.packed,
            size,
        })
    }

    fn padding(&mut self, count: &mut usize, n: u64) -> Field {
        let ty = self.cat.push_type(TypeDescriptor::Buffer {
            kind: BufferKind::Ranged { min: n, max: n },
            size: Some(n),
        });
        *count += 1;
        Field::new(format!("{PADDING_PREFIX}{count}"), ty)
    }

    fn resource(&mut self, r: &ResourceNode) -> Option<TypeRef> {
        if let Some(&ty) = self.named.get(&r.name) {
            return Some(ty);
        }
        let (size, mut kinds, inherited) = self.resource_base(r, 0)?;
        kinds.push(r.name.clone());
        let special_values = if r.values.is_empty() {
            inherited
        } else {
            r.values.clone()
        };
        let ty = self.cat.push_type(TypeDescriptor::Resource {
            name: r.name.clone(),
            kinds,
            special_values,
            size,
        });
        self.named.insert(r.name.clone(), ty);
        Some(ty)
    }

    /// Width, ancestor kinds and inherited sentinel values of a resource
    fn resource_base(
        &mut self,
        r: &ResourceNode,
        depth: usize,
    ) -> Option<(u64, Vec<String>, Vec<u64>)> {
        let Some(base) = r.base.name() else {
            self.error(format!("bad base for resource {}", r.name));
            return None;
        };
        if let Some(size) = int_width(base) {
            return Some((size, Vec::new(), Vec::new()));
        }
        if depth > self.nodes.len() {
            self.error(format!("recursive resource {}", r.name));
            return None;
        }
        let parent = match self.nodes.get(base) {
            Some(&(Node::Resource(parent), _)) => Some(parent),
            _ => None,
        };
        match parent {
            Some(parent) => {
                self.used.insert(base.to_string());
                let (size, mut kinds, inherited) = self.resource_base(parent, depth + 1)?;
                kinds.push(parent.name.clone());
                let values = if parent.values.is_empty() {
                    inherited
                } else {
                    parent.values.clone()
                };
                Some((size, kinds, values))
            }
            None => {
                self.error(format!("bad base {base} for resource {}", r.name));
                None
            }
        }
    }
}

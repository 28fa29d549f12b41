//! Compiled types back to surface syntax.
//!
//! Inference observes bytes that landed in a runtime type and proposes that
//! type for the input field they came from. Scalars need a known width
//! since the span length decides `intN`; composite runtime types that the
//! working document cannot name are not proposed.

use crate::catalogue::Catalogue;
use crate::document::{Document, FieldDef, Node, RecordNode, StrFlagsNode, TypeExpr};
use crate::types::{BufferKind, IntKind, TypeDescriptor, TypeRef};

/// Surface type for `ty` occupying `size` bytes, adding helper nodes to
/// `doc` when the type needs them
///
/// Returns `None` when the type cannot be expressed at that size.
pub fn decompile(
    cat: &Catalogue,
    ty: TypeRef,
    size: Option<u64>,
    doc: &mut Document,
) -> Option<TypeExpr> {
    let desc = cat.get(ty)?;
    match desc {
        TypeDescriptor::Resource { .. }
        | TypeDescriptor::Const { .. }
        | TypeDescriptor::Int { .. }
        | TypeDescriptor::Flags { .. }
        | TypeDescriptor::Len { .. } => scalar(desc, size?, doc),
        TypeDescriptor::Buffer { kind, .. } => buffer(kind, size, doc),
        TypeDescriptor::Record { name, .. } => Some(TypeExpr::ident(name.clone())),
        TypeDescriptor::Pointer { .. }
        | TypeDescriptor::Union { .. }
        | TypeDescriptor::Array { .. }
        | TypeDescriptor::Vma
        | TypeDescriptor::Proc { .. } => None,
    }
}

fn scalar(desc: &TypeDescriptor, size: u64, doc: &mut Document) -> Option<TypeExpr> {
    if !matches!(size, 1 | 2 | 4 | 8) {
        return None;
    }
    let width = TypeExpr::int_of_size(size);
    let expr = match desc {
        TypeDescriptor::Resource { name, .. } => TypeExpr::ident(name.clone()),
        TypeDescriptor::Const { value, .. } => {
            TypeExpr::call("const", vec![TypeExpr::Int(*value), width])
        }
        TypeDescriptor::Int { kind, .. } => match kind {
            IntKind::Plain => width,
            IntKind::Range { begin, end, align } => {
                let mut args = vec![TypeExpr::Range(*begin, *end)];
                if *align != 0 {
                    args.push(TypeExpr::Int(*align));
                }
                TypeExpr::call(width.name()?.to_string(), args)
            }
        },
        TypeDescriptor::Flags { name, .. } => {
            TypeExpr::call("flags", vec![TypeExpr::ident(name.clone()), width])
        }
        TypeDescriptor::Len { path, bytes, .. } => {
            let target = path.first().cloned().unwrap_or_else(|| "payload".to_string());
            let kind = if *bytes { "bytesize" } else { "len" };
            let name = doc.make_unique_name();
            let record = RecordNode::new_struct(name.clone())
                .with_field(FieldDef::new(
                    "field_0",
                    TypeExpr::call(kind, vec![TypeExpr::ident(target.clone()), width]),
                ))
                .with_field(FieldDef::new(target, TypeExpr::ident("void")))
                .packed()
                .sized(Some(size));
            doc.add(Node::Record(record)).ok()?;
            TypeExpr::ident(name)
        }
        _ => return None,
    };
    Some(expr)
}

fn buffer(kind: &BufferKind, size: Option<u64>, doc: &mut Document) -> Option<TypeExpr> {
    let bytes = |args: Vec<TypeExpr>| {
        let mut all = vec![TypeExpr::ident("int8")];
        all.extend(args);
        TypeExpr::call("array", all)
    };
    match kind {
        BufferKind::Random => Some(bytes(size.map(TypeExpr::Int).into_iter().collect())),
        BufferKind::Ranged { min, max } => Some(match size {
            Some(n) => bytes(vec![TypeExpr::Int(n)]),
            None if min == max => bytes(vec![TypeExpr::Int(*min)]),
            None => bytes(vec![TypeExpr::Range(*min, *max)]),
        }),
        BufferKind::String { values, noz } => {
            let keyword = if *noz { "stringnoz" } else { "string" };
            if values.is_empty() {
                return size.is_none().then(|| TypeExpr::ident(keyword));
            }
            let literals: Vec<Vec<u8>> = values
                .iter()
                .map(|v| {
                    let end = v.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                    v[..end].to_vec()
                })
                .collect();
            let terminator = u64::from(!*noz);
            if let Some(n) = size {
                if literals.iter().any(|l| l.len() as u64 + terminator > n) {
                    return None;
                }
            }
            let name = doc.make_unique_name();
            doc.add(Node::StrFlags(StrFlagsNode {
                name: name.clone(),
                values: literals,
            }))
            .ok()?;
            let mut args = vec![TypeExpr::ident(name)];
            args.extend(size.map(TypeExpr::Int));
            Some(TypeExpr::call(keyword, args))
        }
        BufferKind::Filename { noz } => {
            let keyword = if *noz { "stringnoz" } else { "string" };
            Some(TypeExpr::call(keyword, vec![TypeExpr::ident("filename")]))
        }
        BufferKind::Glob { pattern } => Some(TypeExpr::call(
            "glob",
            vec![TypeExpr::Str(pattern.as_bytes().to_vec())],
        )),
        BufferKind::Text { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{GrammarCompiler, SurfaceCompiler};
    use crate::types::ArrayLen;

    fn cat_with(descs: Vec<TypeDescriptor>) -> (Catalogue, Vec<TypeRef>) {
        let mut cat = Catalogue::new();
        let refs = descs.into_iter().map(|d| cat.push_type(d)).collect();
        (cat, refs)
    }

    #[test]
    fn test_scalars_need_known_width() {
        let (cat, refs) = cat_with(vec![
            TypeDescriptor::Int {
                size: 4,
                kind: IntKind::Plain,
            },
            TypeDescriptor::Const { value: 7, size: 2 },
            TypeDescriptor::Int {
                size: 8,
                kind: IntKind::Range {
                    begin: 0,
                    end: 16,
                    align: 4,
                },
            },
        ]);
        let mut doc = Document::new("h");
        assert_eq!(decompile(&cat, refs[0], None, &mut doc), None);
        assert_eq!(decompile(&cat, refs[0], Some(3), &mut doc), None);
        assert_eq!(
            decompile(&cat, refs[0], Some(4), &mut doc),
            Some(TypeExpr::ident("int32"))
        );
        assert_eq!(
            decompile(&cat, refs[1], Some(2), &mut doc).map(|t| t.to_string()),
            Some("const[7, int16]".to_string())
        );
        assert_eq!(
            decompile(&cat, refs[2], Some(8), &mut doc).map(|t| t.to_string()),
            Some("int64[0:0x10, 4]".to_string())
        );
        assert!(doc.is_empty());
    }

    #[test]
    fn test_strings_get_helper_node() {
        let (cat, refs) = cat_with(vec![TypeDescriptor::Buffer {
            kind: BufferKind::String {
                values: vec![b"ab\0\0".to_vec(), b"c\0\0\0".to_vec()],
                noz: false,
            },
            size: Some(4),
        }]);
        let mut doc = Document::new("h");
        let expr = decompile(&cat, refs[0], Some(4), &mut doc).unwrap();
        assert_eq!(expr.to_string(), "string[h_t1, 4]");
        match doc.get("h_t1") {
            Some(Node::StrFlags(s)) => assert_eq!(s.values, vec![b"ab".to_vec(), b"c".to_vec()]),
            other => panic!("unexpected {other:?}"),
        }
        let mut small = Document::new("h");
        assert_eq!(decompile(&cat, refs[0], Some(2), &mut small), None);
    }

    #[test]
    fn test_len_wrapper_compiles() {
        let (cat, refs) = cat_with(vec![TypeDescriptor::Len {
            path: vec!["data".to_string()],
            size: 4,
            bytes: false,
        }]);
        let mut doc = Document::new("h");
        let expr = decompile(&cat, refs[0], Some(4), &mut doc).unwrap();
        let mut call = crate::document::CallNode::new("syz_c");
        call.args.push(FieldDef::new(
            "a",
            TypeExpr::call("ptr", vec![TypeExpr::ident("in"), expr]),
        ));
        doc.add(Node::Call(call)).unwrap();
        let compiled = SurfaceCompiler::new().compile(&[], &doc).unwrap();
        let (_, sig) = compiled.signature_by_name("syz_c").unwrap();
        let Some(TypeDescriptor::Pointer { elem, .. }) = compiled.get(sig.args[0].ty) else {
            panic!("expected pointer");
        };
        assert_eq!(compiled.size_of(*elem), Some(4));
    }

    #[test]
    fn test_unexpressible() {
        let (cat, refs) = cat_with(vec![
            TypeDescriptor::Vma,
            TypeDescriptor::Buffer {
                kind: BufferKind::Text {
                    arch: "x86_64".to_string(),
                },
                size: None,
            },
        ]);
        let elem = refs[0];
        let mut cat = cat;
        let arr = cat.push_type(TypeDescriptor::Array {
            elem,
            len: ArrayLen::Variable,
        });
        let mut doc = Document::new("h");
        assert_eq!(decompile(&cat, refs[0], Some(8), &mut doc), None);
        assert_eq!(decompile(&cat, refs[1], None, &mut doc), None);
        assert_eq!(decompile(&cat, arr, None, &mut doc), None);
    }

    #[test]
    fn test_buffers() {
        let (cat, refs) = cat_with(vec![
            TypeDescriptor::Buffer {
                kind: BufferKind::Random,
                size: None,
            },
            TypeDescriptor::Buffer {
                kind: BufferKind::Ranged { min: 2, max: 6 },
                size: None,
            },
            TypeDescriptor::Buffer {
                kind: BufferKind::Glob {
                    pattern: "/dev/*".to_string(),
                },
                size: None,
            },
        ]);
        let mut doc = Document::new("h");
        let show = |r, size, doc: &mut Document| decompile(&cat, r, size, doc).map(|t| t.to_string());
        assert_eq!(show(refs[0], None, &mut doc), Some("array[int8]".to_string()));
        assert_eq!(show(refs[0], Some(4), &mut doc), Some("array[int8, 4]".to_string()));
        assert_eq!(show(refs[1], None, &mut doc), Some("array[int8, 2:6]".to_string()));
        assert_eq!(show(refs[2], None, &mut doc), Some("glob[\"/dev/*\"]".to_string()));
    }
}

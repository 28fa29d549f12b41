//! Lowering of a field specification into a first grammar document.
//!
//! Every record becomes a packed struct (or a `varlen` union) named
//! `{id}_{record}`. Fields whose content is unknown become unions of
//! placeholder alternatives that inference later replaces; fields whose
//! content is already known are marked resolved.

use crate::error::FieldSpecError;
use crate::model::{FieldSpec, NormalField, SpecField, SpecRecord, SpecSize};
use revgram_grammar::{
    Document, FieldDef, Node, RecordNode, StrFlagsNode, TypeExpr, int_width,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Record holding the whole harness input
pub const INPUT_NAME: &str = "INPUT";
/// Record of one dispatched command
pub const COMMAND_NAME: &str = "COMMAND";
/// Field holding the number of commands
pub const COMMAND_COUNT_NAME: &str = "COMMAND_CNT";

/// Number of literals in a synthesized string enumeration
const STRING_CANDIDATES: usize = 8;

/// Document name for a specification name
#[must_use]
pub fn scoped_name(id: &str, name: &str) -> String {
    format!("{id}_{name}")
}

/// Lower `spec` into a document whose names are prefixed with `id`
///
/// # Errors
///
/// Returns error on unsupported field types, fixed values without an
/// integer width, and length dependencies that cannot be resolved
pub fn lower(spec: &FieldSpec, id: &str) -> Result<Document, FieldSpecError> {
    let mut doc = Document::new(id);
    for record in &spec.records {
        for field in &record.fields {
            let target = match field {
                SpecField::Ref(name) => Some(name),
                SpecField::Array { item, .. } => Some(item),
                SpecField::Normal(_) => None,
            };
            if let Some(name) = target {
                if spec.record(name).is_none() {
                    return Err(FieldSpecError::UndefinedRecord { name: name.clone() });
                }
            }
        }
        lower_record(&mut doc, record, id)?;
    }
    doc.finalize()?;
    debug!(id, nodes = doc.len(), "lowered field specification");
    Ok(doc)
}

fn lower_record(doc: &mut Document, record: &SpecRecord, id: &str) -> Result<(), FieldSpecError> {
    let mut fields: Vec<FieldDef> = Vec::with_capacity(record.fields.len());
    let mut name_counts: BTreeMap<String, usize> = BTreeMap::new();
    // size field name -> field whose length it holds
    let mut len_deps: BTreeMap<String, String> = BTreeMap::new();

    for field in &record.fields {
        let (mut def, named_size) = match field {
            SpecField::Normal(n) => lower_normal(doc, n, id)?,
            SpecField::Array { item, count } => lower_array(item, count.as_ref(), id),
            SpecField::Ref(name) => {
                let name = scoped_name(id, name);
                (FieldDef::new(name.clone(), TypeExpr::ident(name)).resolved(), None)
            }
        };
        let count = name_counts.entry(def.name.clone()).or_default();
        *count += 1;
        if *count > 1 {
            def.name = format!("{}_{count}", def.name);
        }
        if let Some(size_name) = named_size {
            if len_deps.insert(size_name.clone(), def.name.clone()).is_some() {
                return Err(FieldSpecError::SharedLength { size: size_name });
            }
        }
        fields.push(def);
    }

    for def in &mut fields {
        let Some(target) = len_deps.remove(&def.name) else {
            continue;
        };
        let Some(width) = length_width(doc, &def.ty) else {
            return Err(FieldSpecError::UnresolvedLength {
                target,
                size: def.name.clone(),
            });
        };
        let old = std::mem::replace(
            &mut def.ty,
            TypeExpr::call(
                "len",
                vec![TypeExpr::ident(target), TypeExpr::int_of_size(width)],
            ),
        );
        if let Some(name) = old.name() {
            doc.remove_tree(name);
        }
        def.resolved = true;
    }
    if let Some((size, target)) = len_deps.into_iter().next() {
        return Err(FieldSpecError::UnresolvedLength { target, size });
    }

    let name = scoped_name(id, &record.name);
    let node = if record.is_union {
        RecordNode::new_union(name).sized(None)
    } else {
        RecordNode::new_struct(name).packed()
    };
    doc.add(Node::Record(RecordNode { fields, ..node }))?;
    Ok(())
}

/// Integer width of a size field: the size of its placeholder union, or
/// the width of its integer type
fn length_width(doc: &Document, ty: &TypeExpr) -> Option<u64> {
    let name = ty.name()?;
    let width = match doc.record(name) {
        Some(r) if r.is_union => r.size?,
        Some(_) => return None,
        None => int_width(name)?,
    };
    matches!(width, 1 | 2 | 4 | 8).then_some(width)
}

fn lower_normal(
    doc: &mut Document,
    field: &NormalField,
    id: &str,
) -> Result<(FieldDef, Option<String>), FieldSpecError> {
    let name = scoped_name(id, &field.name);
    let (size, named_size) = match &field.size {
        Some(SpecSize::Fixed(n)) => (Some(*n), None),
        Some(SpecSize::Named(other)) => (None, Some(scoped_name(id, other))),
        None => (None, None),
    };

    if let Some(value) = field.value {
        let Some(width) = size.filter(|s| matches!(s, 1 | 2 | 4 | 8)) else {
            return Err(FieldSpecError::ValueSize {
                field: field.name.clone(),
            });
        };
        let ty = TypeExpr::call(
            format!("int{}", width * 8),
            vec![TypeExpr::Int(value)],
        );
        return Ok((FieldDef::new(name, ty).resolved(), named_size));
    }

    let typed = match field.ty.as_deref() {
        None => false,
        Some("string") => true,
        Some(other) => {
            return Err(FieldSpecError::UnsupportedType {
                field: field.name.clone(),
                ty: other.to_string(),
            });
        }
    };

    let mut alternatives: Vec<TypeExpr> = Vec::new();
    let mut random: Vec<bool> = Vec::new();
    let mut push = |ty: TypeExpr, is_random: bool| {
        alternatives.push(ty);
        random.push(is_random);
    };
    if !typed || size.is_some() {
        let mut args = vec![TypeExpr::ident("int8")];
        args.extend(size.map(TypeExpr::Int));
        push(TypeExpr::call("array", args), true);
    }
    if size.is_none() {
        push(TypeExpr::ident("string"), true);
    }

    // A single byte is all terminator.
    if size.is_none_or(|s| s >= 2) {
        let flags = doc.make_unique_name();
        doc.add(Node::StrFlags(StrFlagsNode {
            name: flags.clone(),
            values: string_candidates(&field.name, size),
        }))?;
        let mut args = vec![TypeExpr::ident(flags)];
        args.extend(size.map(TypeExpr::Int));
        push(TypeExpr::call("string", args), false);
    }

    let union_name = doc.make_unique_name();
    let mut union = RecordNode::new_union(union_name.clone()).sized(size);
    for (i, (ty, is_random)) in alternatives.into_iter().zip(random).enumerate() {
        let mut alt = FieldDef::new(format!("field_{i}"), ty);
        alt.random = is_random;
        union.fields.push(alt);
    }
    doc.add(Node::Record(union))?;

    let mut def = FieldDef::new(name, TypeExpr::ident(union_name));
    def.resolved = typed;
    Ok((def, named_size))
}

/// `{i}{name}` literals, the name cut to leave room for the digit and
/// the terminator
fn string_candidates(name: &str, size: Option<u64>) -> Vec<Vec<u8>> {
    let keep = size.map_or(name.len(), |s| {
        usize::try_from(s.saturating_sub(2)).unwrap_or(usize::MAX).min(name.len())
    });
    let stem = &name.as_bytes()[..keep];
    (0..STRING_CANDIDATES)
        .map(|i| {
            let mut v = i.to_string().into_bytes();
            v.extend_from_slice(stem);
            v
        })
        .collect()
}

fn lower_array(item: &str, count: Option<&SpecSize>, id: &str) -> (FieldDef, Option<String>) {
    let name = scoped_name(id, item);
    let mut args = vec![TypeExpr::ident(name.clone())];
    let named = match count {
        Some(SpecSize::Fixed(n)) => {
            args.push(TypeExpr::Int(*n));
            None
        }
        Some(SpecSize::Named(other)) => Some(scoped_name(id, other)),
        None => None,
    };
    let def = FieldDef::new(name, TypeExpr::call("array", args)).resolved();
    (def, named)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use revgram_grammar::{
        CallNode, Dir, GrammarCompiler, SurfaceCompiler, TypeDescriptor,
    };

    fn lowered(text: &str) -> Document {
        lower(&parse(text).unwrap(), "h").unwrap()
    }

    /// Attach the harness operation so every node is reachable
    fn with_harness(mut doc: Document) -> Document {
        let input = scoped_name("h", INPUT_NAME);
        let mut call = CallNode::new(format!("syz_harness${input}"));
        call.args.push(FieldDef::new(
            "buf",
            TypeExpr::call("ptr", vec![TypeExpr::ident("in"), TypeExpr::ident(input)]),
        ));
        call.args.push(FieldDef::new(
            "len",
            TypeExpr::call("bytesize", vec![TypeExpr::ident("buf")]),
        ));
        doc.add(Node::Call(call)).unwrap();
        doc
    }

    #[test]
    fn test_sized_string_field() {
        let doc = lowered("INPUT ::= name{size: 4, type: string}\n");
        let input = doc.record("h_INPUT").unwrap();
        assert!(input.packed);
        let field = &input.fields[0];
        assert_eq!(field.name, "h_name");
        assert!(field.resolved);

        let union = doc.record(field.ty.name().unwrap()).unwrap();
        assert!(union.is_union);
        assert_eq!(union.size, Some(4));
        assert_eq!(union.fields.len(), 2);
        assert_eq!(union.fields[0].ty.to_string(), "array[int8, 4]");
        assert!(union.fields[0].random);
        assert!(!union.fields[1].random);

        let flags = union.fields[1].ty.args()[0].name().unwrap();
        match doc.get(flags) {
            Some(Node::StrFlags(s)) => {
                assert_eq!(s.values.len(), 8);
                assert_eq!(s.values[0], b"0na".to_vec());
                assert_eq!(s.values[7], b"7na".to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }

        let cat = SurfaceCompiler::new().compile(&[], &with_harness(doc)).unwrap();
        let (_, sig) = cat.signature_by_name("syz_harness$h_INPUT").unwrap();
        let Some(TypeDescriptor::Pointer { dir, elem }) = cat.get(sig.args[0].ty) else {
            panic!("expected pointer");
        };
        assert_eq!(*dir, Dir::In);
        assert_eq!(cat.size_of(*elem), Some(4));
    }

    #[test]
    fn test_untyped_fields_stay_unresolved() {
        let doc = lowered("INPUT ::= seconds{size: 4}\n          blob{}\n");
        let input = doc.record("h_INPUT").unwrap();
        assert!(input.fields.iter().all(|f| !f.resolved));
        let blob = doc.record(input.fields[1].ty.name().unwrap()).unwrap();
        assert!(blob.varlen);
        let shapes: Vec<String> = blob.fields.iter().map(|f| f.ty.to_string()).collect();
        assert_eq!(shapes[0], "array[int8]");
        assert_eq!(shapes[1], "string");
        assert!(shapes[2].starts_with("string[h_t"));
        assert!(SurfaceCompiler::new().compile(&[], &with_harness(doc)).is_ok());
    }

    #[test]
    fn test_single_byte_has_no_strings() {
        let doc = lowered("INPUT ::= b{size: 1}\n");
        let input = doc.record("h_INPUT").unwrap();
        let union = doc.record(input.fields[0].ty.name().unwrap()).unwrap();
        assert_eq!(union.fields.len(), 1);
    }

    #[test]
    fn test_values_and_duplicates() {
        let doc = lowered(
            "INPUT ::= magic{size: 4, value: 7}\n          magic{size: 2, value: 1}\n",
        );
        let input = doc.record("h_INPUT").unwrap();
        assert_eq!(input.fields[0].ty.to_string(), "int32[7]");
        assert_eq!(input.fields[1].name, "h_magic_2");
        assert!(input.fields.iter().all(|f| f.resolved));

        let err = lower(&parse("INPUT ::= v{size: 3, value: 1}\n").unwrap(), "h");
        assert!(matches!(err, Err(FieldSpecError::ValueSize { .. })));
        let err = lower(&parse("INPUT ::= v{type: blob}\n").unwrap(), "h");
        assert!(matches!(err, Err(FieldSpecError::UnsupportedType { .. })));
    }

    #[test]
    fn test_command_array_with_named_count() {
        let doc = lowered(
            "INPUT ::= COMMAND_CNT{size: 4}
          COMMAND[COMMAND_CNT]

COMMAND ::= op{size: 4, value: 1}
          | data{}
",
        );
        let input = doc.record("h_INPUT").unwrap();
        assert_eq!(input.fields[0].name, "h_COMMAND_CNT");
        assert_eq!(
            input.fields[0].ty.to_string(),
            "len[h_COMMAND, int32]"
        );
        assert!(input.fields[0].resolved);
        assert_eq!(input.fields[1].ty.to_string(), "array[h_COMMAND]");

        let command = doc.record("h_COMMAND").unwrap();
        assert!(command.is_union && command.varlen);

        // The count's placeholder union and strings are gone.
        let leftovers = doc
            .nodes()
            .filter(|n| matches!(n, Node::StrFlags(s) if s.values[0].ends_with(b"CO")))
            .count();
        assert_eq!(leftovers, 0);
        assert!(SurfaceCompiler::new().compile(&[], &with_harness(doc)).is_ok());
    }

    #[test]
    fn test_unresolved_length() {
        let err = lower(&parse("INPUT ::= A[missing]\nA ::= x{size: 1}\n").unwrap(), "h");
        assert!(matches!(err, Err(FieldSpecError::UnresolvedLength { .. })));
        let err = lower(&parse("INPUT ::= B\n").unwrap(), "h");
        assert!(matches!(err, Err(FieldSpecError::UndefinedRecord { .. })));
    }
}

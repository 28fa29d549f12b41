//! Harness shape and the document edits that depend on it.
//!
//! A harness either decodes its whole input as one record (base shape) or
//! reads a count followed by that many dispatched commands (command
//! shape). The command shape is recognised from the input record: a
//! `{id}_COMMAND` array field whose length is held by a `{id}_COMMAND_CNT`
//! field.

use revgram_fieldspec::{COMMAND_COUNT_NAME, COMMAND_NAME, INPUT_NAME, scoped_name};
use revgram_grammar::{
    CallNode, Document, DocumentError, FieldDef, Node, RecordNode, TypeExpr, int_width,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the pseudo operation that feeds a blob to the harness
pub const HARNESS_CALL: &str = "syz_harness";

const FALLBACK_NAME: &str = "fallback";

/// How the harness consumes its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarnessShape {
    /// One input record
    Base,
    /// A counted array of commands
    Command,
}

impl HarnessShape {
    /// Number used in the persisted operation name
    #[must_use]
    pub const fn type_number(self) -> u8 {
        match self {
            Self::Base => 1,
            Self::Command => 2,
        }
    }
}

impl std::fmt::Display for HarnessShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => f.write_str("base"),
            Self::Command => f.write_str("command"),
        }
    }
}

/// Well-known node names of one harness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessNames {
    /// Harness id
    pub id: String,
    /// Input record
    pub input: String,
    /// Command field and record
    pub command: String,
    /// Command count field
    pub command_count: String,
}

impl HarnessNames {
    /// Names for harness `id`
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            input: scoped_name(id, INPUT_NAME),
            command: scoped_name(id, COMMAND_NAME),
            command_count: scoped_name(id, COMMAND_COUNT_NAME),
        }
    }

    /// Name of the pseudo operation over the input record
    #[must_use]
    pub fn input_call(&self) -> String {
        format!("{HARNESS_CALL}${}", self.input)
    }
}

/// `syz_harness${target}(buf ptr[in, target], len bytesize[buf])`
#[must_use]
pub fn harness_call(prefix: &str, target: &str) -> CallNode {
    let mut call = CallNode::new(format!("{prefix}${target}"));
    call.args.push(FieldDef::new(
        "buf",
        TypeExpr::call("ptr", vec![TypeExpr::ident("in"), TypeExpr::ident(target)]),
    ));
    call.args.push(FieldDef::new(
        "len",
        TypeExpr::call("bytesize", vec![TypeExpr::ident("buf")]),
    ));
    call
}

/// Recognise the harness shape from the input record
#[must_use]
pub fn detect_shape(doc: &Document, names: &HarnessNames) -> HarnessShape {
    let Some(input) = doc.record(&names.input).filter(|r| !r.is_union) else {
        return HarnessShape::Base;
    };
    let has = |field: &str, ty: &str| {
        input
            .field(field)
            .is_some_and(|f| f.ty.name() == Some(ty))
    };
    if has(&names.command, "array") && has(&names.command_count, "len") {
        HarnessShape::Command
    } else {
        HarnessShape::Base
    }
}

/// Give every command its own record
///
/// A command record whose fields are not all plain references to other
/// records holds one command spelled out inline. It is moved to a fresh
/// name and the command record becomes a single reference to it.
///
/// Returns whether the document changed.
///
/// # Errors
///
/// Returns error if the document bookkeeping fails
pub fn unflatten_commands(
    doc: &mut Document,
    names: &HarnessNames,
    shape: HarnessShape,
) -> Result<bool, DocumentError> {
    if shape != HarnessShape::Command {
        return Ok(false);
    }
    let Some(commands) = doc.record(&names.command) else {
        return Ok(false);
    };
    let flattened = commands
        .fields
        .iter()
        .any(|f| f.ty.name() != Some(f.name.as_str()) || !f.ty.args().is_empty());
    if !flattened {
        return Ok(false);
    }
    let moved = doc.make_unique_name();
    doc.rename(&names.command, &moved)?;
    let wrapper = RecordNode::new_struct(names.command.clone())
        .with_field(FieldDef::new(moved.clone(), TypeExpr::ident(moved.clone())));
    doc.add(Node::Record(wrapper))?;
    debug!(command = %names.command, moved = %moved, "unflattened command record");
    Ok(true)
}

/// Copy of `doc` whose samples carry exactly one command
#[must_use]
pub fn limit_to_single_command(
    doc: &Document,
    names: &HarnessNames,
    shape: HarnessShape,
) -> Document {
    let mut limited = doc.clone();
    if shape != HarnessShape::Command {
        return limited;
    }
    let Some(input) = limited.record_mut(&names.input) else {
        return limited;
    };
    for field in &mut input.fields {
        if field.name == names.command {
            if let TypeExpr::Ident { args, .. } = &mut field.ty {
                args.truncate(1);
                args.push(TypeExpr::Int(1));
            }
        } else if field.name == names.command_count {
            let width = field
                .ty
                .args()
                .last()
                .and_then(TypeExpr::name)
                .and_then(int_width)
                .unwrap_or(8);
            field.ty = TypeExpr::call(format!("int{}", width * 8), vec![TypeExpr::Int(1)]);
        }
    }
    limited
}

/// Put the command count and array types of `original` back into `doc`
pub fn restore_command_fields(doc: &mut Document, original: &Document, names: &HarnessNames) {
    let Some(source) = original.record(&names.input) else {
        return;
    };
    let Some(target) = doc.record_mut(&names.input) else {
        return;
    };
    for field in &mut target.fields {
        if field.name != names.command && field.name != names.command_count {
            continue;
        }
        if let Some(orig) = source.field(&field.name) {
            field.ty = orig.ty.clone();
        }
    }
}

/// Every field of every record the harness consumes is resolved
#[must_use]
pub fn is_done(doc: &Document, names: &HarnessNames, shape: HarnessShape) -> bool {
    let all_resolved = |r: &RecordNode| {
        let open: Vec<&str> = r
            .fields
            .iter()
            .filter(|f| !f.resolved)
            .map(|f| f.name.as_str())
            .collect();
        if !open.is_empty() {
            debug!(record = %r.name, fields = ?open, "record not resolved");
        }
        open.is_empty()
    };
    match shape {
        HarnessShape::Base => doc.record(&names.input).is_none_or(all_resolved),
        HarnessShape::Command => doc.record(&names.command).is_none_or(|commands| {
            commands
                .fields
                .iter()
                .filter_map(|f| doc.record(&f.name))
                .all(all_resolved)
        }),
    }
}

fn opaque_field() -> FieldDef {
    FieldDef::new(
        "field_0",
        TypeExpr::call("array", vec![TypeExpr::ident("int8")]),
    )
}

/// Minimal document treating the input as one opaque blob
///
/// For the command shape the count width is taken from `previous` when it
/// has one.
///
/// # Errors
///
/// Returns error if the document bookkeeping fails
pub fn default_document(
    names: &HarnessNames,
    shape: HarnessShape,
    previous: Option<&Document>,
) -> Result<Document, DocumentError> {
    let mut doc = Document::new(names.id.clone());
    doc.add(Node::Call(harness_call(HARNESS_CALL, &names.input)))?;
    let mut input = RecordNode::new_struct(names.input.clone());
    match shape {
        HarnessShape::Base => input.fields.push(opaque_field()),
        HarnessShape::Command => {
            let width = previous
                .and_then(|d| d.record(&names.input))
                .and_then(|r| r.fields.first())
                .filter(|f| f.name == names.command_count && f.ty.name() == Some("len"))
                .and_then(|f| {
                    f.ty.args()
                        .iter()
                        .filter_map(TypeExpr::name)
                        .find(|n| n.starts_with("int"))
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "int8".to_string());
            input.fields.push(FieldDef::new(
                names.command_count.clone(),
                TypeExpr::call(
                    "len",
                    vec![TypeExpr::ident(names.command.clone()), TypeExpr::ident(width)],
                ),
            ));
            input.fields.push(FieldDef::new(
                names.command.clone(),
                TypeExpr::call("array", vec![TypeExpr::ident(names.command.clone())]),
            ));
            let body = doc.make_unique_name();
            doc.add(Node::Record(
                RecordNode::new_struct(body.clone()).with_field(opaque_field()),
            ))?;
            doc.add(Node::Record(
                RecordNode::new_union(names.command.clone())
                    .with_field(FieldDef::new(body.clone(), TypeExpr::ident(body))),
            ))?;
        }
    }
    doc.add(Node::Record(input))?;
    Ok(doc)
}

/// Document written when reversing fails outright
///
/// # Errors
///
/// Returns error if the document bookkeeping fails
pub fn fallback_document(id: &str) -> Result<Document, DocumentError> {
    let target = scoped_name(id, FALLBACK_NAME);
    let mut doc = Document::new(id);
    let prefix = format!("{HARNESS_CALL}_type{}", HarnessShape::Base.type_number());
    doc.add(Node::Call(harness_call(&prefix, &target)))?;
    doc.add(Node::Record(
        RecordNode::new_struct(target).packed().with_field(opaque_field()),
    ))?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revgram_grammar::{GrammarCompiler, SurfaceCompiler, parse_document};

    const COMMAND_DOC: &str = "h_INPUT {
	# resolved
	h_COMMAND_CNT	len[h_COMMAND, int32]
	# resolved
	h_COMMAND	array[h_COMMAND]
} [packed]
h_COMMAND [
	opcode	int32
	body	array[int8]
] [varlen]
";

    fn with_call(mut doc: Document, names: &HarnessNames) -> Document {
        doc.add(Node::Call(harness_call(HARNESS_CALL, &names.input)))
            .unwrap();
        doc
    }

    #[test]
    fn test_detect_shape() {
        let names = HarnessNames::new("h");
        let doc = parse_document(COMMAND_DOC, "h").unwrap();
        assert_eq!(detect_shape(&doc, &names), HarnessShape::Command);
        let doc = parse_document("h_INPUT {\n\th_COMMAND\tarray[int8]\n}\n", "h").unwrap();
        assert_eq!(detect_shape(&doc, &names), HarnessShape::Base);
        assert_eq!(detect_shape(&Document::new("h"), &names), HarnessShape::Base);
    }

    #[test]
    fn test_unflatten_and_limit() {
        let names = HarnessNames::new("h");
        let mut doc = parse_document(COMMAND_DOC, "h").unwrap();
        assert!(unflatten_commands(&mut doc, &names, HarnessShape::Command).unwrap());
        let wrapper = doc.record("h_COMMAND").unwrap();
        assert!(!wrapper.is_union);
        let moved = wrapper.fields[0].name.clone();
        assert_eq!(wrapper.fields[0].ty, TypeExpr::ident(moved.clone()));
        assert!(doc.record(&moved).unwrap().is_union);
        // A second pass finds nothing to do.
        assert!(!unflatten_commands(&mut doc, &names, HarnessShape::Command).unwrap());

        let limited = limit_to_single_command(&doc, &names, HarnessShape::Command);
        let input = limited.record("h_INPUT").unwrap();
        assert_eq!(input.fields[0].ty.to_string(), "int32[1]");
        assert_eq!(input.fields[1].ty.to_string(), "array[h_COMMAND, 1]");
        SurfaceCompiler::new()
            .compile(&[], &with_call(limited.clone(), &names))
            .unwrap();

        let mut restored = limited;
        restore_command_fields(&mut restored, &doc, &names);
        assert_eq!(restored, doc);
    }

    #[test]
    fn test_is_done() {
        let names = HarnessNames::new("h");
        let base = parse_document(
            "h_INPUT {\n\t# resolved\n\ta\tint32\n\tb\tint8\n}\n",
            "h",
        )
        .unwrap();
        assert!(!is_done(&base, &names, HarnessShape::Base));
        let mut base = base;
        base.record_mut("h_INPUT").unwrap().fields[1].resolved = true;
        assert!(is_done(&base, &names, HarnessShape::Base));

        let mut doc = parse_document(COMMAND_DOC, "h").unwrap();
        unflatten_commands(&mut doc, &names, HarnessShape::Command).unwrap();
        assert!(!is_done(&doc, &names, HarnessShape::Command));
        let moved = doc.record("h_COMMAND").unwrap().fields[0].name.clone();
        for f in &mut doc.record_mut(&moved).unwrap().fields {
            f.resolved = true;
        }
        assert!(is_done(&doc, &names, HarnessShape::Command));
    }

    #[test]
    fn test_default_documents_compile() {
        let names = HarnessNames::new("h");
        let compiler = SurfaceCompiler::new();
        let base = default_document(&names, HarnessShape::Base, None).unwrap();
        compiler.compile(&[], &base).unwrap();
        assert!(!is_done(&base, &names, HarnessShape::Base));

        let previous = parse_document(COMMAND_DOC, "h").unwrap();
        let cmd = default_document(&names, HarnessShape::Command, Some(&previous)).unwrap();
        compiler.compile(&[], &cmd).unwrap();
        let input = cmd.record("h_INPUT").unwrap();
        assert_eq!(input.fields[0].ty.to_string(), "len[h_COMMAND, int32]");
        assert_eq!(detect_shape(&cmd, &names), HarnessShape::Command);

        let fresh = default_document(&names, HarnessShape::Command, None).unwrap();
        let input = fresh.record("h_INPUT").unwrap();
        assert_eq!(input.fields[0].ty.to_string(), "len[h_COMMAND, int8]");
    }

    #[test]
    fn test_fallback_document() {
        let doc = fallback_document("h").unwrap();
        let text = doc.to_string();
        assert!(text.contains(
            "syz_harness_type1$h_fallback(buf ptr[in, h_fallback], len bytesize[buf])"
        ));
        assert!(text.contains("h_fallback {"));
        assert!(text.contains("field_0\tarray[int8]"));
        SurfaceCompiler::new().compile(&[], &doc).unwrap();
    }
}

//! Recovery of documents the compiler rejects.
//!
//! Inference and lowering can leave records that no operation reaches.
//! The compiler reports them as `unused struct X` or `unused union X`.
//! Repair first tries to hook each one into the field that carries the
//! same name, which is where lowering meant it to live, and only prunes
//! what is still unreachable after that.

use revgram_grammar::{Catalogue, CompileError, Document, GrammarCompiler, Node, TypeExpr};
use tracing::{debug, info};

/// Default number of reconnection rounds
pub const DEFAULT_REPAIR_ROUNDS: usize = 10;

const UNUSED_PREFIXES: [&str; 2] = ["unused struct ", "unused union "];

/// Compile `doc`, editing it until the compiler accepts it
///
/// # Errors
///
/// Returns the last rejection when neither reconnection nor pruning
/// produce an accepted document
pub fn repair<C: GrammarCompiler>(
    compiler: &C,
    base: &[Document],
    doc: &mut Document,
    rounds: usize,
) -> Result<Catalogue, CompileError> {
    for round in 0..rounds {
        match compiler.compile(base, doc) {
            Ok(cat) => {
                if round > 0 {
                    info!(round, "document repaired");
                }
                return Ok(cat);
            }
            Err(err) => {
                for message in err.messages() {
                    if let Some(name) = UNUSED_PREFIXES
                        .iter()
                        .find_map(|p| message.strip_prefix(p))
                    {
                        connect_unused(doc, name);
                    }
                }
            }
        }
    }

    let err = match compiler.compile(base, doc) {
        Ok(cat) => return Ok(cat),
        Err(err) => err,
    };
    for message in err.messages() {
        if !message.starts_with("unused ") {
            continue;
        }
        if let Some(name) = message.split(' ').next_back() {
            let removed = doc.remove_tree(name);
            debug!(name, removed = removed.len(), "pruned unused node");
        }
    }
    let cat = compiler.compile(base, doc)?;
    info!("document repaired by pruning");
    Ok(cat)
}

/// Point every field named `name` at the node of that name
///
/// Returns the number of fields rewritten.
pub fn connect_unused(doc: &mut Document, name: &str) -> usize {
    let owners: Vec<String> = doc
        .nodes()
        .filter_map(Node::as_record)
        .filter(|r| r.fields.iter().any(|f| f.name == name))
        .map(|r| r.name.clone())
        .collect();

    let mut rewired = 0;
    for owner in owners {
        let Some(record) = doc.record_mut(&owner) else {
            continue;
        };
        let mut detached = Vec::new();
        for field in record.fields.iter_mut().filter(|f| f.name == name) {
            let mentions = field.ty.name() == Some(name)
                || field.ty.args().iter().any(|a| a.name() == Some(name));
            if mentions {
                continue;
            }
            let connected = match field.ty.name() {
                Some("array") => {
                    let mut args = vec![TypeExpr::ident(name)];
                    args.extend(
                        field
                            .ty
                            .args()
                            .iter()
                            .filter(|a| matches!(a, TypeExpr::Int(n) if *n > 0))
                            .cloned(),
                    );
                    TypeExpr::call("array", args)
                }
                _ => TypeExpr::ident(name),
            };
            detached.push(std::mem::replace(&mut field.ty, connected));
        }
        for old in &detached {
            doc.remove_type_expr(old);
        }
        if !detached.is_empty() {
            debug!(record = %owner, field = name, "connected unused node");
        }
        rewired += detached.len();
    }
    rewired
}

#[cfg(test)]
mod tests {
    use super::*;
    use revgram_grammar::{SurfaceCompiler, parse_document};

    const CALL: &str = "syz_harness$h_INPUT(buf ptr[in, h_INPUT], len bytesize[buf])\n";

    fn doc(text: &str) -> Document {
        parse_document(&format!("{text}{CALL}"), "h").unwrap()
    }

    #[test]
    fn test_reconnects_field_of_same_name() {
        let mut d = doc("h_item {
	x	int32
}
h_t1 [
	field_0	array[int8]
] [varlen]
h_INPUT {
	h_item	h_t1
} [packed]
");
        let cat = repair(&SurfaceCompiler::new(), &[], &mut d, DEFAULT_REPAIR_ROUNDS).unwrap();
        let input = d.record("h_INPUT").unwrap();
        assert_eq!(input.fields[0].ty, TypeExpr::ident("h_item"));
        assert!(!d.contains("h_t1"));
        assert!(cat.signature_by_name("syz_harness$h_INPUT").is_some());
    }

    #[test]
    fn test_reconnects_array_keeping_count() {
        let mut d = doc("h_item {
	x	int32
}
h_INPUT {
	h_item	array[int8, 3]
} [packed]
");
        repair(&SurfaceCompiler::new(), &[], &mut d, DEFAULT_REPAIR_ROUNDS).unwrap();
        let input = d.record("h_INPUT").unwrap();
        assert_eq!(input.fields[0].ty.to_string(), "array[h_item, 3]");
    }

    #[test]
    fn test_prunes_what_cannot_be_connected() {
        let mut d = doc("h_orphan {
	x	int32
}
h_INPUT {
	a	int8
} [packed]
");
        repair(&SurfaceCompiler::new(), &[], &mut d, DEFAULT_REPAIR_ROUNDS).unwrap();
        assert!(!d.contains("h_orphan"));
        assert!(d.contains("h_INPUT"));
    }

    #[test]
    fn test_unrepairable() {
        let mut d = doc("h_INPUT {
	a	no_such_type
}
");
        let err = repair(&SurfaceCompiler::new(), &[], &mut d, 2).unwrap_err();
        assert!(!err.messages().is_empty());
    }

    #[test]
    fn test_already_connected_field_is_left_alone() {
        let mut d = doc("h_item {
	x	int32
}
h_INPUT {
	h_item	h_item
} [packed]
");
        assert_eq!(connect_unused(&mut d, "h_item"), 0);
    }
}

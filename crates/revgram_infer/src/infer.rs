//! Field inference from a differential pair of runs.
//!
//! Two blobs that differ in every free byte are traced. Bytes of the first
//! blob that show up unchanged at the start of a loosely matched argument
//! in the first trace, and complemented at the same position in the second,
//! are taken to flow into that argument. The argument's runtime type then
//! becomes a candidate type for the input field that held those bytes.

use crate::error::InferError;
use crate::lcs::{Span, longest_common_substrings, trim_common};
use crate::sample::{FieldOwner, Leaf};
use revgram_grammar::{Catalogue, Document, FieldDef, Node, RecordNode, TypeExpr, TypeRef, decompile};
use revgram_match::{MatchConfig, MatchEngine, ProvenanceKey};
use revgram_trace::Trace;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One traced blob
#[derive(Debug, Clone, Copy)]
pub struct Run<'a> {
    /// Blob fed to the harness
    pub blob: &'a [u8],
    /// Where the blob's data values sit
    pub layout: &'a [Leaf],
    /// Resulting trace
    pub trace: &'a Trace,
}

/// What one inference pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceReport {
    /// Some field's candidate set changed
    pub progressed: bool,
    /// Fields given a new type, in document order of discovery
    pub resolved: Vec<FieldOwner>,
    /// Blob spans promoted to inferences
    pub spans: usize,
}

/// Candidate types collected for one field
#[derive(Default)]
struct Proposals {
    types: Vec<TypeExpr>,
    size: Option<u64>,
}

/// Infer field types from two runs and merge them into `doc`
///
/// `runs[1]` must be the complement of `runs[0]` sampled from the grammar
/// `cat` was compiled from.
///
/// # Errors
///
/// Returns error if matching hits an engine/catalogue desync or a document
/// update fails
pub fn infer_fields(
    doc: &mut Document,
    cat: &Catalogue,
    config: &MatchConfig,
    runs: [Run<'_>; 2],
) -> Result<InferenceReport, InferError> {
    let engine = MatchEngine::new(cat, config.clone());
    let strictness = engine.classify_pair(runs[0].trace, runs[1].trace);
    let outcomes = [
        engine.match_trace(runs[0].trace, &strictness)?,
        engine.match_trace(runs[1].trace, &strictness)?,
    ];

    let mut promoted: BTreeMap<Span, Vec<ProvenanceKey>> = BTreeMap::new();
    for (key, _) in outcomes[0].provenance.iter() {
        if outcomes[1].provenance.get(key).is_none() {
            continue;
        }
        let mut seen: BTreeMap<Span, u8> = BTreeMap::new();
        for (i, (run, outcome)) in runs.iter().zip(&outcomes).enumerate() {
            let Some(mem) = outcome.provenance.get(key) else {
                continue;
            };
            for cs in longest_common_substrings(run.blob, mem) {
                let cs = trim_common(cs, runs[0].blob, runs[1].blob);
                if cs.a.is_empty() || cs.b.begin != 0 {
                    continue;
                }
                *seen.entry(cs.a).or_default() |= 1 << i;
            }
        }
        for (span, bitmap) in seen {
            if bitmap == 0b11 {
                promoted.entry(span).or_default().push(*key);
            }
        }
    }

    let mut spans: Vec<Span> = promoted.keys().copied().collect();
    spans.sort_by(|x, y| y.len().cmp(&x.len()).then_with(|| x.cmp(y)));

    let mut proposals: BTreeMap<FieldOwner, Proposals> = BTreeMap::new();
    let mut report = InferenceReport::default();
    for span in spans {
        let Some(leaf) = runs[0]
            .layout
            .iter()
            .find(|l| l.span.start == span.begin && span.end <= l.span.end)
        else {
            continue;
        };
        let Some(owner) = &leaf.owner else {
            continue;
        };
        let mut types: BTreeMap<TypeRef, BTreeSet<String>> = BTreeMap::new();
        for key in &promoted[&span] {
            let sig = cat
                .signature(key.signature)
                .map_or("?", |s| s.name.as_str());
            types
                .entry(key.ty)
                .or_default()
                .insert(format!("from the {} arg of {sig}", ordinal(key.arg)));
        }
        debug!(begin = span.begin, end = span.end, types = types.len(), "promoted span");
        let Some(expr) = insert_type(doc, cat, &types, span, leaf)? else {
            continue;
        };
        report.spans += 1;
        let entry = proposals.entry(owner.clone()).or_default();
        entry.types.push(expr);
        entry.size = leaf.field_size;
    }

    for (owner, found) in proposals {
        if apply(doc, &owner, found)? {
            report.progressed = true;
            report.resolved.push(owner);
        }
    }
    info!(
        progressed = report.progressed,
        fields = report.resolved.len(),
        spans = report.spans,
        "inference pass done"
    );
    Ok(report)
}

fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

fn filler(size: Option<u64>) -> TypeExpr {
    let mut args = vec![TypeExpr::ident("int8")];
    args.extend(size.map(TypeExpr::Int));
    TypeExpr::call("array", args)
}

/// Type for the bytes of `span` within `leaf`: the candidate union, padded
/// out to the leaf with a filler when the span is shorter
fn insert_type(
    doc: &mut Document,
    cat: &Catalogue,
    types: &BTreeMap<TypeRef, BTreeSet<String>>,
    span: Span,
    leaf: &Leaf,
) -> Result<Option<TypeExpr>, InferError> {
    let size = (!leaf.varlen).then_some(span.len() as u64);
    let Some(union) = union_types(doc, cat, types, size)? else {
        return Ok(None);
    };
    let mut fields = vec![FieldDef::new("field_0", TypeExpr::ident(union))];
    let trailing = leaf.span.end.saturating_sub(span.end) as u64;
    if trailing > 0 {
        let filler = filler((!leaf.varlen).then_some(trailing));
        fields.push(FieldDef::new("field_1", filler));
    }
    if fields.len() == 1 {
        return Ok(fields.pop().map(|f| f.ty));
    }
    let name = doc.make_unique_name();
    let mut record = RecordNode::new_struct(name.clone()).packed();
    record.fields = fields;
    if !leaf.varlen {
        record.size = Some(leaf.span.len() as u64);
    }
    doc.add(Node::Record(record))?;
    Ok(Some(TypeExpr::ident(name)))
}

/// Decompile every runtime type that fits `size` and union the results
fn union_types(
    doc: &mut Document,
    cat: &Catalogue,
    types: &BTreeMap<TypeRef, BTreeSet<String>>,
    size: Option<u64>,
) -> Result<Option<String>, InferError> {
    let mut entries = Vec::with_capacity(types.len());
    for (&ty, comments) in types {
        if let Some(size) = size {
            if cat.is_varlen(ty) {
                debug!(%ty, "skipping variable length type");
                continue;
            }
            if size < cat.min_size_of(ty) {
                debug!(%ty, size, "skipping type that does not fit");
                continue;
            }
        }
        let hint = size.or_else(|| cat.size_of(ty));
        if let Some(expr) = decompile(cat, ty, hint, doc) {
            entries.push((expr, comments.iter().cloned().collect()));
        }
    }
    union_fields(doc, entries, size)
}

/// Add a union of `entries`, flattening unions they name and dropping
/// structural duplicates
fn union_fields(
    doc: &mut Document,
    entries: Vec<(TypeExpr, Vec<String>)>,
    size: Option<u64>,
) -> Result<Option<String>, InferError> {
    let mut seen = BTreeSet::new();
    let mut fields: Vec<FieldDef> = Vec::new();
    let mut dropped: Vec<TypeExpr> = Vec::new();
    let mut add = |doc: &Document, ty: TypeExpr, comments: Vec<String>| {
        if !seen.insert(doc.hash_type(&ty)) {
            dropped.push(ty);
            return;
        }
        let mut field = FieldDef::new(format!("field_{}", fields.len()), ty);
        field.comments = comments;
        fields.push(field);
    };

    for (expr, comments) in entries {
        let flatten = expr.args().is_empty()
            && expr
                .name()
                .and_then(|n| doc.record(n))
                .is_some_and(|r| r.is_union);
        if !flatten {
            add(doc, expr, comments);
            continue;
        }
        if let Some(Node::Record(existing)) = expr.name().and_then(|n| doc.remove(n)) {
            debug!(union = %existing.name, "flattening union");
            for field in existing.fields {
                add(doc, field.ty, field.comments);
            }
        }
    }
    if fields.is_empty() {
        return Ok(None);
    }

    let name = doc.make_unique_name();
    let mut union = RecordNode::new_union(name.clone()).sized(size);
    union.fields = fields;
    doc.add(Node::Record(union))?;
    for ty in &dropped {
        doc.remove_type_expr(ty);
    }
    Ok(Some(name))
}

/// Merge proposals into the owning field; true when its candidate set
/// changed
fn apply(doc: &mut Document, owner: &FieldOwner, found: Proposals) -> Result<bool, InferError> {
    let Some(original) = doc
        .record(&owner.record)
        .and_then(|r| r.field(&owner.field))
        .map(|f| f.ty.clone())
    else {
        debug!(record = %owner.record, field = %owner.field, "owner vanished");
        for ty in &found.types {
            doc.remove_type_expr(ty);
        }
        return Ok(false);
    };

    let mut before = None;
    if let Some(name) = original.name().filter(|_| original.args().is_empty()) {
        if let Some(union) = doc.record_mut(name).filter(|r| r.is_union) {
            union.fields.retain(|f| !f.random);
            before = doc.hash_node(name);
        }
    }

    let mut entries = vec![(original, Vec::new())];
    entries.extend(found.types.into_iter().map(|t| (t, Vec::new())));
    let Some(merged) = union_fields(doc, entries, found.size)? else {
        return Ok(false);
    };
    let after = doc.hash_node(&merged);

    let Some(field) = doc
        .record_mut(&owner.record)
        .and_then(|r| r.fields.iter_mut().find(|f| f.name == owner.field))
    else {
        return Ok(false);
    };
    field.ty = TypeExpr::ident(merged);
    field.resolved = true;
    Ok(before != after)
}

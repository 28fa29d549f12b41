//! Structural hashing of document nodes and type expressions.
//!
//! Two types hash equal when they describe the same layout, whatever the
//! names of the nodes involved. Union alternatives and string sets hash as
//! sorted, de-duplicated sets so member order does not matter. The
//! inference step relies on this to de-duplicate union members and to tell
//! whether a merge changed anything.

use crate::document::{Document, FieldDef, Node, RecordNode, TypeExpr};
use revgram_core::StructHasher;

const TAG_STRUCT: u64 = 0;
const TAG_UNION: u64 = 1;
const TAG_PACKED: u64 = 2;
const TAG_VARLEN: u64 = 3;
const TAG_SIZE: u64 = 4;

const TAG_IDENT: u64 = 0x10;
const TAG_INT: u64 = 0x11;
const TAG_RANGE: u64 = 0x12;
const TAG_STR: u64 = 0x13;
const TAG_CYCLE: u64 = 0x14;

impl Document {
    /// Structural hash of a named node, `None` if it does not exist
    #[must_use]
    pub fn hash_node(&self, name: &str) -> Option<u64> {
        let node = self.get(name)?;
        let mut walker = Walker {
            doc: self,
            stack: vec![name.to_string()],
        };
        Some(walker.node(node))
    }

    /// Structural hash of a type expression
    #[must_use]
    pub fn hash_type(&self, expr: &TypeExpr) -> u64 {
        Walker {
            doc: self,
            stack: Vec::new(),
        }
        .ty(expr)
    }

    /// Structural hash of a field: its type plus attributes
    #[must_use]
    pub fn hash_field(&self, field: &FieldDef) -> u64 {
        Walker {
            doc: self,
            stack: Vec::new(),
        }
        .field(field)
    }
}

struct Walker<'a> {
    doc: &'a Document,
    stack: Vec<String>,
}

impl Walker<'_> {
    fn node(&mut self, node: &Node) -> u64 {
        let mut h = StructHasher::new();
        match node {
            Node::Record(r) => return self.record(r),
            Node::StrFlags(s) => {
                let mut set: Vec<u64> = s
                    .values
                    .iter()
                    .map(|v| {
                        let mut vh = StructHasher::new();
                        vh.word(v.len() as u64);
                        for &b in v {
                            vh.word(u64::from(b));
                        }
                        vh.finish()
                    })
                    .collect();
                set.sort_unstable();
                set.dedup();
                h.word(TAG_STR);
                for v in set {
                    h.word(v);
                }
            }
            Node::Flags(f) => {
                let mut set = f.values.clone();
                set.sort_unstable();
                set.dedup();
                h.word(TAG_INT);
                for v in set {
                    h.word(v);
                }
            }
            // Resources and operations are nominal.
            Node::Resource(r) => {
                h.text(&r.name);
            }
            Node::Call(c) => {
                h.text(&c.name);
            }
        }
        h.finish()
    }

    fn record(&mut self, r: &RecordNode) -> u64 {
        let mut h = StructHasher::new();
        if r.is_union {
            h.word(TAG_UNION);
            let mut set: Vec<u64> = r.fields.iter().map(|f| self.field(f)).collect();
            set.sort_unstable();
            set.dedup();
            for v in set {
                h.word(v);
            }
        } else {
            h.word(TAG_STRUCT);
            for f in &r.fields {
                let v = self.field(f);
                h.word(v);
            }
        }
        if r.packed {
            h.word(TAG_PACKED);
        }
        if r.varlen {
            h.word(TAG_VARLEN);
        }
        if let Some(size) = r.size {
            h.word(TAG_SIZE).word(size);
        }
        h.finish()
    }

    fn field(&mut self, f: &FieldDef) -> u64 {
        let mut h = StructHasher::new();
        let ty = self.ty(&f.ty);
        h.word(ty);
        if let Some(dir) = f.dir {
            h.text(dir.as_str());
        }
        if f.overlay {
            h.text("overlay");
        }
        h.finish()
    }

    fn ty(&mut self, expr: &TypeExpr) -> u64 {
        let mut h = StructHasher::new();
        match expr {
            TypeExpr::Ident { name, args } => {
                h.word(TAG_IDENT);
                if self.stack.iter().any(|s| s == name) {
                    h.word(TAG_CYCLE).text(name);
                } else if let Some(node) = self.doc.get(name) {
                    self.stack.push(name.clone());
                    let v = self.node(node);
                    self.stack.pop();
                    h.word(v);
                } else {
                    h.text(name);
                }
                h.word(args.len() as u64);
                for arg in args {
                    let v = self.ty(arg);
                    h.word(v);
                }
            }
            TypeExpr::Int(v) => {
                h.word(TAG_INT).word(*v);
            }
            TypeExpr::Range(a, b) => {
                h.word(TAG_RANGE).word(*a).word(*b);
            }
            TypeExpr::Str(s) => {
                h.word(TAG_STR).word(s.len() as u64);
                for &b in s {
                    h.word(u64::from(b));
                }
            }
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::StrFlagsNode;

    fn union(name: &str, types: &[TypeExpr]) -> Node {
        let mut u = RecordNode::new_union(name).sized(Some(4));
        for (i, t) in types.iter().enumerate() {
            u.fields.push(FieldDef::new(format!("field_{i}"), t.clone()));
        }
        Node::Record(u)
    }

    #[test]
    fn test_names_do_not_matter() {
        let mut doc = Document::new("h");
        doc.add(union("a", &[TypeExpr::ident("int32")])).unwrap();
        doc.add(union("b", &[TypeExpr::ident("int32")])).unwrap();
        assert_eq!(doc.hash_node("a"), doc.hash_node("b"));
        assert_eq!(
            doc.hash_type(&TypeExpr::ident("a")),
            doc.hash_type(&TypeExpr::ident("b"))
        );
    }

    #[test]
    fn test_builtin_names_matter() {
        let doc = Document::new("h");
        assert_ne!(
            doc.hash_type(&TypeExpr::ident("int32")),
            doc.hash_type(&TypeExpr::ident("int64"))
        );
        assert_ne!(
            doc.hash_type(&TypeExpr::call("array", vec![TypeExpr::ident("int8"), TypeExpr::Int(4)])),
            doc.hash_type(&TypeExpr::call("array", vec![TypeExpr::ident("int8"), TypeExpr::Int(5)]))
        );
    }

    #[test]
    fn test_union_member_order_and_duplicates_ignored() {
        let mut doc = Document::new("h");
        let i = TypeExpr::ident("int32");
        let s = TypeExpr::call("array", vec![TypeExpr::ident("int8"), TypeExpr::Int(4)]);
        doc.add(union("a", &[i.clone(), s.clone()])).unwrap();
        doc.add(union("b", &[s.clone(), i.clone(), s])).unwrap();
        assert_eq!(doc.hash_node("a"), doc.hash_node("b"));
    }

    #[test]
    fn test_struct_field_order_matters() {
        let mut doc = Document::new("h");
        let mut a = RecordNode::new_struct("a");
        a.fields.push(FieldDef::new("x", TypeExpr::ident("int8")));
        a.fields.push(FieldDef::new("y", TypeExpr::ident("int32")));
        let mut b = RecordNode::new_struct("b");
        b.fields.push(FieldDef::new("x", TypeExpr::ident("int32")));
        b.fields.push(FieldDef::new("y", TypeExpr::ident("int8")));
        doc.add(Node::Record(a)).unwrap();
        doc.add(Node::Record(b)).unwrap();
        assert_ne!(doc.hash_node("a"), doc.hash_node("b"));
    }

    #[test]
    fn test_string_sets_are_unordered() {
        let mut doc = Document::new("h");
        doc.add(Node::StrFlags(StrFlagsNode {
            name: "s1".to_string(),
            values: vec![b"a".to_vec(), b"b".to_vec()],
        }))
        .unwrap();
        doc.add(Node::StrFlags(StrFlagsNode {
            name: "s2".to_string(),
            values: vec![b"b".to_vec(), b"a".to_vec()],
        }))
        .unwrap();
        assert_eq!(doc.hash_node("s1"), doc.hash_node("s2"));
    }

    #[test]
    fn test_cycles_terminate() {
        let mut doc = Document::new("h");
        let mut a = RecordNode::new_struct("a");
        a.fields.push(FieldDef::new(
            "next",
            TypeExpr::call("ptr", vec![TypeExpr::ident("in"), TypeExpr::ident("a")]),
        ));
        doc.add(Node::Record(a)).unwrap();
        assert!(doc.hash_node("a").is_some());
    }
}

//! Grammar document under construction.
//!
//! A [`Document`] is a flat arena of named nodes. Nodes refer to each other
//! only by name through [`TypeExpr`] identifiers, which keeps the logically
//! cyclic graph (records pointing at unions pointing back at records)
//! representable without shared ownership. Names are unique per document.

use crate::types::{Dir, call_name_of};
use indexmap::IndexMap;
use revgram_core::Fault;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Document bookkeeping errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// A node with the name already exists
    #[error("duplicate node {name}")]
    Duplicate {
        /// Node name
        name: String,
    },
    /// No node with the name exists
    #[error("no node named {name}")]
    Missing {
        /// Node name
        name: String,
    },
    /// Node stored under a key that differs from its name
    #[error("node {name} is stored as {key}")]
    Misfiled {
        /// Arena key
        key: String,
        /// Node's own name
        name: String,
    },
    /// Node has an empty name
    #[error("node with empty name")]
    EmptyName,
}

impl From<DocumentError> for Fault {
    fn from(err: DocumentError) -> Self {
        Fault::Consistency {
            reason: err.to_string(),
        }
    }
}

/// Type expression in surface syntax
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeExpr {
    /// Named type with optional arguments, e.g. `array[int8, 4]`
    Ident {
        /// Type or node name
        name: String,
        /// Arguments
        args: Vec<TypeExpr>,
    },
    /// Integer literal
    Int(u64),
    /// Inclusive range `a:b`
    Range(u64, u64),
    /// String literal
    Str(Vec<u8>),
}

impl TypeExpr {
    /// Bare identifier
    #[must_use]
    pub fn ident(name: impl Into<String>) -> Self {
        Self::Ident {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Identifier with arguments
    #[must_use]
    pub fn call(name: impl Into<String>, args: Vec<TypeExpr>) -> Self {
        Self::Ident {
            name: name.into(),
            args,
        }
    }

    /// `intN` for a width in bytes
    #[must_use]
    pub fn int_of_size(size: u64) -> Self {
        Self::ident(format!("int{}", size * 8))
    }

    /// Identifier name, if this is an identifier
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Ident { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Identifier arguments, empty for literals
    #[must_use]
    pub fn args(&self) -> &[TypeExpr] {
        match self {
            Self::Ident { args, .. } => args,
            _ => &[],
        }
    }

    /// Every identifier name in the expression, outermost first
    pub fn idents(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_idents(&mut out);
        out
    }

    fn collect_idents<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Self::Ident { name, args } = self {
            out.push(name);
            for arg in args {
                arg.collect_idents(out);
            }
        }
    }
}

/// Member of a record, union, or operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Member name
    pub name: String,
    /// Member type
    pub ty: TypeExpr,
    /// Direction attribute
    pub dir: Option<Dir>,
    /// Overlay attribute
    pub overlay: bool,
    /// Free-form comment lines
    pub comments: Vec<String>,
    /// A type has been accepted for this member
    pub resolved: bool,
    /// Placeholder alternative, dropped once real types are inferred
    pub random: bool,
}

impl FieldDef {
    /// Create a new field
    #[must_use]
    pub fn new(name: impl Into<String>, ty: TypeExpr) -> Self {
        Self {
            name: name.into(),
            ty,
            dir: None,
            overlay: false,
            comments: Vec::new(),
            resolved: false,
            random: false,
        }
    }

    /// Mark resolved
    #[must_use]
    pub fn resolved(mut self) -> Self {
        self.resolved = true;
        self
    }

    /// Mark as a random placeholder
    #[must_use]
    pub fn random(mut self) -> Self {
        self.random = true;
        self
    }

    /// Add a comment line
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comments.push(comment.into());
        self
    }

    /// Set the direction attribute
    #[must_use]
    pub fn with_dir(mut self, dir: Dir) -> Self {
        self.dir = Some(dir);
        self
    }
}

/// Record or union definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordNode {
    /// Name
    pub name: String,
    /// Members in order
    pub fields: Vec<FieldDef>,
    /// Union rather than struct
    pub is_union: bool,
    /// `packed` attribute
    pub packed: bool,
    /// `varlen` attribute
    pub varlen: bool,
    /// `size[N]` attribute
    pub size: Option<u64>,
}

impl RecordNode {
    /// Create an empty struct
    #[must_use]
    pub fn new_struct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            is_union: false,
            packed: false,
            varlen: false,
            size: None,
        }
    }

    /// Create an empty union
    #[must_use]
    pub fn new_union(name: impl Into<String>) -> Self {
        Self {
            is_union: true,
            ..Self::new_struct(name)
        }
    }

    /// Append a field
    #[must_use]
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Set the `packed` attribute
    #[must_use]
    pub fn packed(mut self) -> Self {
        self.packed = true;
        self
    }

    /// Set `size[N]` when known, `varlen` otherwise
    #[must_use]
    pub fn sized(mut self, size: Option<u64>) -> Self {
        match size {
            Some(n) => {
                self.size = Some(n);
                self.varlen = false;
            }
            None => {
                self.size = None;
                self.varlen = true;
            }
        }
        self
    }

    /// Field by name
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Enumerated integer set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagsNode {
    /// Name
    pub name: String,
    /// Values in declaration order
    pub values: Vec<u64>,
}

/// Enumerated string set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrFlagsNode {
    /// Name
    pub name: String,
    /// Literals without terminator
    pub values: Vec<Vec<u8>>,
}

/// Resource declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Name
    pub name: String,
    /// Underlying integer or parent resource
    pub base: TypeExpr,
    /// Sentinel values
    pub values: Vec<u64>,
}

/// Operation declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallNode {
    /// Full name including `$variant`
    pub name: String,
    /// Arguments
    pub args: Vec<FieldDef>,
    /// Return type
    pub ret: Option<TypeExpr>,
    /// Opcode, absent for pseudo-operations
    pub opcode: Option<u64>,
}

impl CallNode {
    /// Create an operation with no arguments
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            ret: None,
            opcode: None,
        }
    }

    /// Name before any `$variant`
    #[must_use]
    pub fn call_name(&self) -> &str {
        call_name_of(&self.name)
    }
}

/// Node of a grammar document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// Struct or union
    Record(RecordNode),
    /// Integer set
    Flags(FlagsNode),
    /// String set
    StrFlags(StrFlagsNode),
    /// Resource
    Resource(ResourceNode),
    /// Operation
    Call(CallNode),
}

impl Node {
    /// Node name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Record(n) => &n.name,
            Self::Flags(n) => &n.name,
            Self::StrFlags(n) => &n.name,
            Self::Resource(n) => &n.name,
            Self::Call(n) => &n.name,
        }
    }

    fn set_name(&mut self, name: String) {
        match self {
            Self::Record(n) => n.name = name,
            Self::Flags(n) => n.name = name,
            Self::StrFlags(n) => n.name = name,
            Self::Resource(n) => n.name = name,
            Self::Call(n) => n.name = name,
        }
    }

    /// Kind word used in compiler messages
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Record(n) if n.is_union => "union",
            Self::Record(_) => "struct",
            Self::Flags(_) => "flags",
            Self::StrFlags(_) => "string flags",
            Self::Resource(_) => "resource",
            Self::Call(_) => "call",
        }
    }

    /// Names this node's type expressions mention
    #[must_use]
    pub fn referenced_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut push = |expr: &TypeExpr| {
            out.extend(expr.idents().into_iter().map(str::to_string));
        };
        match self {
            Self::Record(n) => n.fields.iter().for_each(|f| push(&f.ty)),
            Self::Resource(n) => push(&n.base),
            Self::Call(n) => {
                n.args.iter().for_each(|f| push(&f.ty));
                if let Some(ret) = &n.ret {
                    push(ret);
                }
            }
            Self::Flags(_) | Self::StrFlags(_) => {}
        }
        out
    }

    /// Record view
    #[must_use]
    pub fn as_record(&self) -> Option<&RecordNode> {
        match self {
            Self::Record(n) => Some(n),
            _ => None,
        }
    }
}

/// Name-indexed arena of grammar nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    prefix: String,
    nodes: IndexMap<String, Node>,
    serial: u64,
}

impl Document {
    /// Create an empty document whose generated names start with `prefix`
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            nodes: IndexMap::new(),
            serial: 0,
        }
    }

    /// Prefix of generated names
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Node names in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Whether a node exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Mutable node by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    /// Record by name
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&RecordNode> {
        self.get(name).and_then(Node::as_record)
    }

    /// Mutable record by name
    pub fn record_mut(&mut self, name: &str) -> Option<&mut RecordNode> {
        match self.nodes.get_mut(name)? {
            Node::Record(n) => Some(n),
            _ => None,
        }
    }

    /// Operations in insertion order
    pub fn calls(&self) -> impl Iterator<Item = &CallNode> {
        self.nodes.values().filter_map(|n| match n {
            Node::Call(c) => Some(c),
            _ => None,
        })
    }

    /// Mutable operation by name
    pub fn call_mut(&mut self, name: &str) -> Option<&mut CallNode> {
        match self.nodes.get_mut(name)? {
            Node::Call(n) => Some(n),
            _ => None,
        }
    }

    /// Add a node
    ///
    /// # Errors
    ///
    /// Returns error if a node with the same name exists
    pub fn add(&mut self, node: Node) -> Result<(), DocumentError> {
        let name = node.name().to_string();
        if name.is_empty() {
            return Err(DocumentError::EmptyName);
        }
        if self.nodes.contains_key(&name) {
            return Err(DocumentError::Duplicate { name });
        }
        self.nodes.insert(name, node);
        Ok(())
    }

    /// Remove a single node, leaving its references alone
    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.nodes.shift_remove(name)
    }

    /// Remove a node and every node only it kept alive
    ///
    /// Returns the removed names, the requested node first.
    pub fn remove_tree(&mut self, name: &str) -> Vec<String> {
        let Some(node) = self.nodes.shift_remove(name) else {
            return Vec::new();
        };
        let mut removed = vec![name.to_string()];
        removed.extend(self.drop_orphans(node.referenced_names()));
        removed
    }

    /// Drop the nodes an expression mentions that nothing else keeps alive
    ///
    /// Call this after detaching the expression from its owner.
    pub fn remove_type_expr(&mut self, expr: &TypeExpr) -> Vec<String> {
        let seeds = expr.idents().into_iter().map(str::to_string).collect();
        self.drop_orphans(seeds)
    }

    /// Remove the nodes reachable from `seeds` that no surviving node
    /// outside that set reaches
    fn drop_orphans(&mut self, seeds: Vec<String>) -> Vec<String> {
        // Everything transitively reachable from the seeds.
        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut stack = seeds;
        while let Some(name) = stack.pop() {
            let Some(node) = self.nodes.get(&name) else {
                continue;
            };
            if matches!(node, Node::Call(_)) || !closure.insert(name) {
                continue;
            }
            stack.extend(node.referenced_names());
        }

        // Members of the closure still reachable from outside it survive.
        let mut live: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<String> = self
            .nodes
            .iter()
            .filter(|(name, _)| !closure.contains(*name))
            .flat_map(|(_, node)| node.referenced_names())
            .collect();
        while let Some(name) = stack.pop() {
            if !closure.contains(&name) || !live.insert(name.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&name) {
                stack.extend(node.referenced_names());
            }
        }

        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|name| closure.contains(*name) && !live.contains(*name))
            .cloned()
            .collect();
        for name in &doomed {
            self.nodes.shift_remove(name);
        }
        doomed
    }

    /// Whether any node mentions `name`
    #[must_use]
    pub fn is_referenced(&self, name: &str) -> bool {
        self.nodes
            .values()
            .any(|n| n.referenced_names().iter().any(|r| r == name))
    }

    /// Rename a node of any kind, keeping its position
    ///
    /// References to the old name are left as they are.
    ///
    /// # Errors
    ///
    /// Returns error if `old` does not exist or `new` is taken
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), DocumentError> {
        if old == new {
            return if self.contains(old) {
                Ok(())
            } else {
                Err(DocumentError::Missing {
                    name: old.to_string(),
                })
            };
        }
        if self.nodes.contains_key(new) {
            return Err(DocumentError::Duplicate {
                name: new.to_string(),
            });
        }
        let (idx, _, mut node) =
            self.nodes
                .shift_remove_full(old)
                .ok_or_else(|| DocumentError::Missing {
                    name: old.to_string(),
                })?;
        node.set_name(new.to_string());
        self.nodes.shift_insert(idx, new.to_string(), node);
        Ok(())
    }

    /// Fresh name that no node uses
    pub fn make_unique_name(&mut self) -> String {
        loop {
            self.serial += 1;
            let name = format!("{}_t{}", self.prefix, self.serial);
            if !self.nodes.contains_key(&name) {
                return name;
            }
        }
    }

    /// Check that every node is filed under its own non-empty name
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found
    pub fn finalize(&self) -> Result<(), DocumentError> {
        for (key, node) in &self.nodes {
            if node.name().is_empty() {
                return Err(DocumentError::EmptyName);
            }
            if key != node.name() {
                return Err(DocumentError::Misfiled {
                    key: key.clone(),
                    name: node.name().to_string(),
                });
            }
        }
        Ok(())
    }
}

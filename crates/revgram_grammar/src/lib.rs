//! REVGRAM Grammar Model
//!
//! Grammar documents under inference, their surface syntax, and the
//! compiled signature catalogue the matcher walks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalogue;
pub mod compiler;
pub mod decompile;
pub mod document;
pub mod hash;
pub mod syntax;
pub mod types;

pub use catalogue::{Catalogue, SignatureId};
pub use compiler::{CompileError, GrammarCompiler, PADDING_PREFIX, SurfaceCompiler, int_width};
pub use decompile::decompile;
pub use document::{
    CallNode, Document, DocumentError, FieldDef, FlagsNode, Node, RecordNode, ResourceNode,
    StrFlagsNode, TypeExpr,
};
pub use syntax::{MARK_RANDOM, MARK_RESOLVED, SyntaxError, parse_document};
pub use types::{
    ArrayLen, BufferKind, Dir, Field, IntKind, Signature, TypeDescriptor, TypeRef, call_name_of,
};

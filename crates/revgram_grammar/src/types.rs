//! Compiled type descriptors.
//!
//! A compiled grammar is a flat arena of [`TypeDescriptor`]s addressed by
//! [`TypeRef`]. Records may refer to themselves through pointers, so
//! descriptors never own their children; they hold arena references. The
//! arena index doubles as the type's identity when building structural
//! paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a descriptor in a [`crate::Catalogue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeRef(pub u32);

impl TypeRef {
    /// Arena index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Identity edge used when extending a structural path
    #[must_use]
    pub const fn edge(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Data direction of an argument or field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dir {
    /// Read by the operation
    In,
    /// Written by the operation
    Out,
    /// Read and written
    InOut,
}

impl Dir {
    /// Parse the surface keyword
    #[must_use]
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "in" => Some(Self::In),
            "out" => Some(Self::Out),
            "inout" => Some(Self::InOut),
            _ => None,
        }
    }

    /// Surface keyword
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::InOut => "inout",
        }
    }

    /// Whether input snapshots hold this data
    #[must_use]
    pub const fn reads_input(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    /// Whether output snapshots hold this data
    #[must_use]
    pub const fn reads_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntKind {
    /// Any value of the declared width
    Plain,
    /// Value in `begin..=end`, stepping by `align` when non-zero
    Range {
        /// Lower bound
        begin: u64,
        /// Upper bound
        end: u64,
        /// Step, zero for none
        align: u64,
    },
}

/// Buffer content constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferKind {
    /// Arbitrary bytes
    Random,
    /// Arbitrary bytes with a length in `min..=max`
    Ranged {
        /// Minimum length
        min: u64,
        /// Maximum length
        max: u64,
    },
    /// String, optionally one of a set of literals
    String {
        /// Allowed literals including any terminator, empty for any
        values: Vec<Vec<u8>>,
        /// No zero terminator
        noz: bool,
    },
    /// File name
    Filename {
        /// No zero terminator
        noz: bool,
    },
    /// Path matching colon-separated glob patterns, `-` prefix excludes
    Glob {
        /// Raw pattern list
        pattern: String,
    },
    /// Machine code for an architecture
    Text {
        /// Architecture name
        arch: String,
    },
}

/// Element count of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayLen {
    /// Any number of elements
    Variable,
    /// Exactly `n` elements
    Fixed(u64),
    /// Between `min` and `max` elements
    Range {
        /// Minimum count
        min: u64,
        /// Maximum count
        max: u64,
    },
}

/// Named member of a record, union, or signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Member name
    pub name: String,
    /// Member type
    pub ty: TypeRef,
    /// Direction override
    pub dir: Option<Dir>,
    /// Offset resets to the record start at this member
    pub overlay: bool,
}

impl Field {
    /// Create a new field
    #[must_use]
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            dir: None,
            overlay: false,
        }
    }

    /// Set the direction override
    #[must_use]
    pub fn with_dir(mut self, dir: Dir) -> Self {
        self.dir = Some(dir);
        self
    }
}

/// Closed set of compiled types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeDescriptor {
    /// Runtime handle of a resource kind
    Resource {
        /// Resource name
        name: String,
        /// Kind chain from the root resource to this one
        kinds: Vec<String>,
        /// Sentinel values accepted anywhere
        special_values: Vec<u64>,
        /// Width in bytes
        size: u64,
    },
    /// Fixed value
    Const {
        /// The value
        value: u64,
        /// Width in bytes
        size: u64,
    },
    /// Integer
    Int {
        /// Width in bytes
        size: u64,
        /// Constraint
        kind: IntKind,
    },
    /// Integer drawn from a named value set
    Flags {
        /// Set name
        name: String,
        /// Declared values
        values: Vec<u64>,
        /// Width in bytes
        size: u64,
        /// Values combine as bits rather than enumerate
        bitmask: bool,
    },
    /// Size of a sibling
    Len {
        /// Target path, first element names a sibling
        path: Vec<String>,
        /// Width in bytes
        size: u64,
        /// Counts bytes rather than elements
        bytes: bool,
    },
    /// Byte buffer
    Buffer {
        /// Content constraint
        kind: BufferKind,
        /// Fixed size, `None` for variable
        size: Option<u64>,
    },
    /// Repeated element
    Array {
        /// Element type
        elem: TypeRef,
        /// Element count
        len: ArrayLen,
    },
    /// Pointer to memory of the element type
    Pointer {
        /// Direction of the pointee
        dir: Dir,
        /// Pointee type
        elem: TypeRef,
    },
    /// Sequence of fields
    Record {
        /// Record name
        name: String,
        /// Fields, including inserted padding
        fields: Vec<Field>,
        /// No alignment padding
        packed: bool,
        /// Fixed size, `None` for variable
        size: Option<u64>,
    },
    /// One of several fields at the same offset
    Union {
        /// Union name
        name: String,
        /// Alternatives
        fields: Vec<Field>,
        /// Fixed size, `None` for variable
        size: Option<u64>,
    },
    /// Address of a memory mapping
    Vma,
    /// Per-process value
    Proc {
        /// Width in bytes
        size: u64,
        /// First value
        start: u64,
        /// Values reserved per process
        per_proc: u64,
    },
}

impl TypeDescriptor {
    /// Short variant label for logs and messages
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resource { .. } => "resource",
            Self::Const { .. } => "const",
            Self::Int { .. } => "int",
            Self::Flags { .. } => "flags",
            Self::Len { .. } => "len",
            Self::Buffer { .. } => "buffer",
            Self::Array { .. } => "array",
            Self::Pointer { .. } => "ptr",
            Self::Record { .. } => "struct",
            Self::Union { .. } => "union",
            Self::Vma => "vma",
            Self::Proc { .. } => "proc",
        }
    }

    /// Record or union name
    #[must_use]
    pub fn composite_name(&self) -> Option<&str> {
        match self {
            Self::Record { name, .. } | Self::Union { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Typed operation signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Full name including any `$variant` suffix
    pub name: String,
    /// Name of the underlying operation
    pub call_name: String,
    /// Opcode, `None` for pseudo-operations
    pub opcode: Option<u64>,
    /// Arguments
    pub args: Vec<Field>,
    /// Return type
    pub ret: Option<TypeRef>,
}

impl Signature {
    /// Prefix of operations that exist only for the fuzzer
    pub const PSEUDO_PREFIX: &'static str = "syz_";

    /// Whether this is a pseudo-operation never seen in traces
    #[must_use]
    pub fn is_pseudo(&self) -> bool {
        self.call_name.starts_with(Self::PSEUDO_PREFIX)
    }

    /// Whether this is a `$variant` of another signature
    #[must_use]
    pub fn is_variant(&self) -> bool {
        self.name != self.call_name
    }
}

/// Call name of a possibly `$`-suffixed signature name
#[must_use]
pub fn call_name_of(name: &str) -> &str {
    name.split('$').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_parse() {
        assert_eq!(Dir::parse("in"), Some(Dir::In));
        assert_eq!(Dir::parse("inout"), Some(Dir::InOut));
        assert_eq!(Dir::parse("sideways"), None);
        assert!(Dir::InOut.reads_input() && Dir::InOut.reads_output());
        assert!(!Dir::Out.reads_input());
    }

    #[test]
    fn test_call_name() {
        assert_eq!(call_name_of("ioctl$TCGETS"), "ioctl");
        assert_eq!(call_name_of("read"), "read");
        let sig = Signature {
            name: "syz_harness$x".to_string(),
            call_name: "syz_harness".to_string(),
            opcode: None,
            args: vec![],
            ret: None,
        };
        assert!(sig.is_pseudo());
        assert!(sig.is_variant());
    }
}

//! Field specification model and printer.
//!
//! A field specification is the simplified description of a harness input
//! that seeds inference:
//!
//! ```text
//! INPUT ::= magic{size: 4, value: 1279869254}
//!           count{size: 4}
//!           CMD[count]
//!
//! CMD ::= name{size: 8, type: string}
//!       | payload{size: 0x10}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size or count of a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecSize {
    /// Literal byte size or element count
    Fixed(u64),
    /// Given at runtime by another field of the record
    Named(String),
}

impl fmt::Display for SpecSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{n}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Field with optional size, fixed value and type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalField {
    /// Field name
    pub name: String,
    /// Declared content type
    pub ty: Option<String>,
    /// Byte size
    pub size: Option<SpecSize>,
    /// Fixed integer value
    pub value: Option<u64>,
}

impl NormalField {
    /// Create an unsized, untyped field
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
            size: None,
            value: None,
        }
    }

    /// Set the size
    #[must_use]
    pub fn with_size(mut self, size: SpecSize) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the type
    #[must_use]
    pub fn with_type(mut self, ty: impl Into<String>) -> Self {
        self.ty = Some(ty.into());
        self
    }

    /// Set the fixed value
    #[must_use]
    pub fn with_value(mut self, value: u64) -> Self {
        self.value = Some(value);
        self
    }
}

/// One line of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecField {
    /// `name{size: .., value: .., type: ..}`
    Normal(NormalField),
    /// `RECORD[count]`: repeated record
    Array {
        /// Element record name
        item: String,
        /// Element count
        count: Option<SpecSize>,
    },
    /// `RECORD`: embedded record
    Ref(String),
}

impl fmt::Display for SpecField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal(n) => {
                let mut attrs = Vec::new();
                if let Some(size) = &n.size {
                    attrs.push(format!("size: {size}"));
                }
                if let Some(value) = n.value {
                    attrs.push(format!("value: {value}"));
                }
                if let Some(ty) = &n.ty {
                    attrs.push(format!("type: {ty}"));
                }
                write!(f, "{} {{{}}}", n.name, attrs.join(", "))
            }
            Self::Array { item, count } => match count {
                Some(count) => write!(f, "{item}[{count}]"),
                None => write!(f, "{item}[]"),
            },
            Self::Ref(name) => f.write_str(name),
        }
    }
}

/// Named sequence or alternation of fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecRecord {
    /// Record name
    pub name: String,
    /// Fields in order, never empty once parsed
    pub fields: Vec<SpecField>,
    /// Alternatives rather than a sequence
    pub is_union: bool,
}

impl fmt::Display for SpecRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = format!("{} ::= ", self.name);
        let indent = " ".repeat(head.len() - 2);
        let lead = if self.is_union { "| " } else { "  " };
        for (i, field) in self.fields.iter().enumerate() {
            if i == 0 {
                writeln!(f, "{head}{field}")?;
            } else {
                writeln!(f, "{indent}{lead}{field}")?;
            }
        }
        Ok(())
    }
}

/// Parsed field specification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Records in declaration order
    pub records: Vec<SpecRecord>,
}

impl FieldSpec {
    /// Record by name
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&SpecRecord> {
        self.records.iter().find(|r| r.name == name)
    }
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{record}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_layout() {
        let spec = FieldSpec {
            records: vec![SpecRecord {
                name: "CMD".to_string(),
                fields: vec![
                    SpecField::Normal(
                        NormalField::new("name")
                            .with_size(SpecSize::Fixed(8))
                            .with_type("string"),
                    ),
                    SpecField::Array {
                        item: "ITEM".to_string(),
                        count: Some(SpecSize::Named("cnt".to_string())),
                    },
                ],
                is_union: true,
            }],
        };
        assert_eq!(
            spec.to_string(),
            "CMD ::= name {size: 8, type: string}\n      | ITEM[cnt]\n\n"
        );
    }

    #[test]
    fn test_print_empty_attrs() {
        let field = SpecField::Normal(NormalField::new("x"));
        assert_eq!(field.to_string(), "x {}");
        let arr = SpecField::Array {
            item: "A".to_string(),
            count: None,
        };
        assert_eq!(arr.to_string(), "A[]");
    }
}

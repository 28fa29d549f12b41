//! Line parser for field specifications.

use crate::error::FieldSpecError;
use crate::model::{FieldSpec, NormalField, SpecField, SpecRecord, SpecSize};
use std::path::Path;

const ASSIGN: &str = "::=";
const ALTERNATE: char = '|';
const COMMENT: &str = "//";

fn syntax(line: usize, message: impl Into<String>) -> FieldSpecError {
    FieldSpecError::Syntax {
        line,
        message: message.into(),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Split a leading name off `text`, returning it and the trimmed rest
fn split_name(text: &str) -> (&str, &str) {
    let end = text.find(|c| !is_name_char(c)).unwrap_or(text.len());
    (&text[..end], text[end..].trim())
}

fn parse_uint(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_size(line: usize, text: &str) -> Result<Option<SpecSize>, FieldSpecError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if let Some(n) = parse_uint(text) {
        return Ok(Some(SpecSize::Fixed(n)));
    }
    match split_name(text) {
        (name, "") if !name.is_empty() => Ok(Some(SpecSize::Named(name.to_string()))),
        _ => Err(syntax(line, format!("bad size {text:?}"))),
    }
}

fn parse_attrs(line: usize, field: &mut NormalField, text: &str) -> Result<(), FieldSpecError> {
    for attr in text.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        let Some((key, value)) = attr.split_once(':') else {
            return Err(syntax(line, format!("attribute {attr:?} has no value")));
        };
        let value = value.trim();
        match key.trim() {
            "size" => field.size = parse_size(line, value)?,
            "value" => {
                let v = parse_uint(value)
                    .ok_or_else(|| syntax(line, format!("bad value {value:?}")))?;
                field.value = Some(v);
            }
            "type" => field.ty = Some(value.to_string()),
            other => return Err(syntax(line, format!("unknown attribute {other:?}"))),
        }
    }
    Ok(())
}

fn parse_field(line: usize, text: &str) -> Result<SpecField, FieldSpecError> {
    let (name, rest) = split_name(text.trim());
    if name.is_empty() {
        return Err(syntax(line, format!("expected a field, got {text:?}")));
    }
    if rest.is_empty() {
        return Ok(SpecField::Ref(name.to_string()));
    }
    if let Some(inner) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return Ok(SpecField::Array {
            item: name.to_string(),
            count: parse_size(line, inner)?,
        });
    }
    if let Some(inner) = rest.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        let mut field = NormalField::new(name);
        parse_attrs(line, &mut field, inner)?;
        return Ok(SpecField::Normal(field));
    }
    Err(syntax(line, format!("unexpected {rest:?} after {name}")))
}

/// Parse a field specification
///
/// # Errors
///
/// Returns the first malformed line
pub fn parse(text: &str) -> Result<FieldSpec, FieldSpecError> {
    let mut spec = FieldSpec::default();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let body = raw.split(COMMENT).next().unwrap_or_default().trim();
        if body.is_empty() {
            continue;
        }
        if let Some((name, field)) = body.split_once(ASSIGN) {
            let name = name.trim();
            if name.is_empty() || !name.chars().all(is_name_char) {
                return Err(syntax(line, format!("bad record name {name:?}")));
            }
            if spec.record(name).is_some() {
                return Err(syntax(line, format!("duplicate record {name}")));
            }
            spec.records.push(SpecRecord {
                name: name.to_string(),
                fields: vec![parse_field(line, field)?],
                is_union: false,
            });
            continue;
        }
        let Some(current) = spec.records.last_mut() else {
            return Err(syntax(line, "field outside of a record"));
        };
        match body.strip_prefix(ALTERNATE) {
            Some(field) => {
                current.is_union = true;
                current.fields.push(parse_field(line, field)?);
            }
            None => current.fields.push(parse_field(line, body)?),
        }
    }
    Ok(spec)
}

/// Read and parse a field specification file
///
/// # Errors
///
/// Returns error if the file cannot be read or does not parse
pub fn parse_file(path: &Path) -> Result<FieldSpec, FieldSpecError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| syntax(0, format!("{}: {e}", path.display())))?;
    parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "// harness input
INPUT ::= magic{size: 4, value: 0x4c4f4746}
          count{size: 4}
          CMD[count]  // trailing comment

CMD ::= name{size: 8, type: string}
      | payload{size: 0x10}
      | TAIL
";

    #[test]
    fn test_parse_sample() {
        let spec = parse(SAMPLE).unwrap();
        assert_eq!(spec.records.len(), 2);
        let input = spec.record("INPUT").unwrap();
        assert!(!input.is_union);
        assert_eq!(
            input.fields[0],
            SpecField::Normal(
                NormalField::new("magic")
                    .with_size(SpecSize::Fixed(4))
                    .with_value(0x4c4f_4746)
            )
        );
        assert_eq!(
            input.fields[2],
            SpecField::Array {
                item: "CMD".to_string(),
                count: Some(SpecSize::Named("count".to_string())),
            }
        );
        let cmd = spec.record("CMD").unwrap();
        assert!(cmd.is_union);
        assert_eq!(cmd.fields[2], SpecField::Ref("TAIL".to_string()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse("  x{size: 4}\n"),
            Err(FieldSpecError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            parse("A ::= x{size: 4}\n  y{colour: red}\n"),
            Err(FieldSpecError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            parse("A ::= x(4)\n"),
            Err(FieldSpecError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn test_print_parse_idempotent_sample() {
        let once = parse(SAMPLE).unwrap().to_string();
        let twice = parse(&once).unwrap().to_string();
        assert_eq!(once, twice);
    }

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,6}"
    }

    fn arb_size() -> impl Strategy<Value = SpecSize> {
        prop_oneof![
            (0u64..0x1_0000).prop_map(SpecSize::Fixed),
            arb_name().prop_map(SpecSize::Named),
        ]
    }

    fn arb_field() -> impl Strategy<Value = SpecField> {
        prop_oneof![
            (
                arb_name(),
                prop::option::of(arb_size()),
                prop::option::of(any::<u64>()),
                prop::option::of(Just("string".to_string())),
            )
                .prop_map(|(name, size, value, ty)| SpecField::Normal(NormalField {
                    name,
                    ty,
                    size,
                    value,
                })),
            (arb_name(), prop::option::of(arb_size()))
                .prop_map(|(item, count)| SpecField::Array { item, count }),
            arb_name().prop_map(SpecField::Ref),
        ]
    }

    fn arb_spec() -> impl Strategy<Value = FieldSpec> {
        prop::collection::vec(
            (prop::collection::vec(arb_field(), 1..5), any::<bool>()),
            1..4,
        )
        .prop_map(|records| FieldSpec {
            records: records
                .into_iter()
                .enumerate()
                .map(|(i, (fields, is_union))| SpecRecord {
                    name: format!("R{i}"),
                    is_union: is_union && fields.len() > 1,
                    fields,
                })
                .collect(),
        })
    }

    proptest! {
        #[test]
        fn prop_parse_print_idempotent(spec in arb_spec()) {
            let printed = spec.to_string();
            let parsed = parse(&printed).unwrap();
            prop_assert_eq!(&parsed, &spec);
            prop_assert_eq!(parsed.to_string(), printed);
        }
    }
}

//! Surface syntax of grammar documents.
//!
//! ```text
//! resource fd[int32]: 0xffffffffffffffff
//! open_flags = 0x1, 0x2, 0x4
//! names = "a", "b"
//! h_INPUT {
//! 	# resolved
//! 	h_len	len[h_data, int8]
//! 	h_data	array[int8]
//! } [packed]
//! h_u [
//! 	field_0	int32
//! ] [size[4]]
//! syz_harness$h_INPUT(buf ptr[in, h_INPUT], len bytesize[buf])
//! alarm(seconds int32) @37
//! ```
//!
//! Comment lines inside a record body attach to the next field; the
//! comments `resolved` and `random` are field markers. Comments elsewhere
//! are dropped.

use crate::document::{
    CallNode, Document, FieldDef, FlagsNode, Node, RecordNode, ResourceNode, StrFlagsNode,
    TypeExpr,
};
use crate::types::Dir;
use revgram_core::{Fault, Fingerprint};
use std::fmt::{self, Write as _};

/// Marker comment for a resolved field
pub const MARK_RESOLVED: &str = "resolved";
/// Marker comment for a placeholder field
pub const MARK_RANDOM: &str = "random";

/// Parse failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct SyntaxError {
    /// 1-based line number
    pub line: usize,
    /// What was wrong
    pub message: String,
}

impl From<SyntaxError> for Fault {
    fn from(err: SyntaxError) -> Self {
        Fault::Compile {
            messages: vec![err.to_string()],
        }
    }
}

fn fmt_num(v: u64) -> String {
    if v < 10 {
        v.to_string()
    } else {
        format!("0x{v:x}")
    }
}

fn fmt_str(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push('"');
    out
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident { name, args } => {
                f.write_str(name)?;
                if !args.is_empty() {
                    f.write_str("[")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    f.write_str("]")?;
                }
                Ok(())
            }
            Self::Int(v) => f.write_str(&fmt_num(*v)),
            Self::Range(a, b) => write!(f, "{}:{}", fmt_num(*a), fmt_num(*b)),
            Self::Str(s) => f.write_str(&fmt_str(s)),
        }
    }
}

fn field_attrs(field: &FieldDef) -> String {
    let mut attrs = Vec::new();
    if let Some(dir) = field.dir {
        attrs.push(dir.as_str());
    }
    if field.overlay {
        attrs.push("overlay");
    }
    if attrs.is_empty() {
        String::new()
    } else {
        format!(" ({})", attrs.join(", "))
    }
}

fn write_record(f: &mut fmt::Formatter<'_>, r: &RecordNode) -> fmt::Result {
    let (open, close) = if r.is_union { ('[', ']') } else { ('{', '}') };
    writeln!(f, "{} {open}", r.name)?;
    for field in &r.fields {
        for comment in &field.comments {
            writeln!(f, "\t# {comment}")?;
        }
        if field.random {
            writeln!(f, "\t# {MARK_RANDOM}")?;
        }
        if field.resolved {
            writeln!(f, "\t# {MARK_RESOLVED}")?;
        }
        writeln!(f, "\t{}\t{}{}", field.name, field.ty, field_attrs(field))?;
    }
    write!(f, "{close}")?;
    let mut attrs = Vec::new();
    if r.packed {
        attrs.push("packed".to_string());
    }
    if r.varlen {
        attrs.push("varlen".to_string());
    }
    if let Some(size) = r.size {
        attrs.push(format!("size[{}]", fmt_num(size)));
    }
    if !attrs.is_empty() {
        write!(f, " [{}]", attrs.join(", "))?;
    }
    writeln!(f)
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(r) => {
                write!(f, "resource {}[{}]", r.name, r.base)?;
                if !r.values.is_empty() {
                    let vals: Vec<String> = r.values.iter().map(|v| fmt_num(*v)).collect();
                    write!(f, ": {}", vals.join(", "))?;
                }
                writeln!(f)
            }
            Self::Flags(n) => {
                let vals: Vec<String> = n.values.iter().map(|v| fmt_num(*v)).collect();
                writeln!(f, "{} = {}", n.name, vals.join(", "))
            }
            Self::StrFlags(n) => {
                let vals: Vec<String> = n.values.iter().map(|v| fmt_str(v)).collect();
                writeln!(f, "{} = {}", n.name, vals.join(", "))
            }
            Self::Record(r) => write_record(f, r),
            Self::Call(c) => {
                let args: Vec<String> = c
                    .args
                    .iter()
                    .map(|a| format!("{} {}{}", a.name, a.ty, field_attrs(a)))
                    .collect();
                write!(f, "{}({})", c.name, args.join(", "))?;
                if let Some(ret) = &c.ret {
                    write!(f, " {ret}")?;
                }
                if let Some(op) = c.opcode {
                    write!(f, " @{op}")?;
                }
                writeln!(f)
            }
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

impl Document {
    /// BLAKE3 fingerprint of the printed form
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self.to_string().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Num(u64),
    Str(Vec<u8>),
    Punct(u8),
    Comment(String),
    Newline,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn lex(text: &str) -> Result<Vec<Token>, SyntaxError> {
    let bytes = text.as_bytes();
    let mut toks = Vec::new();
    let mut line = 1;
    let mut i = 0;
    let err = |line: usize, message: String| SyntaxError { line, message };

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' => i += 1,
            b'\n' => {
                toks.push(Token {
                    tok: Tok::Newline,
                    line,
                });
                line += 1;
                i += 1;
            }
            b'#' => {
                let start = i + 1;
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                let body = String::from_utf8_lossy(&bytes[start..i]).trim().to_string();
                toks.push(Token {
                    tok: Tok::Comment(body),
                    line,
                });
            }
            b'"' => {
                i += 1;
                let mut s = Vec::new();
                loop {
                    let Some(&b) = bytes.get(i) else {
                        return Err(err(line, "unterminated string".to_string()));
                    };
                    i += 1;
                    match b {
                        b'"' => break,
                        b'\n' => return Err(err(line, "newline in string".to_string())),
                        b'\\' => {
                            let Some(&e) = bytes.get(i) else {
                                return Err(err(line, "unterminated escape".to_string()));
                            };
                            i += 1;
                            match e {
                                b'"' | b'\\' => s.push(e),
                                b'n' => s.push(b'\n'),
                                b't' => s.push(b'\t'),
                                b'x' => {
                                    let hex = bytes
                                        .get(i..i + 2)
                                        .and_then(|h| std::str::from_utf8(h).ok())
                                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                                        .ok_or_else(|| err(line, "bad \\x escape".to_string()))?;
                                    s.push(hex);
                                    i += 2;
                                }
                                other => {
                                    return Err(err(
                                        line,
                                        format!("unknown escape \\{}", char::from(other)),
                                    ));
                                }
                            }
                        }
                        _ => s.push(b),
                    }
                }
                toks.push(Token {
                    tok: Tok::Str(s),
                    line,
                });
            }
            b'0'..=b'9' | b'-' => {
                let neg = c == b'-';
                if neg {
                    i += 1;
                }
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
                    i += 1;
                }
                let word = std::str::from_utf8(&bytes[start..i]).unwrap_or_default();
                let parsed = match word.strip_prefix("0x") {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => word.parse::<u64>(),
                };
                let value = parsed.map_err(|_| err(line, format!("bad number {word:?}")))?;
                toks.push(Token {
                    tok: Tok::Num(if neg { value.wrapping_neg() } else { value }),
                    line,
                });
            }
            b'[' | b']' | b'{' | b'}' | b'(' | b')' | b',' | b':' | b'=' | b'@' => {
                toks.push(Token {
                    tok: Tok::Punct(c),
                    line,
                });
                i += 1;
            }
            _ if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
                {
                    i += 1;
                }
                let word = String::from_utf8_lossy(&bytes[start..i]).into_owned();
                toks.push(Token {
                    tok: Tok::Ident(word),
                    line,
                });
            }
            _ => {
                return Err(err(
                    line,
                    format!("unexpected character {:?}", char::from(c)),
                ));
            }
        }
    }
    Ok(toks)
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn line(&self) -> usize {
        self.toks
            .get(self.pos)
            .or_else(|| self.toks.last())
            .map_or(1, |t| t.line)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).map(|t| t.tok.clone());
        self.pos += 1;
        tok
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, SyntaxError> {
        Err(SyntaxError {
            line: self.line(),
            message: message.into(),
        })
    }

    fn is_punct(&self, c: u8) -> bool {
        self.peek() == Some(&Tok::Punct(c))
    }

    fn expect_punct(&mut self, c: u8) -> Result<(), SyntaxError> {
        if self.is_punct(c) {
            self.pos += 1;
            Ok(())
        } else {
            self.error(format!("expected '{}'", char::from(c)))
        }
    }

    fn ident(&mut self) -> Result<String, SyntaxError> {
        match self.peek() {
            Some(Tok::Ident(_)) => match self.bump() {
                Some(Tok::Ident(s)) => Ok(s),
                _ => self.error("expected identifier"),
            },
            _ => self.error("expected identifier"),
        }
    }

    fn num(&mut self) -> Result<u64, SyntaxError> {
        match self.peek() {
            Some(&Tok::Num(v)) => {
                self.pos += 1;
                Ok(v)
            }
            _ => self.error("expected number"),
        }
    }

    fn end_of_line(&mut self) -> Result<(), SyntaxError> {
        match self.peek() {
            None => Ok(()),
            Some(Tok::Newline) => {
                self.pos += 1;
                Ok(())
            }
            Some(Tok::Comment(_)) => {
                self.pos += 1;
                self.end_of_line()
            }
            Some(other) => {
                let other = format!("{other:?}");
                self.error(format!("unexpected {other} at end of line"))
            }
        }
    }

    fn document(&mut self, prefix: &str) -> Result<Document, SyntaxError> {
        let mut doc = Document::new(prefix);
        loop {
            match self.peek() {
                None => break,
                Some(Tok::Newline | Tok::Comment(_)) => {
                    self.pos += 1;
                }
                Some(Tok::Ident(_)) => {
                    let line = self.line();
                    let node = self.node()?;
                    doc.add(node).map_err(|e| SyntaxError {
                        line,
                        message: e.to_string(),
                    })?;
                }
                Some(_) => return self.error("expected a declaration"),
            }
        }
        Ok(doc)
    }

    fn node(&mut self) -> Result<Node, SyntaxError> {
        let name = self.ident()?;
        if name == "resource" && matches!(self.peek(), Some(Tok::Ident(_))) {
            return self.resource();
        }
        match self.peek() {
            Some(Tok::Punct(b'=')) => {
                self.pos += 1;
                self.flags(name)
            }
            Some(Tok::Punct(b'{')) => {
                self.pos += 1;
                self.record(RecordNode::new_struct(name), b'}')
            }
            Some(Tok::Punct(b'[')) => {
                self.pos += 1;
                self.record(RecordNode::new_union(name), b']')
            }
            Some(Tok::Punct(b'(')) => {
                self.pos += 1;
                self.call(name)
            }
            _ => self.error(format!("expected '=', '{{', '[' or '(' after {name}")),
        }
    }

    fn resource(&mut self) -> Result<Node, SyntaxError> {
        let name = self.ident()?;
        self.expect_punct(b'[')?;
        let base = self.type_expr()?;
        self.expect_punct(b']')?;
        let mut values = Vec::new();
        if self.is_punct(b':') {
            self.pos += 1;
            values.push(self.num()?);
            while self.is_punct(b',') {
                self.pos += 1;
                values.push(self.num()?);
            }
        }
        self.end_of_line()?;
        Ok(Node::Resource(ResourceNode { name, base, values }))
    }

    fn flags(&mut self, name: String) -> Result<Node, SyntaxError> {
        if let Some(Tok::Str(_)) = self.peek() {
            let mut values = Vec::new();
            loop {
                match self.bump() {
                    Some(Tok::Str(s)) => values.push(s),
                    _ => return self.error("expected string"),
                }
                if !self.is_punct(b',') {
                    break;
                }
                self.pos += 1;
            }
            self.end_of_line()?;
            return Ok(Node::StrFlags(StrFlagsNode { name, values }));
        }
        let mut values = Vec::new();
        if let Some(Tok::Num(_)) = self.peek() {
            values.push(self.num()?);
            while self.is_punct(b',') {
                self.pos += 1;
                values.push(self.num()?);
            }
        }
        self.end_of_line()?;
        Ok(Node::Flags(FlagsNode { name, values }))
    }

    fn record(&mut self, mut rec: RecordNode, close: u8) -> Result<Node, SyntaxError> {
        let mut comments = Vec::new();
        let mut resolved = false;
        let mut random = false;
        loop {
            match self.peek() {
                None => return self.error(format!("unterminated {}", rec.name)),
                Some(Tok::Newline) => self.pos += 1,
                Some(Tok::Comment(_)) => {
                    if let Some(Tok::Comment(c)) = self.bump() {
                        match c.as_str() {
                            MARK_RESOLVED => resolved = true,
                            MARK_RANDOM => random = true,
                            _ => comments.push(c),
                        }
                    }
                }
                Some(Tok::Punct(c)) if *c == close => {
                    self.pos += 1;
                    break;
                }
                Some(Tok::Ident(_)) => {
                    let mut field = self.field()?;
                    field.comments = std::mem::take(&mut comments);
                    field.resolved = std::mem::take(&mut resolved);
                    field.random = std::mem::take(&mut random);
                    rec.fields.push(field);
                    if !self.is_punct(close) {
                        self.end_of_line()?;
                    }
                }
                Some(_) => return self.error(format!("unexpected token in {}", rec.name)),
            }
        }
        if self.is_punct(b'[') {
            self.pos += 1;
            loop {
                let attr = self.ident()?;
                match attr.as_str() {
                    "packed" => rec.packed = true,
                    "varlen" => rec.varlen = true,
                    "size" => {
                        self.expect_punct(b'[')?;
                        rec.size = Some(self.num()?);
                        self.expect_punct(b']')?;
                    }
                    other => return self.error(format!("unknown attribute {other}")),
                }
                if self.is_punct(b',') {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            self.expect_punct(b']')?;
        }
        self.end_of_line()?;
        Ok(Node::Record(rec))
    }

    fn field(&mut self) -> Result<FieldDef, SyntaxError> {
        let name = self.ident()?;
        let ty = self.type_expr()?;
        let mut field = FieldDef::new(name, ty);
        if self.is_punct(b'(') {
            self.pos += 1;
            loop {
                let attr = self.ident()?;
                if attr == "overlay" {
                    field.overlay = true;
                } else if let Some(dir) = Dir::parse(&attr) {
                    field.dir = Some(dir);
                } else {
                    return self.error(format!("unknown field attribute {attr}"));
                }
                if self.is_punct(b',') {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            self.expect_punct(b')')?;
        }
        Ok(field)
    }

    fn call(&mut self, name: String) -> Result<Node, SyntaxError> {
        let mut call = CallNode::new(name);
        if !self.is_punct(b')') {
            loop {
                call.args.push(self.field()?);
                if self.is_punct(b',') {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect_punct(b')')?;
        if let Some(Tok::Ident(_)) = self.peek() {
            call.ret = Some(self.type_expr()?);
        }
        if self.is_punct(b'@') {
            self.pos += 1;
            call.opcode = Some(self.num()?);
        }
        self.end_of_line()?;
        Ok(Node::Call(call))
    }

    fn type_expr(&mut self) -> Result<TypeExpr, SyntaxError> {
        let name = self.ident()?;
        let mut args = Vec::new();
        if self.is_punct(b'[') {
            self.pos += 1;
            loop {
                args.push(self.type_arg()?);
                if self.is_punct(b',') {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            self.expect_punct(b']')?;
        }
        Ok(TypeExpr::Ident { name, args })
    }

    fn type_arg(&mut self) -> Result<TypeExpr, SyntaxError> {
        match self.peek() {
            Some(Tok::Num(_)) => {
                let a = self.num()?;
                if self.is_punct(b':') {
                    self.pos += 1;
                    let b = self.num()?;
                    Ok(TypeExpr::Range(a, b))
                } else {
                    Ok(TypeExpr::Int(a))
                }
            }
            Some(Tok::Str(_)) => match self.bump() {
                Some(Tok::Str(s)) => Ok(TypeExpr::Str(s)),
                _ => self.error("expected string"),
            },
            Some(Tok::Ident(_)) => self.type_expr(),
            _ => self.error("expected type argument"),
        }
    }
}

/// Parse a document; generated names of the result start with `prefix`
///
/// # Errors
///
/// Returns the first lexical or grammatical error, or a duplicate name
pub fn parse_document(text: &str, prefix: &str) -> Result<Document, SyntaxError> {
    let toks = lex(text)?;
    Parser { toks, pos: 0 }.document(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"resource fd[int32]: 0xffffffffffffffff
resource fd_tty[fd]

open_flags = 0x1, 0x2, 0x4

names = "a", "b\x00c"

h_INPUT {
	# resolved
	h_len	len[h_data, int8]
	# from the 0th arg of alarm
	h_data	array[int8]
} [packed]

h_u [
	# random
	field_0	array[int8, 4]
	field_1	string[names, 4]
] [size[4]]

h_ovl {
	a	int32 (in, overlay)
}

syz_harness$h_INPUT(buf ptr[in, h_INPUT], len bytesize[buf])

alarm(seconds int32[0:0x10, 2]) fd @37
"#;

    #[test]
    fn test_parse_sample() {
        let doc = parse_document(SAMPLE, "h").unwrap();
        assert_eq!(doc.len(), 8);

        let input = doc.record("h_INPUT").unwrap();
        assert!(input.packed);
        assert!(input.fields[0].resolved);
        assert_eq!(input.fields[1].comments, vec!["from the 0th arg of alarm"]);
        assert!(!input.fields[1].resolved);

        let u = doc.record("h_u").unwrap();
        assert!(u.is_union);
        assert_eq!(u.size, Some(4));
        assert!(u.fields[0].random);

        let ovl = doc.record("h_ovl").unwrap();
        assert!(ovl.fields[0].overlay);
        assert_eq!(ovl.fields[0].dir, Some(Dir::In));

        match doc.get("names") {
            Some(Node::StrFlags(s)) => assert_eq!(s.values[1], b"b\0c".to_vec()),
            other => panic!("unexpected {other:?}"),
        }
        match doc.get("alarm") {
            Some(Node::Call(c)) => {
                assert_eq!(c.opcode, Some(37));
                assert_eq!(c.ret, Some(TypeExpr::ident("fd")));
                assert_eq!(
                    c.args[0].ty,
                    TypeExpr::call(
                        "int32",
                        vec![TypeExpr::Range(0, 16), TypeExpr::Int(2)]
                    )
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        match doc.get("fd") {
            Some(Node::Resource(r)) => assert_eq!(r.values, vec![u64::MAX]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_print_parse_roundtrip() {
        let doc = parse_document(SAMPLE, "h").unwrap();
        let printed = doc.to_string();
        let again = parse_document(&printed, "h").unwrap();
        assert_eq!(again.to_string(), printed);
        assert_eq!(again.fingerprint(), doc.fingerprint());
    }

    #[test]
    fn test_negative_numbers() {
        let doc = parse_document("resource r[int64]: -1\n", "h").unwrap();
        match doc.get("r") {
            Some(Node::Resource(r)) => assert_eq!(r.values, vec![u64::MAX]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_errors_carry_line() {
        let err = parse_document("a {\n\tx int8\n", "h").unwrap_err();
        assert!(err.message.contains("unterminated"));

        let err = parse_document("a = 1\n\nb ?\n", "h").unwrap_err();
        assert_eq!(err.line, 3);

        let err = parse_document("a = 1\na = 2\n", "h").unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_empty_call() {
        let doc = parse_document("getpid() @39\n", "h").unwrap();
        assert_eq!(doc.to_string(), "getpid() @39\n");
    }
}

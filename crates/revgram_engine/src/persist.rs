//! Writing the grammar document for the downstream fuzzer.

use crate::harness::{HARNESS_CALL, HarnessNames, HarnessShape, harness_call};
use revgram_core::Fault;
use revgram_grammar::{
    CompileError, Document, DocumentError, GrammarCompiler, Node, SyntaxError, parse_document,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The printed document does not parse back
    #[error("printed document does not parse: {0}")]
    Syntax(#[from] SyntaxError),

    /// The printed document does not compile
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Export edits broke the document
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Writing failed
    #[error("cannot write {path}: {source}")]
    Io {
        /// Output path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl From<PersistError> for Fault {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::Syntax(e) => e.into(),
            PersistError::Compile(e) => e.into(),
            PersistError::Document(e) => e.into(),
            PersistError::Io { path, source } => Fault::io(path, source),
        }
    }
}

/// Export form of `doc`: one operation per command, each named after the
/// harness shape
///
/// # Errors
///
/// Returns error if a command operation collides with an existing node
pub fn export(
    doc: &Document,
    names: &HarnessNames,
    shape: HarnessShape,
) -> Result<Document, PersistError> {
    let mut out = doc.clone();
    if shape == HarnessShape::Command {
        split_commands(&mut out, names)?;
    }
    annotate_calls(&mut out, shape)?;
    Ok(out)
}

fn split_commands(doc: &mut Document, names: &HarnessNames) -> Result<(), DocumentError> {
    let commands: Vec<String> = doc
        .record(&names.command)
        .map(|r| r.fields.iter().map(|f| f.name.clone()).collect())
        .unwrap_or_default();
    for command in &commands {
        doc.add(Node::Call(harness_call(HARNESS_CALL, command)))?;
    }
    for name in [names.input_call(), names.input.clone(), names.command.clone()] {
        doc.remove(&name);
    }
    Ok(())
}

fn annotate_calls(doc: &mut Document, shape: HarnessShape) -> Result<(), DocumentError> {
    let tagged = format!("{HARNESS_CALL}_type{}", shape.type_number());
    let renames: Vec<(String, String)> = doc
        .calls()
        .filter(|c| c.name.starts_with(HARNESS_CALL))
        .map(|c| (c.name.clone(), c.name.replacen(HARNESS_CALL, &tagged, 1)))
        .collect();
    for (old, new) in renames {
        doc.rename(&old, &new)?;
    }
    Ok(())
}

/// Print `doc`, check the text parses and compiles, and write it to `path`
///
/// Returns the exported document that was written.
///
/// # Errors
///
/// Returns error if the exported form fails to round-trip or compile, or
/// if the file cannot be written
pub fn save<C: GrammarCompiler>(
    compiler: &C,
    base: &[Document],
    doc: &Document,
    names: &HarnessNames,
    shape: HarnessShape,
    path: &Path,
) -> Result<Document, PersistError> {
    let exported = export(doc, names, shape)?;
    let text = exported.to_string();
    let reparsed = parse_document(&text, exported.prefix())?;
    compiler.compile(base, &reparsed)?;
    write_text(path, &text)?;
    info!(
        path = %path.display(),
        fingerprint = %reparsed.fingerprint(),
        nodes = reparsed.len(),
        "saved grammar"
    );
    Ok(reparsed)
}

/// Write `text` to `path`, creating parent directories
///
/// # Errors
///
/// Returns error if a directory or the file cannot be written
pub fn write_text(path: &Path, text: &str) -> Result<(), PersistError> {
    let io = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    std::fs::write(path, text).map_err(io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revgram_grammar::SurfaceCompiler;

    const COMMANDS: &str = "h_open {
	# resolved
	path	string
}
h_read {
	# resolved
	n	int32
}
h_COMMAND [
	h_open	h_open
	h_read	h_read
] [varlen]
h_INPUT {
	# resolved
	h_COMMAND_CNT	len[h_COMMAND, int8]
	# resolved
	h_COMMAND	array[h_COMMAND]
} [packed]
syz_harness$h_INPUT(buf ptr[in, h_INPUT], len bytesize[buf])
";

    #[test]
    fn test_command_export() {
        let names = HarnessNames::new("h");
        let doc = parse_document(COMMANDS, "h").unwrap();
        let out = export(&doc, &names, HarnessShape::Command).unwrap();
        assert!(!out.contains("h_INPUT"));
        assert!(!out.contains("h_COMMAND"));
        assert!(!out.contains("syz_harness$h_INPUT"));
        let calls: Vec<&str> = out.calls().map(|c| c.name.as_str()).collect();
        assert_eq!(calls, ["syz_harness_type2$h_open", "syz_harness_type2$h_read"]);
        SurfaceCompiler::new().compile(&[], &out).unwrap();
    }

    #[test]
    fn test_save_writes_reparsable_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("h.txt");
        let names = HarnessNames::new("h");
        let doc = parse_document(
            "h_INPUT {\n\t# resolved\n\tv\tint32\n} [packed]\nsyz_harness$h_INPUT(buf ptr[in, h_INPUT], len bytesize[buf])\n",
            "h",
        )
        .unwrap();
        let saved = save(&SurfaceCompiler::new(), &[], &doc, &names, HarnessShape::Base, &path)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("syz_harness_type1$h_INPUT"));
        assert_eq!(parse_document(&text, "h").unwrap(), saved);
        // The session document itself keeps its working names.
        assert!(doc.calls().any(|c| c.name == "syz_harness$h_INPUT"));
    }

    #[test]
    fn test_save_rejects_uncompilable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.txt");
        let doc = parse_document("h_INPUT {\n\tv\tmissing_type\n}\n", "h").unwrap();
        let err = save(
            &SurfaceCompiler::new(),
            &[],
            &doc,
            &HarnessNames::new("h"),
            HarnessShape::Base,
            &path,
        )
        .unwrap_err();
        assert!(matches!(err, PersistError::Compile(_)));
        assert!(!path.exists());
    }
}

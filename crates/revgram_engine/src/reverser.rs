//! The reversal loop.
//!
//! A session starts from a document lowered from the field specification
//! (or a single opaque blob when that does not compile) and then repeats:
//! sample an input from the current grammar, trace it next to its
//! complement, infer field types from the bytes that reappear in the
//! traces, and persist the result. It stops when every field the harness
//! consumes is resolved, or when the iteration budget runs out.

use crate::config::ReverserConfig;
use crate::harness::{
    HARNESS_CALL, HarnessNames, HarnessShape, default_document, detect_shape, harness_call,
    is_done, limit_to_single_command, restore_command_fields, unflatten_commands,
};
use crate::persist;
use crate::repair::repair;
use crate::tracer::{TraceSource, TracerProcess};
use revgram_core::{Fault, FaultResult, SessionId};
use revgram_fieldspec::{FieldSpec, lower};
use revgram_grammar::{
    Catalogue, Document, GrammarCompiler, Node, SurfaceCompiler, TypeDescriptor, TypeRef,
};
use revgram_infer::{InferenceReport, Run, Sampler, infer_fields, serialize_with_layout};
use revgram_match::MatchConfig;
use revgram_trace::ArityTable;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn};

/// Result of one iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Some field's candidate types changed
    Progress(InferenceReport),
    /// Nothing new was learned
    NoProgress,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    /// Every consumed field is resolved
    Converged {
        /// Iterations run
        iterations: usize,
    },
    /// The iteration or stale budget ran out first
    Exhausted {
        /// Iterations run
        iterations: usize,
    },
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged { iterations } => write!(f, "converged after {iterations} iterations"),
            Self::Exhausted { iterations } => {
                write!(f, "gave up after {iterations} iterations")
            }
        }
    }
}

/// Mutable state of one reversal
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    doc: Document,
    shape: HarnessShape,
    iteration: usize,
    stale: usize,
    seed: u64,
}

impl Session {
    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current document
    #[must_use]
    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Harness shape
    #[must_use]
    pub fn shape(&self) -> HarnessShape {
        self.shape
    }

    /// Iterations run so far
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Consecutive iterations without progress
    #[must_use]
    pub fn stale(&self) -> usize {
        self.stale
    }
}

/// Grammar reverser for one harness
pub struct Reverser<S, C> {
    config: ReverserConfig,
    names: HarnessNames,
    base: Vec<Document>,
    source: S,
    compiler: C,
    match_config: MatchConfig,
    session: Session,
}

impl<S: TraceSource, C: GrammarCompiler> Reverser<S, C> {
    /// Create a reverser over the `base` operation catalogue
    #[must_use]
    pub fn new(config: ReverserConfig, base: Vec<Document>, source: S, compiler: C) -> Self {
        let names = HarnessNames::new(&config.harness_id);
        let session = Session {
            id: SessionId::new(),
            doc: Document::new(config.harness_id.clone()),
            shape: HarnessShape::Base,
            iteration: 0,
            stale: 0,
            seed: config.seed,
        };
        Self {
            config,
            names,
            base,
            source,
            compiler,
            match_config: MatchConfig::linux(),
            session,
        }
    }

    /// Replace the matcher configuration
    #[must_use]
    pub fn with_match_config(mut self, match_config: MatchConfig) -> Self {
        self.match_config = match_config;
        self
    }

    /// Session state
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Current document
    #[must_use]
    pub fn document(&self) -> &Document {
        &self.session.doc
    }

    /// Build the first document and persist it
    ///
    /// # Errors
    ///
    /// Returns error if neither the lowered specification nor the default
    /// document compiles, or if the first save fails
    pub fn initialize(&mut self, spec: Option<&FieldSpec>) -> FaultResult<()> {
        let (doc, shape) = self.initial_document(spec)?;
        info!(
            session = %self.session.id,
            shape = %shape,
            nodes = doc.len(),
            fingerprint = %doc.fingerprint(),
            "initial document ready"
        );
        self.session.doc = doc;
        self.session.shape = shape;
        self.save()?;
        Ok(())
    }

    fn initial_document(&self, spec: Option<&FieldSpec>) -> FaultResult<(Document, HarnessShape)> {
        let id = &self.config.harness_id;
        let mut previous = None;
        let mut shape = HarnessShape::Base;
        match spec.map(|s| lower(s, id)) {
            Some(Ok(mut doc)) => {
                doc.add(Node::Call(harness_call(HARNESS_CALL, &self.names.input)))?;
                shape = detect_shape(&doc, &self.names);
                unflatten_commands(&mut doc, &self.names, shape)?;
                match repair(&self.compiler, &self.base, &mut doc, self.config.repair_rounds) {
                    Ok(_) => return Ok((doc, shape)),
                    Err(e) => warn!(error = %e, "lowered specification does not compile"),
                }
                previous = Some(doc);
            }
            Some(Err(e)) => warn!(error = %e, "cannot lower field specification"),
            None => debug!("no field specification, starting from an opaque input"),
        }
        let mut doc = default_document(&self.names, shape, previous.as_ref())?;
        repair(&self.compiler, &self.base, &mut doc, self.config.repair_rounds)?;
        info!(shape = %shape, "using default document");
        Ok((doc, shape))
    }

    /// Iterate until convergence or until the budget runs out
    ///
    /// # Errors
    ///
    /// Returns the first fault that is not confined to one iteration
    pub fn run(&mut self) -> FaultResult<SessionOutcome> {
        let span = info_span!("session", id = %self.session.id);
        let _guard = span.enter();
        loop {
            let iterations = self.session.iteration;
            if is_done(&self.session.doc, &self.names, self.session.shape) {
                info!(iterations, "all fields resolved");
                return Ok(SessionOutcome::Converged { iterations });
            }
            if iterations >= self.config.max_iterations
                || self.session.stale >= self.config.max_stale_iterations
            {
                info!(iterations, stale = self.session.stale, "budget exhausted");
                return Ok(SessionOutcome::Exhausted { iterations });
            }
            self.step()?;
        }
    }

    /// Run one iteration and persist its result
    ///
    /// Iteration-local faults are absorbed: the document goes back to the
    /// last persisted copy and the iteration counts as stale.
    ///
    /// # Errors
    ///
    /// Returns any other fault
    pub fn step(&mut self) -> FaultResult<IterationOutcome> {
        let backup = self.session.doc.clone();
        let iteration = self.session.iteration;
        let outcome = self.iterate();
        self.session.iteration += 1;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(fault) if fault.is_iteration_local() => {
                warn!(iteration, kind = fault.label(), error = %fault, "iteration abandoned");
                self.session.doc = backup;
                self.session.stale += 1;
                return Ok(IterationOutcome::NoProgress);
            }
            Err(fault) => return Err(fault),
        };
        match &outcome {
            IterationOutcome::Progress(report) => {
                info!(iteration, spans = report.spans, fields = report.resolved.len(), "progress");
                self.session.stale = 0;
            }
            IterationOutcome::NoProgress => {
                debug!(iteration, "no progress");
                self.session.stale += 1;
            }
        }
        if let Err(fault) = self.save() {
            warn!(iteration, error = %fault, "save failed, rolling back");
            self.session.doc = backup;
            self.session.stale += 1;
            return Ok(IterationOutcome::NoProgress);
        }
        Ok(outcome)
    }

    fn iterate(&mut self) -> FaultResult<IterationOutcome> {
        let iteration = self.session.iteration;
        let mut working = limit_to_single_command(&self.session.doc, &self.names, self.session.shape);
        let cat = repair(&self.compiler, &self.base, &mut working, self.config.repair_rounds)?;
        let input = self.input_type(&cat)?;

        let seed = self.session.seed.wrapping_add(iteration as u64);
        let Some(sample) = Sampler::new(&cat, seed).sample(input)? else {
            debug!(iteration, seed, "no sample with distinct data values");
            return Ok(IterationOutcome::NoProgress);
        };
        let complement = sample.complement();
        let seeds_dir = self.config.work_dir.join("seeds");
        std::fs::create_dir_all(&seeds_dir).map_err(|e| Fault::io(&seeds_dir, e))?;

        let mut blobs = Vec::with_capacity(2);
        let mut paths = Vec::with_capacity(2);
        for (n, sample) in [&sample, &complement].into_iter().enumerate() {
            let (blob, layout) = serialize_with_layout(sample, &cat);
            let path = seeds_dir.join(format!("{iteration}-{n}.bin"));
            std::fs::write(&path, &blob).map_err(|e| Fault::io(&path, e))?;
            debug!(iteration, blob = %path.display(), len = blob.len(), "wrote sample");
            blobs.push((blob, layout));
            paths.push(path);
        }

        let traces = [self.source.trace(&paths[0])?, self.source.trace(&paths[1])?];
        let runs = [0, 1].map(|i| Run {
            blob: &blobs[i].0,
            layout: &blobs[i].1,
            trace: &traces[i],
        });
        let report = infer_fields(&mut working, &cat, &self.match_config, runs)?;

        if self.session.shape == HarnessShape::Command {
            restore_command_fields(&mut working, &self.session.doc, &self.names);
        }
        self.session.doc = working;
        if report.progressed {
            Ok(IterationOutcome::Progress(report))
        } else {
            remove_seeds(&paths);
            Ok(IterationOutcome::NoProgress)
        }
    }

    fn input_type(&self, cat: &Catalogue) -> FaultResult<TypeRef> {
        let call = self.names.input_call();
        let pointer = cat
            .signature_by_name(&call)
            .and_then(|(_, sig)| sig.args.first())
            .and_then(|arg| cat.get(arg.ty));
        match pointer {
            Some(TypeDescriptor::Pointer { elem, .. }) => Ok(*elem),
            _ => Err(Fault::Consistency {
                reason: format!("{call} does not take a pointer to the input"),
            }),
        }
    }

    /// Persist the current document to the configured output
    ///
    /// # Errors
    ///
    /// Returns error if the document does not survive export or cannot be
    /// written
    pub fn save(&self) -> FaultResult<PathBuf> {
        persist::save(
            &self.compiler,
            &self.base,
            &self.session.doc,
            &self.names,
            self.session.shape,
            &self.config.output,
        )?;
        Ok(self.config.output.clone())
    }
}

/// Reverse the harness described by `config` against the production
/// tracer and compiler
///
/// # Errors
///
/// Returns the first fault that ends the session
pub fn reverse(config: &ReverserConfig) -> FaultResult<SessionOutcome> {
    let base = load_base(&config.base)?;
    let spec = config
        .fieldspec
        .as_deref()
        .map(revgram_fieldspec::parse_file)
        .transpose()
        .unwrap_or_else(|e| {
            warn!(error = %e, "cannot read field specification");
            None
        });
    let tracer = TracerProcess::spawn(&config.tracer, &config.work_dir, ArityTable::linux_x86_64())?;
    let mut reverser = Reverser::new(config.clone(), base, tracer, SurfaceCompiler::new());
    reverser.initialize(spec.as_ref())?;
    let outcome = reverser.run()?;
    info!(outcome = %outcome, output = %config.output.display(), "session finished");
    Ok(outcome)
}

fn remove_seeds(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            debug!(blob = %path.display(), error = %e, "cannot remove seed");
        }
    }
}

/// Load base catalogue documents from grammar files
///
/// # Errors
///
/// Returns error if a file cannot be read or parsed
pub fn load_base(paths: &[PathBuf]) -> FaultResult<Vec<Document>> {
    paths.iter().map(|p| load_document(p)).collect()
}

fn load_document(path: &Path) -> FaultResult<Document> {
    let text = std::fs::read_to_string(path).map_err(|e| Fault::io(path, e))?;
    let prefix = path
        .file_stem()
        .map_or_else(|| "base".to_string(), |s| s.to_string_lossy().into_owned());
    let doc = revgram_grammar::parse_document(&text, &prefix)?;
    debug!(path = %path.display(), nodes = doc.len(), "loaded base document");
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::TracerError;
    use revgram_grammar::{SurfaceCompiler, TypeExpr, parse_document};
    use revgram_trace::{Trace, TraceEvent};

    const BASE: &str = "alarm(seconds int32) @37\n";

    /// Harness that passes the first four input bytes to `alarm`
    struct AlarmHarness {
        requests: usize,
    }

    impl TraceSource for AlarmHarness {
        fn trace(&mut self, blob: &Path) -> Result<Trace, TracerError> {
            self.requests += 1;
            let bytes = std::fs::read(blob)?;
            let mut word = [0u8; 4];
            let n = bytes.len().min(4);
            word[..n].copy_from_slice(&bytes[..n]);
            let seconds = u64::from(u32::from_le_bytes(word));
            Ok(Trace::new(vec![TraceEvent::new(37, vec![seconds])]))
        }
    }

    /// Harness that checks a fixed prefix and passes the next four bytes
    /// to `alarm`
    struct GatedHarness {
        prefix: Vec<u8>,
        rejected: usize,
    }

    impl GatedHarness {
        fn new(prefix: &[u8]) -> Self {
            Self {
                prefix: prefix.to_vec(),
                rejected: 0,
            }
        }
    }

    impl TraceSource for GatedHarness {
        fn trace(&mut self, blob: &Path) -> Result<Trace, TracerError> {
            let bytes = std::fs::read(blob)?;
            let n = self.prefix.len();
            let word = bytes
                .get(n..n + 4)
                .filter(|_| bytes.starts_with(&self.prefix))
                .and_then(|w| <[u8; 4]>::try_from(w).ok());
            let Some(word) = word else {
                self.rejected += 1;
                return Ok(Trace::new(vec![TraceEvent::new(37, vec![5])]));
            };
            let seconds = u64::from(u32::from_le_bytes(word));
            Ok(Trace::new(vec![TraceEvent::new(37, vec![seconds])]))
        }
    }

    /// Harness whose traces never depend on the input
    struct SilentHarness;

    impl TraceSource for SilentHarness {
        fn trace(&mut self, _blob: &Path) -> Result<Trace, TracerError> {
            Ok(Trace::new(vec![TraceEvent::new(37, vec![5])]))
        }
    }

    /// Harness whose tracer has gone away
    struct DeadHarness;

    impl TraceSource for DeadHarness {
        fn trace(&mut self, _blob: &Path) -> Result<Trace, TracerError> {
            Err(TracerError::Closed {
                expected: "Enter the blob path:".to_string(),
            })
        }
    }

    fn config(dir: &Path) -> ReverserConfig {
        ReverserConfig::default()
            .with_harness_id("h")
            .with_work_dir(dir.join("work"))
            .with_output(dir.join("h.txt"))
            .with_seed(7)
            .with_max_iterations(16)
            .with_max_stale_iterations(3)
    }

    fn base() -> Vec<Document> {
        vec![parse_document(BASE, "base").unwrap()]
    }

    fn spec(text: &str) -> FieldSpec {
        revgram_fieldspec::parse(text).unwrap()
    }

    #[test]
    fn test_single_integer_field_converges() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Reverser::new(
            config(dir.path()),
            base(),
            AlarmHarness { requests: 0 },
            SurfaceCompiler::new(),
        );
        rev.initialize(Some(&spec("INPUT ::= value{size: 4}\n"))).unwrap();
        assert_eq!(rev.session().shape(), HarnessShape::Base);

        let outcome = rev.run().unwrap();
        let SessionOutcome::Converged { iterations } = outcome else {
            panic!("did not converge: {outcome}");
        };
        assert!(iterations >= 1 && iterations <= 16);
        assert_eq!(rev.source.requests, 2 * iterations);

        let doc = rev.document();
        let field = doc.record("h_INPUT").unwrap().field("h_value").unwrap();
        assert!(field.resolved);
        let union = doc.record(field.ty.name().unwrap()).unwrap();
        assert!(union.fields.iter().any(|f| f.ty.to_string() == "int32"));
        assert!(union.fields.iter().all(|f| !f.random));

        let compiler = SurfaceCompiler::new();
        let first = compiler.compile(&base(), doc).unwrap();
        let second = compiler.compile(&base(), doc).unwrap();
        assert_eq!(first, second);

        let saved = std::fs::read_to_string(dir.path().join("h.txt")).unwrap();
        let reloaded = parse_document(&saved, "h").unwrap();
        assert_eq!(reloaded.hash_node("h_INPUT"), doc.hash_node("h_INPUT"));
        assert!(saved.contains("syz_harness_type1$h_INPUT"));
        assert!(saved.contains("int32"));
        assert!(dir.path().join("work/seeds/0-0.bin").exists());
    }

    #[test]
    fn test_unrelated_harness_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Reverser::new(config(dir.path()), base(), SilentHarness, SurfaceCompiler::new());
        rev.initialize(Some(&spec("INPUT ::= value{size: 4}\n"))).unwrap();
        let outcome = rev.run().unwrap();
        assert_eq!(outcome, SessionOutcome::Exhausted { iterations: 3 });
        assert_eq!(rev.session().stale(), 3);
        // Samples of fruitless iterations are discarded.
        assert!(!dir.path().join("work/seeds/0-0.bin").exists());
        assert!(dir.path().join("h.txt").exists());
    }

    #[test]
    fn test_collaborator_fault_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Reverser::new(config(dir.path()), base(), DeadHarness, SurfaceCompiler::new());
        rev.initialize(Some(&spec("INPUT ::= value{size: 4}\n"))).unwrap();
        let before = rev.document().clone();
        assert_eq!(rev.step().unwrap(), IterationOutcome::NoProgress);
        assert_eq!(rev.document(), &before);
        assert_eq!(rev.session().iteration(), 1);
        assert_eq!(rev.session().stale(), 1);
    }

    #[test]
    fn test_without_spec_uses_default_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Reverser::new(config(dir.path()), base(), SilentHarness, SurfaceCompiler::new());
        rev.initialize(None).unwrap();
        let input = rev.document().record("h_INPUT").unwrap();
        assert_eq!(input.fields[0].ty.to_string(), "array[int8]");
    }

    #[test]
    fn test_command_spec_keeps_command_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Reverser::new(config(dir.path()), base(), SilentHarness, SurfaceCompiler::new());
        let text = "INPUT ::= COMMAND_CNT{size: 1}
          COMMAND[COMMAND_CNT]
COMMAND ::= OPEN
          | CLOSE
OPEN ::= path{}
CLOSE ::= fd{size: 4}
";
        rev.initialize(Some(&spec(text))).unwrap();
        assert_eq!(rev.session().shape(), HarnessShape::Command);
        rev.step().unwrap();
        // The per-iteration limit never leaks into the session document.
        let input = rev.document().record("h_INPUT").unwrap();
        assert_eq!(input.field("h_COMMAND").unwrap().ty.to_string(), "array[h_COMMAND]");
        let saved = std::fs::read_to_string(dir.path().join("h.txt")).unwrap();
        assert!(saved.contains("syz_harness_type2$h_OPEN"));
        assert!(saved.contains("syz_harness_type2$h_CLOSE"));
    }

    #[test]
    fn test_magic_prefixed_input_converges() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Reverser::new(
            config(dir.path()),
            base(),
            GatedHarness::new(b"FGOL"),
            SurfaceCompiler::new(),
        );
        let text = "INPUT ::= magic{size: 4, value: 0x4c4f4746}
          value{size: 4}
";
        rev.initialize(Some(&spec(text))).unwrap();

        let outcome = rev.run().unwrap();
        assert!(matches!(outcome, SessionOutcome::Converged { .. }), "{outcome}");
        // Both blobs of every pair carry the magic unchanged.
        assert_eq!(rev.source.rejected, 0);

        let input = rev.document().record("h_INPUT").unwrap();
        assert_eq!(
            input.field("h_magic").unwrap().ty,
            TypeExpr::call("int32", vec![TypeExpr::Int(0x4c4f_4746)])
        );
        let value = input.field("h_value").unwrap();
        assert!(value.resolved);
        let union = rev.document().record(value.ty.name().unwrap()).unwrap();
        assert!(union.fields.iter().any(|f| f.ty.to_string() == "int32"));
    }

    #[test]
    fn test_command_harness_converges() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Reverser::new(
            config(dir.path()),
            base(),
            GatedHarness::new(&[1]),
            SurfaceCompiler::new(),
        );
        let text = "INPUT ::= COMMAND_CNT{size: 1}
          COMMAND[COMMAND_CNT]
COMMAND ::= SET
SET ::= value{size: 4}
";
        rev.initialize(Some(&spec(text))).unwrap();
        assert_eq!(rev.session().shape(), HarnessShape::Command);

        let outcome = rev.run().unwrap();
        assert!(matches!(outcome, SessionOutcome::Converged { .. }), "{outcome}");
        // The single-command count survives complementing.
        assert_eq!(rev.source.rejected, 0);

        let doc = rev.document();
        let value = doc.record("h_SET").unwrap().field("h_value").unwrap();
        assert!(value.resolved);
        let input = doc.record("h_INPUT").unwrap();
        assert_eq!(input.field("h_COMMAND").unwrap().ty.to_string(), "array[h_COMMAND]");
        let saved = std::fs::read_to_string(dir.path().join("h.txt")).unwrap();
        assert!(saved.contains("syz_harness_type2$h_SET"));
        assert!(saved.contains("int32"));
    }

    #[test]
    fn test_load_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linux.txt");
        std::fs::write(&path, BASE).unwrap();
        let docs = load_base(&[path]).unwrap();
        assert!(docs[0].calls().any(|c| c.name == "alarm"));
        let missing = load_base(&[dir.path().join("nope.txt")]).unwrap_err();
        assert!(matches!(missing, Fault::Io { .. }));
    }
}

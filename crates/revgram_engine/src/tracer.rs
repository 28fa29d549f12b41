//! Client for the trace-generation process.
//!
//! The tracer is a long-lived child that boots the target once and then
//! answers one request at a time over its standard streams:
//!
//! ```text
//! <- SkyTracer is ready
//! <- Enter the blob path:
//! -> /work/seeds/0-0.bin
//! <- Here is the trace path:
//! <- /work/traces/0-0.log
//! ```
//!
//! Anything else the tracer prints between those lines is logged and
//! skipped.

use crate::config::{ProtocolLines, TracerConfig};
use revgram_core::Fault;
use revgram_trace::{ArityTable, DecodeError, Trace, TraceDecoder};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

/// Tracer errors
#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    /// The process could not be started
    #[error("cannot start tracer {program}: {source}")]
    Spawn {
        /// Program path
        program: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Output ended while waiting for a protocol line
    #[error("tracer closed its output while waiting for {expected:?}")]
    Closed {
        /// Line being waited for
        expected: String,
    },

    /// Reading or writing the pipes failed
    #[error("tracer pipe failed: {0}")]
    Io(#[from] std::io::Error),

    /// The returned trace could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<TracerError> for Fault {
    fn from(err: TracerError) -> Self {
        match err {
            TracerError::Decode(e) => e.into(),
            other => Fault::Collaborator {
                reason: other.to_string(),
            },
        }
    }
}

/// Something that turns a blob into an execution trace
pub trait TraceSource {
    /// Run the harness on the blob stored at `blob` and return its trace
    ///
    /// # Errors
    ///
    /// Returns error if the trace cannot be produced or decoded
    fn trace(&mut self, blob: &Path) -> Result<Trace, TracerError>;
}

/// Line protocol over any pair of streams
pub struct LineClient<R, W> {
    reader: R,
    writer: W,
    lines: ProtocolLines,
    decoder: TraceDecoder,
}

impl<R: BufRead, W: Write> LineClient<R, W> {
    /// Wrap a connected pair of streams
    #[must_use]
    pub fn new(reader: R, writer: W, lines: ProtocolLines, arity: ArityTable) -> Self {
        Self {
            reader,
            writer,
            lines,
            decoder: TraceDecoder::new(arity),
        }
    }

    /// Block until the tracer announces it is ready
    ///
    /// # Errors
    ///
    /// Returns error if the stream ends first
    pub fn wait_ready(&mut self) -> Result<(), TracerError> {
        let ready = self.lines.ready.clone();
        self.wait_for(&ready)
    }

    /// Ask for the trace of the blob at `blob`, returning the log path
    ///
    /// # Errors
    ///
    /// Returns error if the exchange is cut short
    pub fn request(&mut self, blob: &Path) -> Result<PathBuf, TracerError> {
        let prompt = self.lines.prompt.clone();
        self.wait_for(&prompt)?;
        writeln!(self.writer, "{}", blob.display())?;
        self.writer.flush()?;
        let label = self.lines.label.clone();
        self.wait_for(&label)?;
        let path = self.read_line()?.ok_or(TracerError::Closed {
            expected: "trace path".to_string(),
        })?;
        Ok(PathBuf::from(path))
    }

    fn wait_for(&mut self, expected: &str) -> Result<(), TracerError> {
        loop {
            match self.read_line()? {
                Some(line) if line == expected => return Ok(()),
                Some(line) => debug!(line = %line, "tracer"),
                None => {
                    return Err(TracerError::Closed {
                        expected: expected.to_string(),
                    });
                }
            }
        }
    }

    fn read_line(&mut self) -> Result<Option<String>, TracerError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

impl<R: BufRead, W: Write> TraceSource for LineClient<R, W> {
    fn trace(&mut self, blob: &Path) -> Result<Trace, TracerError> {
        let log = self.request(blob)?;
        let trace = self.decoder.decode_file(&log)?;
        debug!(blob = %blob.display(), log = %log.display(), events = trace.len(), "traced blob");
        Ok(trace)
    }
}

/// The production tracer running as a child process
pub struct TracerProcess {
    child: Child,
    client: LineClient<BufReader<ChildStdout>, ChildStdin>,
}

impl TracerProcess {
    /// Start the tracer and wait until it is ready
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be started or exits early
    pub fn spawn(
        config: &TracerConfig,
        work_dir: &Path,
        arity: ArityTable,
    ) -> Result<Self, TracerError> {
        let spawn_err = |source| TracerError::Spawn {
            program: config.program.clone(),
            source,
        };
        let mut child = Command::new(&config.program)
            .args(config.args(work_dir))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(spawn_err(std::io::Error::other("standard streams not piped")));
        };
        let mut process = Self {
            child,
            client: LineClient::new(BufReader::new(stdout), stdin, config.lines.clone(), arity),
        };
        process.client.wait_ready()?;
        info!(program = %config.program.display(), pid = process.child.id(), "tracer ready");
        Ok(process)
    }
}

impl TraceSource for TracerProcess {
    fn trace(&mut self, blob: &Path) -> Result<Trace, TracerError> {
        self.client.trace(blob)
    }
}

impl Drop for TracerProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!(error = %e, "cannot stop tracer");
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revgram_trace::{TraceEvent, encode_trace};
    use std::io::Cursor;

    fn client(script: &str) -> LineClient<Cursor<Vec<u8>>, Vec<u8>> {
        LineClient::new(
            Cursor::new(script.as_bytes().to_vec()),
            Vec::new(),
            ProtocolLines::default(),
            ArityTable::uniform(1),
        )
    }

    #[test]
    fn test_request_round() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("t.log");
        let trace = Trace::new(vec![TraceEvent::new(37, vec![5]).with_retval(0)]);
        std::fs::write(&log, encode_trace(&trace).unwrap()).unwrap();

        let script = format!(
            "booting\nSkyTracer is ready\nEnter the blob path:\nnoise\nHere is the trace path:\n{}\n",
            log.display()
        );
        let mut c = client(&script);
        c.wait_ready().unwrap();
        let got = c.trace(Path::new("/tmp/blob.bin")).unwrap();
        assert_eq!(got, trace);
        assert_eq!(c.writer, b"/tmp/blob.bin\n");
    }

    #[test]
    fn test_premature_end() {
        let mut c = client("SkyTracer is ready\nEnter the blob path:\n");
        c.wait_ready().unwrap();
        let err = c.trace(Path::new("b")).unwrap_err();
        assert!(matches!(err, TracerError::Closed { ref expected } if expected == "Here is the trace path:"));
        assert!(matches!(Fault::from(err), Fault::Collaborator { .. }));
    }

    #[test]
    fn test_bad_log_is_decode_fault() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("bad.log");
        std::fs::write(&log, [9u8]).unwrap();
        let script = format!(
            "Enter the blob path:\nHere is the trace path:\n{}\n",
            log.display()
        );
        let err = client(&script).trace(Path::new("b")).unwrap_err();
        assert!(matches!(Fault::from(err), Fault::Decode { .. }));
    }

    #[test]
    fn test_spawn_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let config = TracerConfig::default().with_program(dir.path().join("no-such-tracer"));
        let err = TracerProcess::spawn(&config, dir.path(), ArityTable::linux_x86_64())
            .err()
            .unwrap();
        assert!(matches!(err, TracerError::Spawn { .. }));
    }
}

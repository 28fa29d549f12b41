//! Reverser and tracer configuration.
//!
//! Both structs deserialize from JSON with every field optional, so a
//! config file only needs the values that differ from the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this schema
    #[error("invalid config {path}: {source}")]
    Parse {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// A required value is missing or out of range
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Setting name
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

/// Literal lines of the tracer's line protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolLines {
    /// Printed once after start-up
    pub ready: String,
    /// Printed before each request
    pub prompt: String,
    /// Printed before the trace path
    pub label: String,
}

impl Default for ProtocolLines {
    fn default() -> Self {
        Self {
            ready: "SkyTracer is ready".to_string(),
            prompt: "Enter the blob path:".to_string(),
            label: "Here is the trace path:".to_string(),
        }
    }
}

/// How to start the trace-generation process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Tracer executable
    pub program: PathBuf,
    /// Kernel directory handed to the tracer
    pub kernel: PathBuf,
    /// Harness file handed to the tracer
    pub harness: PathBuf,
    /// Tracer work directory, the reverser's when unset
    pub work_dir: Option<PathBuf>,
    /// Per-trace timeout in seconds, enforced by the tracer
    pub timeout_secs: u64,
    /// Protocol lines
    pub lines: ProtocolLines,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("skytracer"),
            kernel: PathBuf::new(),
            harness: PathBuf::new(),
            work_dir: None,
            timeout_secs: 60,
            lines: ProtocolLines::default(),
        }
    }
}

impl TracerConfig {
    /// Set the tracer executable
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Set the kernel directory
    #[must_use]
    pub fn with_kernel(mut self, kernel: impl Into<PathBuf>) -> Self {
        self.kernel = kernel.into();
        self
    }

    /// Set the harness file
    #[must_use]
    pub fn with_harness(mut self, harness: impl Into<PathBuf>) -> Self {
        self.harness = harness.into();
        self
    }

    /// Set the per-trace timeout
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Command-line arguments for the tracer process
    #[must_use]
    pub fn args(&self, work_dir: &Path) -> Vec<String> {
        let work_dir = self.work_dir.as_deref().unwrap_or(work_dir);
        vec![
            self.kernel.display().to_string(),
            self.harness.display().to_string(),
            "--workdir".to_string(),
            work_dir.display().to_string(),
            "--no_load".to_string(),
            "--monitor".to_string(),
            "--timeout".to_string(),
            self.timeout_secs.to_string(),
        ]
    }
}

/// Reversal session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverserConfig {
    /// Harness id, the prefix of every generated name
    pub harness_id: String,
    /// Field specification to start from
    pub fieldspec: Option<PathBuf>,
    /// Grammar files holding the base operation catalogue
    pub base: Vec<PathBuf>,
    /// Directory for seeds and tracer output
    pub work_dir: PathBuf,
    /// Where the grammar document is written
    pub output: PathBuf,
    /// Sampling seed
    pub seed: u64,
    /// Iteration budget
    pub max_iterations: usize,
    /// Iterations without progress before giving up
    pub max_stale_iterations: usize,
    /// Reconnection rounds when the compiler reports unused nodes
    pub repair_rounds: usize,
    /// Trace-generation process
    pub tracer: TracerConfig,
}

impl Default for ReverserConfig {
    fn default() -> Self {
        Self {
            harness_id: String::new(),
            fieldspec: None,
            base: Vec::new(),
            work_dir: PathBuf::from("work"),
            output: PathBuf::from("harness.txt"),
            seed: 0,
            max_iterations: 64,
            max_stale_iterations: 8,
            repair_rounds: 10,
            tracer: TracerConfig::default(),
        }
    }
}

impl ReverserConfig {
    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Set the harness id
    #[must_use]
    pub fn with_harness_id(mut self, id: impl Into<String>) -> Self {
        self.harness_id = id.into();
        self
    }

    /// Set the field specification path
    #[must_use]
    pub fn with_fieldspec(mut self, path: impl Into<PathBuf>) -> Self {
        self.fieldspec = Some(path.into());
        self
    }

    /// Add a base catalogue file
    #[must_use]
    pub fn with_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.base.push(path.into());
        self
    }

    /// Set the work directory
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Set the output path
    #[must_use]
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = path.into();
        self
    }

    /// Set the sampling seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the iteration budget
    #[must_use]
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    /// Set the stale iteration limit
    #[must_use]
    pub fn with_max_stale_iterations(mut self, n: usize) -> Self {
        self.max_stale_iterations = n;
        self
    }

    /// Set the number of repair rounds
    #[must_use]
    pub fn with_repair_rounds(mut self, n: usize) -> Self {
        self.repair_rounds = n;
        self
    }

    /// Set the tracer configuration
    #[must_use]
    pub fn with_tracer(mut self, tracer: TracerConfig) -> Self {
        self.tracer = tracer;
        self
    }

    /// Check values the session cannot run without
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_id = !self.harness_id.is_empty()
            && self
                .harness_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_id {
            return Err(ConfigError::Invalid {
                field: "harness_id",
                reason: format!("{:?} is not an identifier", self.harness_id),
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "max_iterations",
                reason: "must be positive".to_string(),
            });
        }
        if self.output.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "output",
                reason: "must be set".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rev.json");
        std::fs::write(
            &path,
            r#"{"harness_id": "h1", "seed": 9, "tracer": {"timeout_secs": 5}}"#,
        )
        .unwrap();
        let config = ReverserConfig::from_json_file(&path).unwrap();
        assert_eq!(config.harness_id, "h1");
        assert_eq!(config.seed, 9);
        assert_eq!(config.repair_rounds, 10);
        assert_eq!(config.tracer.timeout_secs, 5);
        assert_eq!(config.tracer.lines, ProtocolLines::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rev.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            ReverserConfig::from_json_file(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            ReverserConfig::from_json_file(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_validate() {
        assert!(ReverserConfig::default().validate().is_err());
        assert!(
            ReverserConfig::default()
                .with_harness_id("bad id")
                .validate()
                .is_err()
        );
        assert!(
            ReverserConfig::default()
                .with_harness_id("h")
                .with_max_iterations(0)
                .validate()
                .is_err()
        );
        assert!(ReverserConfig::default().with_harness_id("h").validate().is_ok());
    }

    #[test]
    fn test_tracer_args() {
        let tracer = TracerConfig::default()
            .with_kernel("/k")
            .with_harness("/h")
            .with_timeout_secs(30);
        assert_eq!(
            tracer.args(Path::new("/w")),
            vec!["/k", "/h", "--workdir", "/w", "--no_load", "--monitor", "--timeout", "30"]
        );
    }
}

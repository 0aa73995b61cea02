// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Template evaluation.
//!
//! Kable does not implement a templating language. Concepts are evaluated by
//! an external engine behind the [`Evaluator`] trait, which turns a template
//! entry point, import search paths, and injected external variables into
//! one JSON document.

use serde_json::Value;
use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, instrument};

/// Entry point of a jsonnet concept.
pub const JSONNET_ENTRY_POINT: &str = "main.jsonnet";

/// Library directories of a jsonnet concept, searched in order.
pub const JSONNET_IMPORT_DIRS: [&str; 2] = ["lib", "vendor"];

/// One evaluation of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalRequest {
    /// Directory evaluation runs in.
    pub workdir: PathBuf,

    /// Template entry point relative to `workdir`.
    pub entry_point: PathBuf,

    /// Import search paths relative to `workdir`.
    pub import_paths: Vec<PathBuf>,

    /// External variables as source code literals, by name.
    pub ext_code: BTreeMap<String, String>,
}

impl EvalRequest {
    /// Evaluation of a jsonnet concept living in target directory.
    pub fn jsonnet(concept_dir: impl AsRef<Path>, ext_code: BTreeMap<String, String>) -> Self {
        Self {
            workdir: concept_dir.as_ref().to_path_buf(),
            entry_point: PathBuf::from(JSONNET_ENTRY_POINT),
            import_paths: JSONNET_IMPORT_DIRS.iter().map(PathBuf::from).collect(),
            ext_code,
        }
    }
}

/// Layer of indirection for template evaluation.
pub trait Evaluator: Send + Sync {
    /// Evaluate template into a JSON document.
    fn evaluate(&self, request: &EvalRequest) -> Result<Value>;
}

/// Evaluate templates through the `jsonnet` executable.
#[derive(Debug, Clone)]
pub struct JsonnetCommand {
    program: OsString,
}

impl JsonnetCommand {
    /// Use a specific jsonnet executable.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(request: &EvalRequest) -> Vec<OsString> {
        let mut args = Vec::new();
        for import_path in &request.import_paths {
            args.push(OsString::from("-J"));
            args.push(import_path.clone().into_os_string());
        }
        for (name, code) in &request.ext_code {
            args.push(OsString::from("--ext-code"));
            args.push(OsString::from(format!("{name}={code}")));
        }
        args.push(request.entry_point.clone().into_os_string());
        args
    }
}

impl Default for JsonnetCommand {
    fn default() -> Self {
        Self::new("jsonnet")
    }
}

impl Evaluator for JsonnetCommand {
    #[instrument(skip(self, request), level = "debug")]
    fn evaluate(&self, request: &EvalRequest) -> Result<Value> {
        debug!(
            "evaluate {:?} in {:?}",
            request.entry_point.display(),
            request.workdir.display()
        );
        let output = Command::new(&self.program)
            .current_dir(&request.workdir)
            .args(Self::args(request))
            .output()
            .map_err(|source| EvalError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(output.stderr.as_slice());

            // INVARIANT: Chomp trailing newlines.
            let message = stderr.trim_end().to_string();
            return Err(EvalError::Failed { message });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

fn display(program: &OsStr) -> String {
    program.to_string_lossy().into_owned()
}

/// All possible error types for template evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// Evaluator program cannot be started.
    #[error("failed to run {:?}", display(program))]
    Spawn {
        program: OsString,
        #[source]
        source: std::io::Error,
    },

    /// Template evaluation fails.
    #[error("template evaluation failed:\n{message}")]
    Failed { message: String },

    /// Evaluator output is not JSON.
    #[error("template evaluation produced invalid JSON")]
    Output(#[from] serde_json::Error),
}

/// Friendly result alias :3
type Result<T, E = EvalError> = std::result::Result<T, E>;

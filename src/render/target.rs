// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Render targets.
//!
//! A __target__ decides what rendered manifests look like on disk. Evaluator
//! output is first flattened into a list of manifests, which is then sorted
//! by a key derived from each manifest's `apiVersion`, `kind`, and
//! `metadata.name`. Sorting happens before anything is serialized, so the
//! same evaluator output always yields the same files byte for byte, no
//! matter how the evaluator happened to order its objects.

use crate::{
    concept::{Concept, ConceptType},
    render::{
        evaluate::{EvalRequest, Evaluator},
        values::RenderValues,
        RenderError, RenderFile,
    },
};

use serde_json::{Map, Value};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// File name of the combined manifest in single file mode.
pub const SINGLE_MANIFEST_FILE: &str = "manifest.yaml";

/// Separator between YAML documents in single file mode.
const YAML_DOCUMENT_SEPARATOR: &str = "---\n";

/// Output format of a render.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetType {
    /// Plain Kubernetes YAML manifests.
    #[default]
    Yaml,

    /// Custom resource wrapping the manifests. Not supported yet.
    Crd,
}

impl TargetType {
    /// Render concept at target path into files.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::RenderTargetUnsupported`] for targets that
    ///   cannot render yet.
    /// - Return [`RenderError::ConceptTypeUnsupported`] for concept types
    ///   this target cannot handle.
    /// - Return [`RenderError::Eval`] if template evaluation fails.
    /// - Return [`RenderError::InvalidOutput`] or
    ///   [`RenderError::DuplicateManifest`] for unusable evaluator output.
    #[instrument(skip(self, path, concept, values, evaluator), level = "debug")]
    pub fn render<E>(
        &self,
        path: &Path,
        concept: &Concept,
        values: &RenderValues,
        evaluator: &E,
        single: bool,
    ) -> Result<Vec<RenderFile>>
    where
        E: Evaluator + ?Sized,
    {
        match self {
            Self::Crd => Err(RenderError::RenderTargetUnsupported(self.to_string())),
            Self::Yaml => match &concept.concept_type {
                ConceptType::Jsonnet => {
                    let request = EvalRequest::jsonnet(path, values.ext_code());
                    let output = evaluator.evaluate(&request)?;
                    let manifests = extract_manifests(output)?;
                    debug!("extracted {} manifests", manifests.len());
                    yaml_files(&manifests, single)
                }
                ConceptType::Other(other) => Err(RenderError::ConceptTypeUnsupported(other.clone())),
            },
        }
    }
}

impl FromStr for TargetType {
    type Err = RenderError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data {
            "yaml" => Ok(Self::Yaml),
            "crd" => Ok(Self::Crd),
            other => Err(RenderError::RenderTargetUnsupported(other.to_string())),
        }
    }
}

impl Display for TargetType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Yaml => fmt.write_str("yaml"),
            Self::Crd => fmt.write_str("crd"),
        }
    }
}

/// One Kubernetes object of evaluator output.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    key: String,
    object: Map<String, Value>,
}

impl Manifest {
    fn new(object: Map<String, Value>) -> Self {
        let field = |name: &str| object.get(name).and_then(Value::as_str).unwrap_or_default();
        let name = object
            .get("metadata")
            .and_then(|metadata| metadata.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let key = format!(
            "{}_{}_{}",
            field("apiVersion").replace('/', "-"),
            field("kind"),
            name
        )
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect();

        Self { key, object }
    }

    /// Deterministic key of manifest, safe to use as file name.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn object(&self) -> &Map<String, Value> {
        &self.object
    }

    fn is_manifest(object: &Map<String, Value>) -> bool {
        object.get("apiVersion").is_some_and(Value::is_string)
            && object.get("kind").is_some_and(Value::is_string)
    }
}

/// Flatten evaluator output into manifests sorted by key.
///
/// Objects with a string `apiVersion` and `kind` are manifests; `*List`
/// kinds are unwrapped into their items. Any other object or array is
/// searched for manifests, and nulls are skipped.
///
/// # Errors
///
/// - Return [`RenderError::InvalidOutput`] if the output contains a scalar
///   outside of a manifest.
/// - Return [`RenderError::DuplicateManifest`] if two manifests share a key.
pub fn extract_manifests(output: Value) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    walk(output, "$", &mut manifests)?;
    manifests.sort_by(|a, b| a.key.cmp(&b.key));

    if let Some(pair) = manifests.windows(2).find(|pair| pair[0].key == pair[1].key) {
        return Err(RenderError::DuplicateManifest(pair[0].key.clone()));
    }

    Ok(manifests)
}

fn walk(value: Value, location: &str, manifests: &mut Vec<Manifest>) -> Result<()> {
    match value {
        Value::Null => Ok(()),
        Value::Object(mut object) if Manifest::is_manifest(&object) => {
            let is_list = object
                .get("kind")
                .and_then(Value::as_str)
                .is_some_and(|kind| kind.ends_with("List"));
            match object.remove("items") {
                Some(Value::Array(items)) if is_list => {
                    for (index, item) in items.into_iter().enumerate() {
                        walk(item, &format!("{location}.items[{index}]"), manifests)?;
                    }
                }
                Some(items) => {
                    object.insert("items".into(), items);
                    manifests.push(Manifest::new(object));
                }
                None => manifests.push(Manifest::new(object)),
            }
            Ok(())
        }
        Value::Object(object) => {
            // INVARIANT: serde_json maps iterate in key order.
            for (key, value) in object {
                walk(value, &format!("{location}.{key}"), manifests)?;
            }
            Ok(())
        }
        Value::Array(values) => {
            for (index, value) in values.into_iter().enumerate() {
                walk(value, &format!("{location}[{index}]"), manifests)?;
            }
            Ok(())
        }
        _ => Err(RenderError::InvalidOutput(location.to_string())),
    }
}

/// Serialize sorted manifests into YAML files.
///
/// One file per manifest named after its key, or all manifests in
/// [`SINGLE_MANIFEST_FILE`] if `single` is set.
///
/// # Errors
///
/// - Return [`RenderError::Yaml`] if a manifest cannot be serialized.
pub fn yaml_files(manifests: &[Manifest], single: bool) -> Result<Vec<RenderFile>> {
    let documents = manifests
        .iter()
        .map(|manifest| Ok((manifest.key(), serde_yaml::to_string(manifest.object())?)))
        .collect::<Result<Vec<_>>>()?;

    if single {
        let content = documents
            .into_iter()
            .map(|(_, document)| document)
            .collect::<Vec<_>>()
            .join(YAML_DOCUMENT_SEPARATOR);
        return Ok(vec![RenderFile {
            path: PathBuf::from(SINGLE_MANIFEST_FILE),
            content,
        }]);
    }

    Ok(documents
        .into_iter()
        .map(|(key, content)| RenderFile {
            path: PathBuf::from(format!("{key}.yaml")),
            content,
        })
        .collect())
}

/// Friendly result alias :3
type Result<T, E = RenderError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Render pipeline.
//!
//! Turn a concept plus typed input values into manifest files. A render
//! always carries a [`RenderInfo`] record describing which values and which
//! origin produced it, so the same render can be reproduced later through
//! [`RenderInfo::from_file`].
//!
//! # Layout on Disk
//!
//! ```text
//! out/
//! ├── manifest.yaml      # or one <apiVersion>_<kind>_<name>.yaml per manifest
//! └── renderinfo.json
//! ```

pub mod evaluate;
pub mod target;
pub mod values;

use crate::{
    concept::{
        get_concept, resolve_concept, Concept, ConceptError, ConceptIdentifier, ConceptInputs,
        ConceptOrigin, InputKind,
    },
    git::GitAccess,
    registry::store::RegistryStore,
    repository::RepositoryResolver,
};
use evaluate::{EvalError, Evaluator};
use target::TargetType;
use values::RenderValues;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    sync::LazyLock,
};
use tracing::{debug, info, instrument};

/// File name of render info next to rendered files.
pub const RENDER_INFO_FILE: &str = "renderinfo.json";

/// Version of render info this crate writes.
pub const RENDER_INFO_VERSION: u32 = 1;

static RENDER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z-_]+$").expect("render name pattern is valid"));

/// Check whether name is usable as a render name.
pub fn is_valid_render_name(name: impl AsRef<str>) -> bool {
    RENDER_NAME.is_match(name.as_ref())
}

/// One rendered file, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFile {
    pub path: PathBuf,
    pub content: String,
}

/// Options of a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOpts {
    /// Treat source as concept directory instead of concept identifier.
    pub local: bool,

    /// Write render info next to the rendered files.
    pub write_render_info: bool,

    /// Collapse all manifests into one file.
    pub single: bool,
}

impl Default for RenderOpts {
    fn default() -> Self {
        Self {
            local: false,
            write_render_info: true,
            single: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RenderMeta {
    pub date: String,
}

/// Record of what produced a render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderInfo {
    pub version: u32,
    pub meta: RenderMeta,

    /// Repository and ref of the concept. Unset for local renders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<ConceptOrigin>,

    pub values: RenderValues,
}

#[derive(Debug, Deserialize)]
struct RawRenderInfo {
    version: u32,
    meta: RenderMeta,
    #[serde(default)]
    origin: Option<ConceptOrigin>,
    #[serde(default)]
    values: Value,
}

impl RenderInfo {
    /// Construct render info stamped with the current time.
    pub fn new(values: RenderValues, origin: Option<ConceptOrigin>) -> Self {
        Self {
            version: RENDER_INFO_VERSION,
            meta: RenderMeta {
                date: chrono::Utc::now().format("%d %b %y %H:%M UTC").to_string(),
            },
            origin,
            values,
        }
    }

    /// Parse render info, reading values through declared inputs.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::InvalidRenderInfo`] if the data is malformed.
    /// - Return [`RenderError`] if a value does not match its declared input.
    pub fn from_json_str(data: &str, inputs: &ConceptInputs) -> Result<Self> {
        let raw: RawRenderInfo = serde_json::from_str(data)?;
        if raw.version != RENDER_INFO_VERSION {
            return Err(RenderError::RenderInfoVersion(raw.version));
        }

        Ok(Self {
            version: raw.version,
            meta: raw.meta,
            origin: raw.origin,
            values: RenderValues::from_json(&raw.values, inputs)?,
        })
    }

    /// Load render info from file.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::Read`] if the file cannot be read.
    /// - Return [`RenderError`] if the render info cannot be parsed.
    #[instrument(skip(path, inputs), level = "debug")]
    pub fn from_file(path: impl AsRef<Path>, inputs: &ConceptInputs) -> Result<Self> {
        let path = path.as_ref();
        debug!("load render info at {:?}", path.display());
        let data = read_to_string(path).map_err(|source| RenderError::Read {
            source,
            path: path.to_path_buf(),
        })?;
        Self::from_json_str(&data, inputs)
    }

    /// Render info as pretty JSON.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::InvalidRenderInfo`] if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        Ok(data)
    }
}

/// Result of rendering a concept.
#[derive(Debug, Clone, PartialEq)]
pub struct Render {
    /// Rendered files, in path order.
    pub files: Vec<RenderFile>,
    pub info: RenderInfo,
    pub write_render_info: bool,
}

impl Render {
    /// Write rendered files, then render info if enabled.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::Write`] if a file cannot be written.
    #[instrument(skip(self, dir), level = "debug")]
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.write_files(dir)?;
        if self.write_render_info {
            self.write_info(dir)?;
        }
        info!("wrote {} files to {:?}", self.files.len(), dir.display());
        Ok(())
    }

    /// Write rendered files into target directory.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::Write`] if a file cannot be written.
    pub fn write_files(&self, dir: impl AsRef<Path>) -> Result<()> {
        for file in &self.files {
            write_file(&dir.as_ref().join(&file.path), &file.content)?;
        }
        Ok(())
    }

    /// Write render info into target directory.
    ///
    /// # Errors
    ///
    /// - Return [`RenderError::Write`] if the file cannot be written.
    pub fn write_info(&self, dir: impl AsRef<Path>) -> Result<()> {
        write_file(&dir.as_ref().join(RENDER_INFO_FILE), &self.info.to_json_string()?)
    }

    /// Concatenate all rendered files in path order.
    pub fn print_files(&self) -> String {
        let mut files = self.files.iter().collect::<Vec<_>>();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.into_iter().map(|file| file.content.as_str()).collect()
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    let write_err = |source| RenderError::Write {
        source,
        path: path.to_path_buf(),
    };
    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent).map_err(write_err)?;
    }
    write(path, content).map_err(write_err)?;
    debug!("wrote {:?}", path.display());
    Ok(())
}

/// Render concept from identifier, or from directory in local mode.
///
/// # Errors
///
/// - Return [`RenderError::Concept`] if the identifier is malformed or the
///   concept cannot be resolved.
/// - Return [`RenderError`] if values do not fit the concept, or rendering
///   fails.
#[instrument(skip(resolver, evaluator, values, opts), level = "debug")]
pub fn render_concept<S, G, E>(
    resolver: &RepositoryResolver<S, G>,
    evaluator: &E,
    source: &str,
    values: RenderValues,
    target: TargetType,
    opts: RenderOpts,
) -> Result<Render>
where
    S: RegistryStore,
    G: GitAccess,
    E: Evaluator + ?Sized,
{
    if opts.local {
        return render_path(evaluator, source, values, target, opts);
    }

    let identifier: ConceptIdentifier = source.parse()?;
    let resolved = resolve_concept(resolver, &identifier)?;
    render_resolved(
        evaluator,
        &resolved.path,
        &resolved.concept,
        values,
        Some(resolved.origin),
        target,
        opts,
    )
}

/// Render concept living in local directory.
///
/// # Errors
///
/// - Return [`RenderError::Concept`] if the directory holds no concept.
/// - Return [`RenderError`] if values do not fit the concept, or rendering
///   fails.
pub fn render_path<E>(
    evaluator: &E,
    path: impl AsRef<Path>,
    values: RenderValues,
    target: TargetType,
    opts: RenderOpts,
) -> Result<Render>
where
    E: Evaluator + ?Sized,
{
    let path = path.as_ref();
    let concept = get_concept(path)?;
    render_resolved(evaluator, path, &concept, values, None, target, opts)
}

fn render_resolved<E>(
    evaluator: &E,
    path: &Path,
    concept: &Concept,
    values: RenderValues,
    origin: Option<ConceptOrigin>,
    target: TargetType,
    opts: RenderOpts,
) -> Result<Render>
where
    E: Evaluator + ?Sized,
{
    info!("render {:?} concept {:?} as {target}", concept.concept_type.to_string(), concept.meta.name);
    values.validate(&concept.inputs)?;
    let files = target.render(path, concept, &values, evaluator, opts.single)?;

    Ok(Render {
        files,
        info: RenderInfo::new(values, origin),
        write_render_info: opts.write_render_info,
    })
}

/// All possible error types for rendering.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Concept type has no renderer.
    #[error("concept type {0:?} is not supported")]
    ConceptTypeUnsupported(String),

    /// Render target has no implementation.
    #[error("render target {0:?} is not supported")]
    RenderTargetUnsupported(String),

    /// Value does not have the type its input declares.
    #[error("value of {name:?} must be of type {expected}, found {found}")]
    ValueTypeNotSupported {
        name: String,
        expected: InputKind,
        found: String,
    },

    /// Value for an input the concept does not declare.
    #[error("concept has no input named {0:?}")]
    UndeclaredInput(String),

    /// Select value is not one of its options.
    #[error("{value:?} is not a valid choice for {name:?}, expected one of {options:?}")]
    InvalidSelection {
        name: String,
        value: String,
        options: Vec<String>,
    },

    /// Mandatory input has no value.
    #[error("mandatory input {0:?} has no value")]
    MissingMandatoryInput(String),

    /// Evaluator output holds something that is not a manifest.
    #[error("template output at {0} is not a manifest")]
    InvalidOutput(String),

    /// Two manifests would land in the same file.
    #[error("template output contains manifest {0:?} more than once")]
    DuplicateManifest(String),

    /// Render info has an unknown version.
    #[error("render info version {0} is not supported")]
    RenderInfoVersion(u32),

    /// Render info is malformed.
    #[error("malformed render info")]
    InvalidRenderInfo(#[from] serde_json::Error),

    /// Render info cannot be read.
    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Rendered file cannot be written.
    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Manifest cannot be serialized.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Template evaluation fails.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Concept cannot be resolved.
    #[error(transparent)]
    Concept(#[from] ConceptError),
}

/// Friendly result alias :3
type Result<T, E = RenderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        git::REPO_INDEX_FILE,
        render::{
            evaluate::EvalRequest,
            target::SINGLE_MANIFEST_FILE,
            values::RenderValue,
        },
        repository::tests::{demo_resolver, FixtureGit},
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::{
        fs::{create_dir_all, read_dir},
        sync::atomic::{AtomicUsize, Ordering},
    };

    const SENTRY_CONCEPT: &str = indoc! {r#"
        {
          "apiVersion": 1,
          "type": "jsonnet",
          "metadata": { "name": "sentry" },
          "inputs": {
            "mandatory": { "instanceName": { "type": "string" } },
            "optional": { "replicas": { "type": "int" } }
          }
        }
    "#};

    /// Evaluator that names its objects after `instanceName` and flips
    /// their order on every call.
    #[derive(Default)]
    struct FlippingEvaluator {
        calls: AtomicUsize,
    }

    impl Evaluator for FlippingEvaluator {
        fn evaluate(&self, request: &EvalRequest) -> std::result::Result<Value, EvalError> {
            let name: String = match request.ext_code.get("instanceName") {
                Some(code) => serde_json::from_str(code)?,
                None => "unnamed".into(),
            };
            let replicas: i64 = match request.ext_code.get("replicas") {
                Some(code) => serde_json::from_str(code)?,
                None => 1,
            };

            let mut objects = vec![
                json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": { "name": name },
                    "spec": { "replicas": replicas },
                }),
                json!({
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": { "name": name },
                }),
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": format!("{name}-config") },
                    "data": { "mode": "prod" },
                }),
            ];
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                objects.reverse();
            }
            Ok(Value::Array(objects))
        }
    }

    fn local_concept(dir: &Path, concept: &str) -> anyhow::Result<PathBuf> {
        let path = dir.join("sentry");
        create_dir_all(&path)?;
        std::fs::write(path.join("concept.json"), concept)?;
        Ok(path)
    }

    fn prod_values() -> RenderValues {
        RenderValues::from_iter([("instanceName".to_string(), RenderValue::String("prod".into()))])
    }

    fn local_opts(single: bool) -> RenderOpts {
        RenderOpts {
            local: true,
            single,
            ..Default::default()
        }
    }

    fn dir_entries(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut entries = read_dir(dir)?
            .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    #[test]
    fn render_is_deterministic() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = local_concept(dir.path(), SENTRY_CONCEPT)?;
        let evaluator = FlippingEvaluator::default();

        for single in [true, false] {
            let first = render_path(&evaluator, &path, prod_values(), TargetType::Yaml, local_opts(single))?;
            let second = render_path(&evaluator, &path, prod_values(), TargetType::Yaml, local_opts(single))?;
            assert_eq!(first.files, second.files);
        }

        let result = render_path(&evaluator, &path, prod_values(), TargetType::Yaml, local_opts(false))?;
        let paths = result.files.iter().map(|file| file.path.clone()).collect::<Vec<_>>();
        let expect = vec![
            PathBuf::from("apps-v1_Deployment_prod.yaml"),
            PathBuf::from("v1_ConfigMap_prod-config.yaml"),
            PathBuf::from("v1_Service_prod.yaml"),
        ];
        assert_eq!(paths, expect);
        assert_eq!(result.info.origin, None);

        Ok(())
    }

    #[test]
    fn unsupported_concept_type_renders_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = local_concept(dir.path(), &SENTRY_CONCEPT.replace("jsonnet", "helm"))?;
        let evaluator = FlippingEvaluator::default();
        let out = dir.path().join("out");

        let result = render_path(&evaluator, &path, prod_values(), TargetType::Yaml, local_opts(true))
            .and_then(|render| render.write(&out));
        assert!(matches!(result, Err(RenderError::ConceptTypeUnsupported(name)) if name == "helm"));
        assert!(!out.exists());
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[test]
    fn crd_target_is_not_supported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = local_concept(dir.path(), SENTRY_CONCEPT)?;

        let result = render_path(
            &FlippingEvaluator::default(),
            &path,
            prod_values(),
            TargetType::Crd,
            local_opts(true),
        );
        assert!(matches!(result, Err(RenderError::RenderTargetUnsupported(name)) if name == "crd"));

        Ok(())
    }

    #[test]
    fn missing_mandatory_input_stops_render() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = local_concept(dir.path(), SENTRY_CONCEPT)?;
        let evaluator = FlippingEvaluator::default();

        let result = render_path(&evaluator, &path, RenderValues::new(), TargetType::Yaml, local_opts(true));
        assert!(matches!(result, Err(RenderError::MissingMandatoryInput(name)) if name == "instanceName"));
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[test]
    fn render_repository_concept_end_to_end() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let git = FixtureGit::default().with_remote(
            "https://github.com/redradrat/demo-concepts",
            [
                (REPO_INDEX_FILE, r#"{ "version": 1, "concepts": ["apps/sentry"] }"#),
                ("apps/sentry/concept.json", SENTRY_CONCEPT),
            ],
        );
        let resolver = demo_resolver(dir.path(), git)?;
        let out = dir.path().join("out");

        let mut values = RenderValues::new();
        values.insert("instanceName", RenderValue::String("prod".into()));
        let opts = RenderOpts {
            single: true,
            ..Default::default()
        };
        let render = render_concept(
            &resolver,
            &FlippingEvaluator::default(),
            "apps/sentry@demo-https",
            values,
            TargetType::Yaml,
            opts,
        )?;
        render.write(&out)?;

        assert_eq!(dir_entries(&out)?, vec![SINGLE_MANIFEST_FILE, RENDER_INFO_FILE]);
        assert_eq!(render.print_files(), read_to_string(out.join(SINGLE_MANIFEST_FILE))?);

        let concept = get_concept(resolver.absolute_path("demo-https")?.join("apps/sentry"))?;
        let info = RenderInfo::from_file(out.join(RENDER_INFO_FILE), &concept.inputs)?;
        assert_eq!(info, render.info);
        assert_eq!(
            info.values.get("instanceName"),
            Some(&RenderValue::String("prod".into()))
        );
        let expect = ConceptOrigin {
            repository: "https://github.com/redradrat/demo-concepts".into(),
            git_ref: "refs/heads/master".into(),
        };
        assert_eq!(info.origin, Some(expect));

        Ok(())
    }

    #[test]
    fn render_info_skipped_when_disabled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = local_concept(dir.path(), SENTRY_CONCEPT)?;
        let out = dir.path().join("out");
        let opts = RenderOpts {
            write_render_info: false,
            ..local_opts(false)
        };

        render_path(&FlippingEvaluator::default(), &path, prod_values(), TargetType::Yaml, opts)?
            .write(&out)?;
        assert!(!out.join(RENDER_INFO_FILE).exists());
        assert_eq!(dir_entries(&out)?.len(), 3);

        Ok(())
    }

    #[test]
    fn render_info_values_follow_declared_types() -> anyhow::Result<()> {
        let concept: Concept = serde_json::from_str(SENTRY_CONCEPT)?;
        let data = indoc! {r#"
            {
              "version": 1,
              "meta": { "date": "17 Oct 26 09:30 UTC" },
              "values": { "instanceName": "prod", "replicas": 3 }
            }
        "#};

        let result = RenderInfo::from_json_str(data, &concept.inputs)?;
        assert_eq!(result.values.get("replicas"), Some(&RenderValue::Int(3)));
        assert_eq!(result.origin, None);

        let result = RenderInfo::from_json_str(&data.replace("3", "3.5"), &concept.inputs);
        assert!(matches!(result, Err(RenderError::ValueTypeNotSupported { .. })));

        let result = RenderInfo::from_json_str(&data.replace("\"version\": 1", "\"version\": 2"), &concept.inputs);
        assert!(matches!(result, Err(RenderError::RenderInfoVersion(2))));

        Ok(())
    }

    #[test]
    fn render_names() {
        assert!(is_valid_render_name("sentry-prod_a"));
        assert!(!is_valid_render_name("Sentry"));
        assert!(!is_valid_render_name("sentry1"));
        assert!(!is_valid_render_name(""));
    }
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Concepts.
//!
//! A __concept__ is a parameterized template unit: a directory inside a
//! concept repository that carries a [`CONCEPT_FILE`] next to a template
//! entry point. Concepts are addressed through identifiers of the form
//! `<path>@<repository>`, e.g., `apps/sentry@demo-https`.
//!
//! # Concept File
//!
//! ```json
//! {
//!   "apiVersion": 1,
//!   "type": "jsonnet",
//!   "metadata": { "name": "sentry", "tags": ["monitoring"] },
//!   "inputs": {
//!     "mandatory": { "instanceName": { "type": "string" } },
//!     "optional": { "size": { "type": "select", "options": ["s", "m"] } }
//!   }
//! }
//! ```

use crate::{
    git::GitAccess,
    registry::store::RegistryStore,
    registry::RegistryError,
    repository::{RepositoryError, RepositoryResolver},
};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read, write},
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
};
use tracing::{debug, info, instrument};

/// File name of concept definition inside a concept directory.
pub const CONCEPT_FILE: &str = "concept.json";

/// Pattern every concept identifier must match.
///
/// The first group is the concept path, the second the repository name.
/// Underscores are left out on purpose, they stand in for `/` in URLs.
pub const CONCEPT_IDENTIFIER_PATTERN: &str = r"^([a-z/\-0-9]+)@([a-z\-]+)$";

static CONCEPT_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(CONCEPT_IDENTIFIER_PATTERN).expect("concept identifier pattern is valid")
});

/// Check string against [`CONCEPT_IDENTIFIER_PATTERN`].
pub fn is_valid_concept_identifier(identifier: impl AsRef<str>) -> bool {
    CONCEPT_IDENTIFIER.is_match(identifier.as_ref())
}

/// Identifier of a concept inside a registered repository.
///
/// Constructing an identifier does not validate it. Check
/// [`ConceptIdentifier::is_valid`] before acting on one, or parse it through
/// [`FromStr`], which rejects malformed identifiers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ConceptIdentifier(String);

impl ConceptIdentifier {
    /// Compose identifier from concept path and repository name.
    pub fn new(concept: impl AsRef<str>, repo: impl AsRef<str>) -> Self {
        Self(format!("{}@{}", concept.as_ref(), repo.as_ref()))
    }

    /// Check identifier against [`CONCEPT_IDENTIFIER_PATTERN`].
    pub fn is_valid(&self) -> bool {
        is_valid_concept_identifier(&self.0)
    }

    /// Concept path inside repository.
    ///
    /// Only meaningful for valid identifiers.
    pub fn concept(&self) -> &str {
        self.0
            .rsplit_once('@')
            .map(|(concept, _)| concept)
            .unwrap_or(&self.0)
    }

    /// Name of repository holding the concept.
    ///
    /// Only meaningful for valid identifiers.
    pub fn repo(&self) -> &str {
        self.0
            .rsplit_once('@')
            .map(|(_, repo)| repo)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ConceptIdentifier {
    type Err = ConceptError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let identifier = Self(data.to_string());
        if !identifier.is_valid() {
            return Err(ConceptError::InvalidIdentifier(data.to_string()));
        }
        Ok(identifier)
    }
}

impl Display for ConceptIdentifier {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.0)
    }
}

impl AsRef<str> for ConceptIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Concept definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Concept {
    #[serde(rename = "apiVersion")]
    pub api_version: i64,

    #[serde(rename = "type")]
    pub concept_type: ConceptType,

    #[serde(rename = "metadata")]
    pub meta: ConceptMeta,

    #[serde(default)]
    pub inputs: ConceptInputs,
}

/// Templating kind of a concept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum ConceptType {
    Jsonnet,
    Other(String),
}

impl ConceptType {
    /// Whether concepts of this type can be rendered.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Jsonnet)
    }
}

impl From<String> for ConceptType {
    fn from(data: String) -> Self {
        match data.as_str() {
            "jsonnet" => Self::Jsonnet,
            _ => Self::Other(data),
        }
    }
}

impl From<ConceptType> for String {
    fn from(concept_type: ConceptType) -> Self {
        concept_type.to_string()
    }
}

impl Display for ConceptType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Jsonnet => fmt.write_str("jsonnet"),
            Self::Other(other) => fmt.write_str(other),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConceptMeta {
    pub name: String,

    /// Tags, always kept in sorted order.
    #[serde(
        default,
        deserialize_with = "sorted",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Maintainer::is_empty")]
    pub maintainer: Maintainer,
}

fn sorted<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut tags = Vec::<String>::deserialize(deserializer)?;
    tags.sort();
    Ok(tags)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Maintainer {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
}

impl Maintainer {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.email.is_empty()
    }
}

impl Display for Maintainer {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        if self.name.is_empty() {
            return Ok(());
        }
        fmt.write_str(&self.name)?;
        if !self.email.is_empty() {
            write!(fmt, " <{}>", self.email)?;
        }
        Ok(())
    }
}

/// Inputs a concept accepts, by name.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConceptInputs {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mandatory: BTreeMap<String, InputType>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional: BTreeMap<String, InputType>,
}

impl ConceptInputs {
    /// Look up declared input, mandatory or optional.
    pub fn get(&self, name: &str) -> Option<&InputType> {
        self.mandatory.get(name).or_else(|| self.optional.get(name))
    }

    /// All declared inputs, mandatory ones first, each group in name order.
    pub fn all(&self) -> impl Iterator<Item = (&String, &InputType, bool)> {
        self.mandatory
            .iter()
            .map(|(name, input)| (name, input, true))
            .chain(
                self.optional
                    .iter()
                    .filter(move |(name, _)| !self.mandatory.contains_key(*name))
                    .map(|(name, input)| (name, input, false)),
            )
    }
}

/// Declared type of one input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InputType {
    #[serde(rename = "type")]
    pub kind: InputKind,

    /// Allowed values of a select input.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl InputType {
    pub fn new(kind: InputKind) -> Self {
        Self {
            kind,
            options: Vec::new(),
        }
    }

    pub fn select(options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            kind: InputKind::Select,
            options: options.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    String,
    Select,
    Map,
    Int,
    Bool,
}

impl Display for InputKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::String => "string",
            Self::Select => "select",
            Self::Map => "map",
            Self::Int => "int",
            Self::Bool => "bool",
        };
        fmt.write_str(name)
    }
}

/// Where a concept came from.
///
/// Records the configured ref of the repository, not the commit that was
/// checked out.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConceptOrigin {
    pub repository: String,

    #[serde(rename = "ref")]
    pub git_ref: String,
}

/// Concept found through its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConcept {
    pub identifier: ConceptIdentifier,
    pub concept: Concept,
    pub path: PathBuf,
    pub origin: ConceptOrigin,
}

/// Load concept definition from concept directory.
///
/// # Errors
///
/// - Return [`ConceptError::ConceptNotFound`] if the directory holds no
///   concept file.
/// - Return [`ConceptError::Parse`] if the concept file is malformed.
#[instrument(skip(path), level = "debug")]
pub fn get_concept(path: impl AsRef<Path>) -> Result<Concept> {
    let file = path.as_ref().join(CONCEPT_FILE);
    debug!("load concept at {:?}", file.display());
    let data = read(&file).map_err(|source| match source.kind() {
        ErrorKind::NotFound => ConceptError::ConceptNotFound(path.as_ref().display().to_string()),
        _ => ConceptError::Read {
            source,
            path: file.clone(),
        },
    })?;
    serde_json::from_slice(&data).map_err(|source| ConceptError::Parse { source, path: file })
}

/// Resolve concept identifier into its definition, directory, and origin.
///
/// Clones the concept's repository if it is not cached yet.
///
/// # Errors
///
/// - Return [`ConceptError::InvalidIdentifier`] before any I/O for
///   malformed identifiers.
/// - Return [`ConceptError::Repository`] if the repository is unknown or
///   cannot be materialized.
/// - Return [`ConceptError::ConceptNotFound`] if the repository has no such
///   concept.
#[instrument(skip(resolver), level = "debug")]
pub fn resolve_concept<S, G>(
    resolver: &RepositoryResolver<S, G>,
    identifier: &ConceptIdentifier,
) -> Result<ResolvedConcept>
where
    S: RegistryStore,
    G: GitAccess,
{
    if !identifier.is_valid() {
        return Err(ConceptError::InvalidIdentifier(identifier.to_string()));
    }

    let repo = resolver.resolve(identifier.repo())?;

    // INVARIANT: Concept directories never escape their working copy.
    let path = identifier
        .concept()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(repo.path.clone(), |path, segment| path.join(segment));

    let concept = get_concept(&path).map_err(|err| match err {
        ConceptError::ConceptNotFound(_) => ConceptError::ConceptNotFound(identifier.to_string()),
        err => err,
    })?;

    Ok(ResolvedConcept {
        identifier: identifier.clone(),
        concept,
        path,
        origin: ConceptOrigin {
            repository: repo.repository.url,
            git_ref: repo.repository.git_ref,
        },
    })
}

/// Load concept definition through its identifier.
///
/// # Errors
///
/// - Return [`ConceptError`] if the concept cannot be resolved.
pub fn get_repo_concept<S, G>(
    resolver: &RepositoryResolver<S, G>,
    identifier: &ConceptIdentifier,
) -> Result<Concept>
where
    S: RegistryStore,
    G: GitAccess,
{
    Ok(resolve_concept(resolver, identifier)?.concept)
}

/// Origin of concepts of a registered repository.
///
/// # Errors
///
/// - Return [`ConceptError::Registry`] if the repository is unknown.
pub fn get_concept_origin<S, G>(
    resolver: &RepositoryResolver<S, G>,
    repo: &str,
) -> Result<ConceptOrigin>
where
    S: RegistryStore,
    G: GitAccess,
{
    let repository = resolver.registry().get_repository(repo)?;
    Ok(ConceptOrigin {
        repository: repository.url,
        git_ref: repository.git_ref,
    })
}

/// List identifiers of every concept of every registered repository.
///
/// Clones repositories that are not cached yet.
///
/// # Errors
///
/// - Return [`ConceptError::Repository`] if a repository cannot be
///   materialized, or its index cannot be read.
#[instrument(skip(resolver), level = "debug")]
pub fn list_concepts<S, G>(resolver: &RepositoryResolver<S, G>) -> Result<Vec<ConceptIdentifier>>
where
    S: RegistryStore,
    G: GitAccess,
{
    let mut identifiers = Vec::new();
    for status in resolver.list_repositories()? {
        let name = &status.repository.name;
        let index = resolver.resolve(name)?.repo_index()?;
        identifiers.extend(
            index
                .concepts
                .iter()
                .map(|concept| ConceptIdentifier::new(concept, name)),
        );
    }
    Ok(identifiers)
}

const JSONNET_MAIN: &str = r#"local lib = import 'lib/main.libsonnet';

// Final JSON Output
lib.new(std.extVar("instanceName"))
"#;

const JSONNET_MAIN_LIB: &str = r#"local kausal = import "ksonnet-util/kausal.libsonnet";

local deployment = kausal.apps.v1.deployment;
local container = kausal.core.v1.container;
local port = kausal.core.v1.containerPort;

local grafanaDeploy(name) = deployment.new(
        name=name, replicas=2,
        containers=[
          container.new("grafana", "grafana/grafana")
          + container.withPorts([port.new("ui", 10330)]),
        ],
      );

// Final JSON Object
{
  new(name):: [
    grafanaDeploy(name),
    kausal.util.serviceFor(grafanaDeploy(name))
  ]
}
"#;

const JSONNET_K_LIB: &str = r#"(import "github.com/jsonnet-libs/k8s-alpha/1.14/main.libsonnet")
+ (import "github.com/jsonnet-libs/k8s-alpha/1.14/extensions/kausal-shim.libsonnet")
"#;

const JSONNETFILE: &str = r#"{
  "version": 1,
  "dependencies": [
    {
      "source": {
        "git": {
          "remote": "https://github.com/grafana/jsonnet-libs.git",
          "subdir": "ksonnet-util"
        }
      },
      "version": "master"
    },
    {
      "source": {
        "git": {
          "remote": "https://github.com/jsonnet-libs/k8s-alpha.git",
          "subdir": "1.14"
        }
      },
      "version": "master"
    }
  ],
  "legacyImports": true
}
"#;

const MAKEFILE: &str = "render:\n\tkable render --local . --output out/\n\ninstall:\n\tjb install\n";

const GITIGNORE: &str = "out/\nvendor/\n";

/// Scaffold a new concept in target directory.
///
/// Writes a starter concept file, template entry point, library files, and
/// jsonnet-bundler manifest. Vendored libraries are left for `jb install`.
///
/// # Errors
///
/// - Return [`ConceptError::ConceptTypeUnsupported`] for types that cannot
///   be scaffolded.
/// - Return [`ConceptError::Write`] if a file cannot be written.
#[instrument(skip(dir), level = "debug")]
pub fn init_concept(dir: impl AsRef<Path>, name: &str, concept_type: ConceptType) -> Result<()> {
    if !concept_type.is_supported() {
        return Err(ConceptError::ConceptTypeUnsupported(concept_type.to_string()));
    }

    let dir = dir.as_ref();
    info!("initialize {concept_type} concept {name:?} at {:?}", dir.display());

    let concept = Concept {
        api_version: 1,
        concept_type,
        meta: ConceptMeta {
            name: name.to_string(),
            ..Default::default()
        },
        inputs: ConceptInputs {
            mandatory: BTreeMap::from([
                ("instanceName".to_string(), InputType::new(InputKind::String)),
                (
                    "nameSelection".to_string(),
                    InputType::select(["Option 1", "Option 2"]),
                ),
            ]),
            optional: BTreeMap::new(),
        },
    };
    let mut concept_file = serde_json::to_string_pretty(&concept)
        .map_err(|source| ConceptError::Serialize {
            source,
            path: dir.join(CONCEPT_FILE),
        })?;
    concept_file.push('\n');

    let files = [
        (PathBuf::from(CONCEPT_FILE), concept_file.as_str()),
        (PathBuf::from("main.jsonnet"), JSONNET_MAIN),
        (PathBuf::from("jsonnetfile.json"), JSONNETFILE),
        (PathBuf::from("Makefile"), MAKEFILE),
        (PathBuf::from(".gitignore"), GITIGNORE),
        (Path::new("lib").join("main.libsonnet"), JSONNET_MAIN_LIB),
        (Path::new("lib").join("k.libsonnet"), JSONNET_K_LIB),
    ];

    for (path, content) in files {
        let path = dir.join(path);
        let write_err = |source| ConceptError::Write {
            source,
            path: path.clone(),
        };
        if let Some(parent) = path.parent() {
            create_dir_all(parent).map_err(write_err)?;
        }
        write(&path, content).map_err(write_err)?;
        debug!("wrote {:?}", path.display());
    }

    Ok(())
}

/// All possible error types for concept resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConceptError {
    /// Identifier does not match [`CONCEPT_IDENTIFIER_PATTERN`].
    #[error("invalid concept identifier {0:?}: expected <path>@<repository>")]
    InvalidIdentifier(String),

    /// Concept does not exist.
    #[error("concept {0:?} not found")]
    ConceptNotFound(String),

    /// Concept type cannot be handled.
    #[error("concept type {0:?} is not supported")]
    ConceptTypeUnsupported(String),

    /// Concept file cannot be read.
    #[error("failed to read concept file at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Concept file is malformed.
    #[error("malformed concept file at {:?}", path.display())]
    Parse {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    /// Scaffold file cannot be written.
    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Scaffolded concept file cannot be serialized.
    #[error("failed to serialize concept file for {:?}", path.display())]
    Serialize {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    /// Repository lookup fails.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Repository resolution fails.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Friendly result alias :3
type Result<T, E = ConceptError> = std::result::Result<T, E>;

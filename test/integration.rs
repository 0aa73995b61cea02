// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::RepoFixture;

use kable::{
    concept::{list_concepts, ConceptIdentifier},
    git::{CheckoutOutcome, Git2Cache, GitError, REPO_INDEX_FILE},
    registry::{add_repository, remove_repository, store::LocalStore, RegistryError},
    render::{
        evaluate::{EvalError, EvalRequest, Evaluator},
        render_concept,
        target::TargetType,
        values::{RenderValue, RenderValues},
        RenderInfo, RenderOpts, RENDER_INFO_FILE,
    },
    repository::RepositoryError,
    Registry, Repository, RepositoryResolver,
};

use anyhow::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::{fs::read_dir, path::Path};

const SENTRY_CONCEPT: &str = indoc! {r#"
    {
      "apiVersion": 1,
      "type": "jsonnet",
      "metadata": { "name": "sentry", "tags": ["monitoring"] },
      "inputs": { "mandatory": { "instanceName": { "type": "string" } } }
    }
"#};

/// Evaluator standing in for jsonnet, emits one deployment per render.
struct DeploymentEvaluator;

impl Evaluator for DeploymentEvaluator {
    fn evaluate(&self, request: &EvalRequest) -> Result<Value, EvalError> {
        let name: String = match request.ext_code.get("instanceName") {
            Some(code) => serde_json::from_str(code)?,
            None => "unnamed".into(),
        };
        Ok(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name },
        }))
    }
}

fn demo_remote(dir: &Path) -> Result<RepoFixture> {
    let remote = RepoFixture::new(dir.join("remote").join("demo-concepts"))?;
    remote.stage_and_commit(REPO_INDEX_FILE, r#"{ "version": 1, "concepts": ["apps/sentry"] }"#)?;
    remote.stage_and_commit("apps/sentry/concept.json", SENTRY_CONCEPT)?;
    Ok(remote)
}

fn resolver_for(dir: &Path, remote: &RepoFixture) -> Result<RepositoryResolver<LocalStore, Git2Cache>> {
    let registry = Registry::new(LocalStore::new(dir.join("registry.json")));
    registry.update([add_repository(
        Repository::new("demo", remote.url()).with_ref("main"),
        false,
    )?])?;
    Ok(RepositoryResolver::new(registry, Git2Cache::new(), dir.join("cache")))
}

#[test]
fn resolve_clones_remote_into_cache() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let remote = demo_remote(dir.path())?;
    let resolver = resolver_for(dir.path(), &remote)?;

    let resolved = resolver.resolve("demo")?;
    assert_eq!(resolved.path, dir.path().join("cache").join("demo-concepts"));
    assert!(resolved.path.join("apps/sentry/concept.json").exists());
    assert_eq!(resolved.repo_index()?.concepts, vec!["apps/sentry"]);
    assert!(resolver.list_repositories()?[0].initialized);

    let expect = vec![ConceptIdentifier::new("apps/sentry", "demo")];
    assert_eq!(list_concepts(&resolver)?, expect);

    Ok(())
}

#[test]
fn update_fast_forwards_working_copy() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let remote = demo_remote(dir.path())?;
    let resolver = resolver_for(dir.path(), &remote)?;

    assert_eq!(resolver.update_repository("demo")?, CheckoutOutcome::Cloned);
    assert_eq!(resolver.update_repository("demo")?, CheckoutOutcome::UpToDate);

    remote.stage_and_commit("apps/grafana/concept.json", SENTRY_CONCEPT.replace("sentry", "grafana"))?;
    let result = resolver.update_repositories()?;
    assert_eq!(result, vec![("demo".to_string(), CheckoutOutcome::Pulled)]);
    assert!(resolver.absolute_path("demo")?.join("apps/grafana/concept.json").exists());

    Ok(())
}

#[test]
fn invalid_repository_is_rolled_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let remote = RepoFixture::new(dir.path().join("remote").join("not-concepts"))?;
    remote.stage_and_commit("README.md", "just a readme")?;
    let resolver = resolver_for(dir.path(), &demo_remote(dir.path())?)?;

    let repository = Repository::new("plain", remote.url()).with_ref("main");
    let result = resolver.checkout(&repository, None);
    assert!(matches!(
        result,
        Err(RepositoryError::Git(GitError::RepositoryInvalid { .. }))
    ));
    assert!(!dir.path().join("cache").join("not-concepts").exists());

    Ok(())
}

#[test]
fn render_concept_from_cloned_repository() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let remote = demo_remote(dir.path())?;
    let resolver = resolver_for(dir.path(), &remote)?;
    let out = dir.path().join("out");

    let values = RenderValues::from_iter([("instanceName".to_string(), RenderValue::String("prod".into()))]);
    let opts = RenderOpts {
        single: true,
        ..Default::default()
    };
    let render = render_concept(
        &resolver,
        &DeploymentEvaluator,
        "apps/sentry@demo",
        values,
        TargetType::Yaml,
        opts,
    )?;
    render.write(&out)?;

    let mut entries = read_dir(&out)?
        .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
        .collect::<Result<Vec<_>>>()?;
    entries.sort();
    assert_eq!(entries, vec!["manifest.yaml", RENDER_INFO_FILE]);

    let expect = indoc! {"
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: prod
    "};
    assert_eq!(std::fs::read_to_string(out.join("manifest.yaml"))?, expect);

    let concept = kable::concept::get_concept(resolver.absolute_path("demo")?.join("apps/sentry"))?;
    let info = RenderInfo::from_file(out.join(RENDER_INFO_FILE), &concept.inputs)?;
    assert_eq!(info.values.get("instanceName"), Some(&RenderValue::String("prod".into())));
    assert_eq!(info.origin.map(|origin| origin.git_ref), Some("refs/heads/main".to_string()));

    Ok(())
}

#[test]
fn removed_repository_is_unknown_and_tidied() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let remote = demo_remote(dir.path())?;
    let resolver = resolver_for(dir.path(), &remote)?;
    resolver.resolve("demo")?;

    resolver.registry().update([remove_repository("demo")?])?;
    let result = resolver.registry().get_repository("demo");
    assert!(matches!(result, Err(RegistryError::RepositoryUnknown(name)) if name == "demo"));

    assert_eq!(resolver.tidy_cache()?, vec!["demo-concepts"]);
    assert!(!dir.path().join("cache").join("demo-concepts").exists());

    Ok(())
}

#[test]
fn remotes_sharing_last_segment_never_share_working_copy() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let alpha = RepoFixture::new(dir.path().join("remote").join("a").join("concepts"))?;
    alpha.stage_and_commit(REPO_INDEX_FILE, r#"{ "version": 1, "concepts": ["from/a"] }"#)?;
    let beta = RepoFixture::new(dir.path().join("remote").join("b").join("concepts"))?;
    beta.stage_and_commit(REPO_INDEX_FILE, r#"{ "version": 1, "concepts": ["from/b"] }"#)?;

    let registry = Registry::new(LocalStore::new(dir.path().join("registry.json")));
    registry.update([
        add_repository(Repository::new("alpha", alpha.url()).with_ref("main"), false)?,
        add_repository(Repository::new("beta", beta.url()).with_ref("main"), false)?,
    ])?;
    let resolver = RepositoryResolver::new(registry, Git2Cache::new(), dir.path().join("cache"));

    assert_eq!(resolver.repo_index("alpha")?.concepts, vec!["from/a"]);
    let result = resolver.resolve("beta");
    assert!(matches!(
        result,
        Err(RepositoryError::Git(GitError::CacheConflict { url, .. })) if url == beta.url()
    ));
    assert_eq!(resolver.repo_index("alpha")?.concepts, vec!["from/a"]);

    Ok(())
}

#[test]
fn changed_ref_replaces_working_copy() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let remote = demo_remote(dir.path())?;
    remote.branch("stable")?;
    remote.stage_and_commit("apps/grafana/concept.json", SENTRY_CONCEPT.replace("sentry", "grafana"))?;

    let registry = Registry::new(LocalStore::new(dir.path().join("registry.json")));
    registry.update([add_repository(
        Repository::new("demo", remote.url()).with_ref("stable"),
        false,
    )?])?;
    let resolver = RepositoryResolver::new(registry, Git2Cache::new(), dir.path().join("cache"));
    let grafana = dir.path().join("cache/demo-concepts/apps/grafana/concept.json");

    assert_eq!(resolver.update_repository("demo")?, CheckoutOutcome::Cloned);
    assert!(!grafana.exists());

    resolver.registry().update([add_repository(
        Repository::new("demo", remote.url()).with_ref("main"),
        true,
    )?])?;
    assert_eq!(resolver.update_repository("demo")?, CheckoutOutcome::Cloned);
    assert!(grafana.exists());
    assert_eq!(resolver.update_repository("demo")?, CheckoutOutcome::UpToDate);

    Ok(())
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Concept repository cache and Kubernetes manifest renderer.
//!
//! A __concept__ is a parameterized template that renders into Kubernetes
//! manifests. Concepts are published through git repositories, which kable
//! tracks in a small registry and mirrors into a local cache.
//!
//! # Moving Parts
//!
//! 1. [`registry`] maps repository names to remotes, refs, and stored
//!    credentials. The registry document lives in a local file or in etcd,
//!    and is only ever changed through [`registry::Registry::update`], which
//!    retries on concurrent modification.
//! 2. [`git`] clones and fast-forwards working copies below the cache root.
//! 3. [`repository`] joins both: a name goes in, a working copy comes out.
//! 4. [`concept`] parses `path@repository` identifiers and loads concept
//!    definitions out of working copies.
//! 5. [`render`] evaluates a concept against typed values, and produces
//!    manifest files plus a `renderinfo.json` record of how they were made.

pub mod api;
pub mod concept;
pub mod config;
pub mod git;
pub mod path;
pub mod registry;
pub mod render;
pub mod repository;

pub use concept::{ConceptIdentifier, ConceptOrigin};
pub use registry::{Registry, Repository};
pub use render::{render_concept, Render, RenderInfo, RenderOpts};
pub use repository::RepositoryResolver;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! HTTP boundary helpers.
//!
//! Kable ships no server, but anything serving concepts over HTTP needs the
//! same two things: identifiers that survive being a single path segment,
//! and a status code for every error the library can produce. Both live
//! here so every adapter agrees on them.
//!
//! Status mapping matches exhaustively. A new error variant does not build
//! until it has a status here.

use crate::{
    concept::ConceptError,
    config::ConfigError,
    git::GitError,
    path::NoWayHome,
    registry::{store::StoreError, RegistryError},
    render::{evaluate::EvalError, RenderError},
    repository::RepositoryError,
};

use http::StatusCode;

/// Escape identifier for use as a single URL path segment.
///
/// Concept identifiers never contain `_`, so `/` can stand in for it.
pub fn escape_identifier(identifier: impl AsRef<str>) -> String {
    identifier.as_ref().replace('/', "_")
}

/// Undo [`escape_identifier`].
pub fn unescape_identifier(segment: impl AsRef<str>) -> String {
    segment.as_ref().replace('_', "/")
}

/// Map error to the HTTP status it is reported with.
pub trait HttpStatus {
    fn status_code(&self) -> StatusCode;
}

impl HttpStatus for StoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::StaleRegistry => StatusCode::CONFLICT,
            Self::Http { .. } | Self::Response { .. } => StatusCode::BAD_GATEWAY,
            Self::NoEndpoints => StatusCode::SERVICE_UNAVAILABLE,
            Self::MultipleRegistriesInStore { .. }
            | Self::Read { .. }
            | Self::Write { .. }
            | Self::Lock { .. }
            | Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl HttpStatus for RegistryError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRepositoryName(_) | Self::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            Self::RepositoryUnknown(_) => StatusCode::NOT_FOUND,
            Self::RepositoryAlreadyExists(_) | Self::Contention { .. } => StatusCode::CONFLICT,
            Self::MalformedAuth { .. } | Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(err) => err.status_code(),
        }
    }
}

impl HttpStatus for GitError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::RepositoryInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NonFastForward { .. } | Self::CacheConflict { .. } => StatusCode::CONFLICT,
            Self::Clone { .. } | Self::Pull { .. } => StatusCode::BAD_GATEWAY,
            Self::PathOccupied { .. }
            | Self::Lock { .. }
            | Self::IndicatifStyleTemplate(_)
            | Self::Git2(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl HttpStatus for RepositoryError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotInitialized(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::IndexRead { .. } | Self::IndexParse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::CacheRead { .. } | Self::CacheRemove { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Registry(err) => err.status_code(),
            Self::Git(err) => err.status_code(),
        }
    }
}

impl HttpStatus for ConceptError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::ConceptNotFound(_) => StatusCode::NOT_FOUND,
            Self::ConceptTypeUnsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Parse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Read { .. } | Self::Write { .. } | Self::Serialize { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Registry(err) => err.status_code(),
            Self::Repository(err) => err.status_code(),
        }
    }
}

impl HttpStatus for EvalError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Failed { .. } | Self::Output(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl HttpStatus for RenderError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ConceptTypeUnsupported(_) | Self::RenderTargetUnsupported(_) => {
                StatusCode::NOT_IMPLEMENTED
            }
            Self::ValueTypeNotSupported { .. }
            | Self::UndeclaredInput(_)
            | Self::InvalidSelection { .. }
            | Self::MissingMandatoryInput(_)
            | Self::RenderInfoVersion(_)
            | Self::InvalidRenderInfo(_) => StatusCode::BAD_REQUEST,
            Self::InvalidOutput(_) | Self::DuplicateManifest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Read { .. } | Self::Write { .. } | Self::Yaml(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Eval(err) => err.status_code(),
            Self::Concept(err) => err.status_code(),
        }
    }
}

impl HttpStatus for NoWayHome {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl HttpStatus for ConfigError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Read { .. }
            | Self::Deserialize(_)
            | Self::Serialize(_)
            | Self::ShellExpansion(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoWayHome(err) => err.status_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("apps/sentry@demo-https", "apps_sentry@demo-https"; "nested path")]
    #[test_case("nginx@demo", "nginx@demo"; "flat path")]
    #[test]
    fn identifiers_survive_path_segments(identifier: &str, segment: &str) {
        pretty_assertions::assert_eq!(escape_identifier(identifier), segment);
        pretty_assertions::assert_eq!(unescape_identifier(segment), identifier);
    }

    #[test]
    fn unknown_things_are_not_found() {
        let err = RegistryError::RepositoryUnknown("demo".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = RenderError::Concept(ConceptError::Repository(RepositoryError::Registry(err)));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = RenderError::Concept(ConceptError::ConceptNotFound("apps/x@demo".into()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn user_errors_are_not_server_errors() {
        let errors: Vec<Box<dyn HttpStatus>> = vec![
            Box::new(ConceptError::InvalidIdentifier("Apps".into())),
            Box::new(RegistryError::RepositoryAlreadyExists("demo".into())),
            Box::new(RenderError::MissingMandatoryInput("instanceName".into())),
            Box::new(RenderError::RenderTargetUnsupported("crd".into())),
            Box::new(GitError::RepositoryInvalid {
                url: "https://example.com/empty".into(),
                reason: "no kable.json".into(),
            }),
        ];
        for err in errors {
            assert_ne!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn scaffold_serialization_is_a_server_error() -> anyhow::Result<()> {
        let source = match serde_json::from_str::<u8>("not json") {
            Ok(_) => anyhow::bail!("expected malformed input"),
            Err(err) => err,
        };
        let err = ConceptError::Serialize {
            source,
            path: "apps/sentry/concept.json".into(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        Ok(())
    }

    #[test]
    fn cache_conflicts_are_conflicts() {
        let err = RepositoryError::Git(GitError::CacheConflict {
            path: "cache/concepts".into(),
            url: "https://example.com/b/concepts".into(),
            found: "https://example.com/a/concepts".into(),
        });
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn store_timeouts_are_gateway_timeouts() {
        let err = RegistryError::Store(StoreError::Timeout {
            endpoint: "http://127.0.0.1:2379".into(),
        });
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}

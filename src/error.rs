/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/error.rs
*
* This file defines the error taxonomy shared by every engine of the core.
* Errors coming from the Kubernetes client are mapped onto a small set of
* kinds that the RPC layer renders as stable strings and HTTP statuses.
* Batch operations (sync, suspend) accumulate per-object failures into a
* `MultiError` instead of aborting on the first one.
*
* SPDX-License-Identifier: Apache-2.0 */

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Multi(MultiError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable, snake_case name of the error kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::PermissionDenied(_) => "permission_denied",
            Error::Conflict(_) => "conflict",
            Error::Timeout(_) => "timeout",
            Error::Unavailable(_) => "unavailable",
            Error::Internal(_) => "internal",
            Error::Multi(_) => "multi",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn cluster_not_found(cluster: &str) -> Self {
        Error::NotFound(format!("cluster={} not found", cluster))
    }

    /// Prefixes the message, keeping the kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        let wrap = |message: String| format!("{}: {}", context, message);
        match self {
            Error::InvalidArgument(m) => Error::InvalidArgument(wrap(m)),
            Error::NotFound(m) => Error::NotFound(wrap(m)),
            Error::PermissionDenied(m) => Error::PermissionDenied(wrap(m)),
            Error::Conflict(m) => Error::Conflict(wrap(m)),
            Error::Timeout(m) => Error::Timeout(wrap(m)),
            Error::Unavailable(m) => Error::Unavailable(wrap(m)),
            Error::Internal(m) => Error::Internal(wrap(m)),
            Error::Multi(m) => Error::Multi(m),
        }
    }
}

// --- Kubernetes client error mapping ---

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Error::NotFound(ae.message),
                401 | 403 => Error::PermissionDenied(ae.message),
                409 => Error::Conflict(ae.message),
                400 | 422 => Error::InvalidArgument(ae.message),
                429 | 500..=599 => Error::Unavailable(ae.message),
                _ => Error::Internal(ae.message),
            },
            kube::Error::HyperError(e) => Error::Unavailable(e.to_string()),
            kube::Error::Service(e) => Error::Unavailable(e.to_string()),
            kube::Error::SerdeError(e) => Error::Internal(format!("decoding response: {}", e)),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {}", err))
    }
}

impl From<kube::config::KubeconfigError> for Error {
    fn from(err: kube::config::KubeconfigError) -> Self {
        Error::Unavailable(format!("loading kubeconfig: {}", err))
    }
}

impl From<kube::config::InferConfigError> for Error {
    fn from(err: kube::config::InferConfigError) -> Self {
        Error::Unavailable(format!("inferring cluster config: {}", err))
    }
}

// --- Accumulated batch errors ---

/// Per-object failures collected by sync and suspend batches.
#[derive(Debug, Default)]
pub struct MultiError {
    pub errors: Vec<Error>,
}

impl MultiError {
    pub fn push(&mut self, err: Error) {
        match err {
            Error::Multi(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Ok when nothing was collected; the single error unwrapped when only
    /// one was; the whole batch otherwise.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("code {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_kube_error_mapping() {
        assert_eq!(Error::from(api_error(404)).kind(), "not_found");
        assert_eq!(Error::from(api_error(403)).kind(), "permission_denied");
        assert_eq!(Error::from(api_error(401)).kind(), "permission_denied");
        assert_eq!(Error::from(api_error(409)).kind(), "conflict");
        assert_eq!(Error::from(api_error(422)).kind(), "invalid_argument");
        assert_eq!(Error::from(api_error(503)).kind(), "unavailable");
        assert_eq!(Error::from(api_error(418)).kind(), "internal");
    }

    #[test]
    fn test_multi_error_flattens() {
        let mut inner = MultiError::default();
        inner.push(Error::NotFound("a".into()));
        inner.push(Error::Timeout("b".into()));

        let mut outer = MultiError::default();
        outer.push(Error::Multi(inner));
        outer.push(Error::Conflict("c".into()));
        assert_eq!(outer.errors.len(), 3);

        let rendered = outer.to_string();
        assert!(rendered.starts_with("3 errors occurred:"));
        assert!(rendered.contains("conflict: c"));
    }

    #[test]
    fn test_multi_error_into_result() {
        assert!(MultiError::default().into_result().is_ok());

        let mut single = MultiError::default();
        single.push(Error::NotFound("gone".into()));
        assert!(matches!(single.into_result(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_cluster_not_found_message() {
        assert_eq!(Error::cluster_not_found("B").to_string(), "cluster=B not found");
    }

    #[test]
    fn test_context_keeps_kind() {
        let err = Error::Timeout("too slow".into()).context("syncing source");
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), "syncing source: too slow");
    }
}

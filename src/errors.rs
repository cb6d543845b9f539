//! Structured error types for the reflector engine.
//!
//! Mirrors the shape of the teacher app's error tree: one top-level enum
//! per subsystem, each wrapped into a top-level [`EngineError`], with
//! `pub type ...Result<T>` aliases for ergonomics.

use thiserror::Error;

/// Errors surfaced by the cluster gateway (§4.B/§7 of the spec).
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{kind} {qn} not found")]
    NotFound { kind: &'static str, qn: String },

    #[error("{kind} {qn} already exists")]
    AlreadyExists { kind: &'static str, qn: String },

    #[error("patch of {kind} {qn} conflicted with a concurrent update")]
    Conflict { kind: &'static str, qn: String },

    #[error("operation on {kind} {qn} forbidden: {message}")]
    Forbidden {
        kind: &'static str,
        qn: String,
        message: String,
    },

    #[error("transport error talking to the cluster API: {message}")]
    Transport { message: String },

    #[error("unrecoverable cluster API error: {message}")]
    Unrecoverable { message: String },
}

impl GatewayError {
    /// Classifies a raw `kube::Error` the way the gateway's contract requires
    /// (§4.B/§7): `NotFound`/`Conflict`/`Forbidden` are distinguished from the
    /// catch-all `Transport`/`Unrecoverable` buckets.
    pub fn from_kube(kind: &'static str, qn: impl Into<String>, err: kube::Error) -> Self {
        let qn = qn.into();
        match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => GatewayError::NotFound { kind, qn },
                409 => GatewayError::Conflict { kind, qn },
                403 | 401 => GatewayError::Forbidden {
                    kind,
                    qn,
                    message: resp.message.clone(),
                },
                410..=499 => GatewayError::Unrecoverable {
                    message: resp.message.clone(),
                },
                _ => GatewayError::Transport {
                    message: resp.message.clone(),
                },
            },
            other => GatewayError::Transport {
                message: other.to_string(),
            },
        }
    }
}

/// A malformed annotation never aborts anything (§7): callers log it and
/// fall back to treating the value as absent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("annotation {key} has invalid boolean value {value:?}")]
    InvalidBool { key: &'static str, value: String },

    #[error("annotation {key} has invalid regex token {token:?}: {message}")]
    InvalidRegex {
        key: &'static str,
        token: String,
        message: String,
    },

    #[error("annotation {key} has malformed qualified name {value:?}")]
    InvalidQn { key: &'static str, value: String },
}

/// Configuration loading/validation errors (§6), modeled one-for-one on the
/// teacher's `ConfigError`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration value for {field}: {value} - expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("failed to read configuration file {path}: {error}")]
    FileReadError { path: String, error: String },

    #[error("failed to parse configuration file {path}: {error}")]
    ParseError { path: String, error: String },

    #[error("failed to build a kubeconfig-backed client: {0}")]
    ClientBuild(String),
}

/// Top-level error type for startup failures (§6: non-zero exit).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type EngineResult<T> = Result<T, EngineError>;

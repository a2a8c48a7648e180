use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;
use votegate_config::ConfigError;

use crate::secret_service::{EmbeddingKeyLookupError, SecretServiceError};

/// Coarse classification used by the transport layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Input,
    NotFound,
    RateLimited,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid identity '{identity}': {message}")]
    InvalidIdentity { identity: String, message: String },

    #[error("Invalid image data: {0}")]
    InvalidImage(String),

    #[error("User not enrolled. Please enroll first.")]
    NotEnrolled { identity: String },

    #[error("{reason}")]
    EnrollmentRejected { reason: String },

    #[error("rate limit exceeded for {key}; retry in {retry_after_secs}s")]
    RateLimited { key: String, retry_after_secs: u64 },

    #[error("missing {kind} model; provide {flag} or set ${env}")]
    MissingModel {
        kind: &'static str,
        flag: &'static str,
        env: &'static str,
    },

    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    #[error("embedding oracle failure: {0}")]
    Oracle(String),

    #[error("failed to read enrollment store {path}: {source}")]
    StoreRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write enrollment store {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("enrollment record {path} is invalid: {message}")]
    InvalidStoreFile { path: PathBuf, message: String },

    #[error("failed to append to audit log {path}: {source}")]
    AuditWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("audit log {path} is invalid: {message}")]
    InvalidAuditLog { path: PathBuf, message: String },

    #[error("embedding encryption error: {0}")]
    Encryption(String),

    #[error("missing {name}; set ${env}")]
    MissingSecret {
        name: &'static str,
        env: &'static str,
    },

    #[error("{name} is invalid: {message}")]
    InvalidSecret { name: &'static str, message: String },

    #[error("Secret Service unavailable for entry {entry} (service {service}): {message}")]
    SecretServiceUnavailable {
        entry: String,
        service: String,
        message: String,
    },

    #[error("embedding key already present in {service}/{entry}; pass --force to replace it")]
    KeyAlreadyPresent { service: String, entry: String },

    #[error("failed to mint verification token: {0}")]
    Token(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::InvalidIdentity { .. }
            | AppError::InvalidImage(_)
            | AppError::EnrollmentRejected { .. }
            | AppError::KeyAlreadyPresent { .. } => ErrorClass::Input,
            AppError::NotEnrolled { .. } => ErrorClass::NotFound,
            AppError::RateLimited { .. } => ErrorClass::RateLimited,
            _ => ErrorClass::Infrastructure,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            AppError::InvalidIdentity { .. } => ExitCode::from(2),
            AppError::InvalidImage(_) => ExitCode::from(2),
            AppError::EnrollmentRejected { .. } => ExitCode::from(3),
            AppError::NotEnrolled { .. } => ExitCode::from(4),
            AppError::RateLimited { .. } => ExitCode::from(5),
            AppError::MissingModel { .. } => ExitCode::from(2),
            AppError::ModelLoad { .. } => ExitCode::from(2),
            AppError::MissingSecret { .. } => ExitCode::from(2),
            AppError::InvalidSecret { .. } => ExitCode::from(2),
            AppError::SecretServiceUnavailable { .. } => ExitCode::from(2),
            AppError::KeyAlreadyPresent { .. } => ExitCode::from(3),
            AppError::Config(_) => ExitCode::from(2),
            AppError::InvalidStoreFile { .. } => ExitCode::from(2),
            AppError::Encryption(_) => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<SecretServiceError> for AppError {
    fn from(err: SecretServiceError) -> Self {
        AppError::SecretServiceUnavailable {
            entry: err.entry().to_string(),
            service: err.service().to_string(),
            message: err.message().to_string(),
        }
    }
}

impl From<EmbeddingKeyLookupError> for AppError {
    fn from(err: EmbeddingKeyLookupError) -> Self {
        match err {
            EmbeddingKeyLookupError::SecretService(inner) => AppError::from(inner),
            EmbeddingKeyLookupError::InvalidFormat { reason, .. } => AppError::InvalidSecret {
                name: "embedding key",
                message: reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biometric_inputs_classify_as_input_errors() {
        assert_eq!(
            AppError::InvalidImage("truncated".into()).class(),
            ErrorClass::Input
        );
        assert_eq!(
            AppError::NotEnrolled {
                identity: "0xabc".into()
            }
            .class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            AppError::Oracle("model crashed".into()).class(),
            ErrorClass::Infrastructure
        );
    }

    #[test]
    fn not_enrolled_message_does_not_echo_identity() {
        let err = AppError::NotEnrolled {
            identity: "0xdeadbeef".into(),
        };
        assert!(!err.human_message().contains("0xdeadbeef"));
    }
}

use std::env;

use base64::{engine::general_purpose, Engine as _};
use keyring::{error::Error as KeyringError, Entry};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use crate::errors::{AppError, AppResult};

const DEFAULT_SERVICE_NAME: &str = "votegate";
const EMBEDDING_KEY_ENTRY: &str = "embedding-key";
pub const EMBEDDING_KEY_ENV: &str = "VOTEGATE_EMBEDDING_KEY";
pub const TOKEN_SECRET_ENV: &str = "VOTEGATE_TOKEN_SECRET";
pub const SIGNER_KEY_ENV: &str = "VOTEGATE_SIGNER_KEY";
pub const AES_GCM_KEY_BYTES: usize = 32;
pub const MIN_TOKEN_SECRET_BYTES: usize = 32;

#[derive(Debug, Error, Clone)]
#[error("Secret Service unavailable for entry '{entry}' (service '{service}'): {message}")]
pub struct SecretServiceError {
    entry: String,
    service: String,
    message: String,
}

impl SecretServiceError {
    pub fn new(
        entry: impl Into<String>,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            entry: entry.into(),
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone)]
pub enum EmbeddingKeyStatus {
    Present(EmbeddingKey),
    Missing,
}

#[derive(Clone)]
pub struct EmbeddingKey {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for EmbeddingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingKey").finish_non_exhaustive()
    }
}

impl EmbeddingKey {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; AES_GCM_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, EmbeddingKeyLookupError> {
        if bytes.len() != AES_GCM_KEY_BYTES {
            return Err(EmbeddingKeyLookupError::InvalidFormat {
                source_name: EMBEDDING_KEY_ENTRY.to_string(),
                reason: format!(
                    "expected {AES_GCM_KEY_BYTES} bytes but found {}",
                    bytes.len()
                ),
            });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.bytes)
    }
}

#[derive(Debug, Error, Clone)]
pub enum EmbeddingKeyLookupError {
    #[error(transparent)]
    SecretService(#[from] SecretServiceError),
    #[error("{source_name} holds an invalid AES-GCM key: {reason}")]
    InvalidFormat { source_name: String, reason: String },
}

/// Read access to process-level secret variables.
pub trait SecretSource {
    fn var(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl SecretSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name).ok().filter(|value| !value.trim().is_empty())
    }
}

pub trait EmbeddingKeyStore {
    fn fetch(&self) -> Result<EmbeddingKeyStatus, EmbeddingKeyLookupError>;
    fn store(&self, key: &EmbeddingKey) -> Result<(), SecretServiceError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringEmbeddingKeyStore;

impl EmbeddingKeyStore for KeyringEmbeddingKeyStore {
    fn fetch(&self) -> Result<EmbeddingKeyStatus, EmbeddingKeyLookupError> {
        let entry = keyring_entry()?;
        match entry.get_password() {
            Ok(secret) => {
                decode_embedding_key(EMBEDDING_KEY_ENTRY, &secret).map(EmbeddingKeyStatus::Present)
            }
            Err(KeyringError::NoEntry) => Ok(EmbeddingKeyStatus::Missing),
            Err(err) => Err(EmbeddingKeyLookupError::SecretService(
                SecretServiceError::new(
                    EMBEDDING_KEY_ENTRY,
                    DEFAULT_SERVICE_NAME,
                    describe_keyring_error(&err),
                ),
            )),
        }
    }

    fn store(&self, key: &EmbeddingKey) -> Result<(), SecretServiceError> {
        let entry = keyring_entry()?;
        entry.set_password(&key.to_base64()).map_err(|err| {
            SecretServiceError::new(
                EMBEDDING_KEY_ENTRY,
                DEFAULT_SERVICE_NAME,
                describe_keyring_error(&err),
            )
        })
    }
}

pub trait SecretServiceProbe {
    fn check(&self) -> Result<(), SecretServiceError>;
}

#[derive(Debug, Clone, Copy)]
pub struct KeyringSecretServiceProbe;

impl SecretServiceProbe for KeyringSecretServiceProbe {
    fn check(&self) -> Result<(), SecretServiceError> {
        let entry = keyring_entry()?;
        match entry.get_password() {
            Ok(_) | Err(KeyringError::NoEntry) => Ok(()),
            Err(err) => Err(SecretServiceError::new(
                EMBEDDING_KEY_ENTRY,
                DEFAULT_SERVICE_NAME,
                describe_keyring_error(&err),
            )),
        }
    }
}

/// Resolves the at-rest key for enrollment records: the environment first,
/// then the Secret Service entry. There is no built-in fallback key.
pub fn resolve_embedding_key<E, K>(env: &E, keys: &K) -> AppResult<EmbeddingKey>
where
    E: SecretSource,
    K: EmbeddingKeyStore,
{
    if let Some(encoded) = env.var(EMBEDDING_KEY_ENV) {
        return decode_embedding_key(EMBEDDING_KEY_ENV, &encoded).map_err(AppError::from);
    }

    match keys.fetch()? {
        EmbeddingKeyStatus::Present(key) => Ok(key),
        EmbeddingKeyStatus::Missing => Err(AppError::MissingSecret {
            name: "embedding encryption key",
            env: EMBEDDING_KEY_ENV,
        }),
    }
}

pub fn resolve_token_secret<E: SecretSource>(env: &E) -> AppResult<Vec<u8>> {
    let secret = env.var(TOKEN_SECRET_ENV).ok_or(AppError::MissingSecret {
        name: "token signing secret",
        env: TOKEN_SECRET_ENV,
    })?;
    let bytes = secret.trim().as_bytes().to_vec();
    if bytes.len() < MIN_TOKEN_SECRET_BYTES {
        return Err(AppError::InvalidSecret {
            name: "token signing secret",
            message: format!(
                "expected at least {MIN_TOKEN_SECRET_BYTES} bytes but found {}",
                bytes.len()
            ),
        });
    }
    Ok(bytes)
}

/// The permit signer is optional; `None` disables on-chain signatures.
pub fn resolve_signer_key<E: SecretSource>(env: &E) -> Option<String> {
    env.var(SIGNER_KEY_ENV)
        .map(|value| value.trim().to_string())
}

pub fn ensure_secret_service_available<P: SecretServiceProbe>(
    probe: &P,
) -> Result<(), SecretServiceError> {
    probe.check()
}

pub fn default_service_name() -> &'static str {
    DEFAULT_SERVICE_NAME
}

pub fn embedding_key_entry() -> &'static str {
    EMBEDDING_KEY_ENTRY
}

fn keyring_entry() -> Result<Entry, SecretServiceError> {
    Entry::new(DEFAULT_SERVICE_NAME, EMBEDDING_KEY_ENTRY).map_err(|err| {
        SecretServiceError::new(
            EMBEDDING_KEY_ENTRY,
            DEFAULT_SERVICE_NAME,
            format!("failed to create keyring entry: {err}"),
        )
    })
}

fn describe_keyring_error(err: &KeyringError) -> String {
    match err {
        KeyringError::NoStorageAccess(inner) => {
            format!("Secret Service locked or unavailable: {inner}")
        }
        KeyringError::PlatformFailure(inner) => {
            format!("Secret Service platform failure: {inner}")
        }
        KeyringError::BadEncoding(_) => "Secret Service returned a non-UTF8 secret".into(),
        KeyringError::NoEntry => "Secret Service reported no entry".into(),
        _ => format!("Secret Service error: {err}"),
    }
}

fn decode_embedding_key(
    source_name: &str,
    secret: &str,
) -> Result<EmbeddingKey, EmbeddingKeyLookupError> {
    let invalid = |reason: String| EmbeddingKeyLookupError::InvalidFormat {
        source_name: source_name.to_string(),
        reason,
    };

    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return Err(invalid("stored secret was empty".into()));
    }

    let decoded = general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .map_err(|err| invalid(format!("base64 decode failed: {err}")))?;

    if decoded.len() != AES_GCM_KEY_BYTES {
        return Err(invalid(format!(
            "expected {AES_GCM_KEY_BYTES} bytes but found {}",
            decoded.len()
        )));
    }
    Ok(EmbeddingKey { bytes: decoded })
}

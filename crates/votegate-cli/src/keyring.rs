use serde::Serialize;
use tracing::{info, warn};
use votegate_core::secret_service::{
    default_service_name, embedding_key_entry, EmbeddingKey, EmbeddingKeyLookupError,
    EmbeddingKeyStatus, EmbeddingKeyStore, KeyringEmbeddingKeyStore,
};

use crate::cli::KeyringInitArgs;
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Serialize)]
pub struct KeyringInitOutcome {
    pub service: String,
    pub entry: String,
    pub replaced: bool,
}

pub fn run_keyring_init(args: &KeyringInitArgs) -> AppResult<KeyringInitOutcome> {
    run_keyring_init_with(args, &KeyringEmbeddingKeyStore)
}

pub fn run_keyring_init_with<K: EmbeddingKeyStore>(
    args: &KeyringInitArgs,
    keys: &K,
) -> AppResult<KeyringInitOutcome> {
    let existing = match keys.fetch() {
        Ok(EmbeddingKeyStatus::Present(_)) => true,
        Ok(EmbeddingKeyStatus::Missing) => false,
        // An unreadable value still occupies the entry.
        Err(EmbeddingKeyLookupError::InvalidFormat { .. }) => true,
        Err(EmbeddingKeyLookupError::SecretService(err)) => return Err(err.into()),
    };

    if existing && !args.force {
        return Err(AppError::KeyAlreadyPresent {
            service: default_service_name().into(),
            entry: embedding_key_entry().into(),
        });
    }

    keys.store(&EmbeddingKey::generate())?;
    if existing {
        warn!(
            service = default_service_name(),
            entry = embedding_key_entry(),
            "embedding key replaced; records encrypted with the old key are unreadable"
        );
    } else {
        info!(
            service = default_service_name(),
            entry = embedding_key_entry(),
            "embedding key stored"
        );
    }

    Ok(KeyringInitOutcome {
        service: default_service_name().into(),
        entry: embedding_key_entry().into(),
        replaced: existing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use votegate_core::secret_service::SecretServiceError;

    struct StubKeys {
        current: Result<Option<EmbeddingKey>, SecretServiceError>,
        stored: Mutex<Vec<EmbeddingKey>>,
    }

    impl StubKeys {
        fn with(current: Option<EmbeddingKey>) -> Self {
            Self {
                current: Ok(current),
                stored: Mutex::new(Vec::new()),
            }
        }
    }

    impl EmbeddingKeyStore for StubKeys {
        fn fetch(&self) -> Result<EmbeddingKeyStatus, EmbeddingKeyLookupError> {
            match &self.current {
                Ok(Some(key)) => Ok(EmbeddingKeyStatus::Present(key.clone())),
                Ok(None) => Ok(EmbeddingKeyStatus::Missing),
                Err(err) => Err(EmbeddingKeyLookupError::SecretService(err.clone())),
            }
        }

        fn store(&self, key: &EmbeddingKey) -> Result<(), SecretServiceError> {
            self.stored.lock().unwrap().push(key.clone());
            Ok(())
        }
    }

    #[test]
    fn fresh_entry_is_initialised() {
        let keys = StubKeys::with(None);
        let outcome = run_keyring_init_with(&KeyringInitArgs { force: false }, &keys).unwrap();
        assert!(!outcome.replaced);
        assert_eq!(outcome.service, "votegate");
        assert_eq!(outcome.entry, "embedding-key");
        assert_eq!(keys.stored.lock().unwrap().len(), 1);
    }

    #[test]
    fn existing_key_requires_force() {
        let keys = StubKeys::with(Some(EmbeddingKey::generate()));
        let err = run_keyring_init_with(&KeyringInitArgs { force: false }, &keys).unwrap_err();
        assert!(matches!(err, AppError::KeyAlreadyPresent { .. }));
        assert!(keys.stored.lock().unwrap().is_empty());

        let outcome = run_keyring_init_with(&KeyringInitArgs { force: true }, &keys).unwrap();
        assert!(outcome.replaced);
        assert_eq!(keys.stored.lock().unwrap().len(), 1);
    }

    #[test]
    fn unavailable_secret_service_is_reported() {
        let keys = StubKeys {
            current: Err(SecretServiceError::new("embedding-key", "votegate", "no dbus")),
            stored: Mutex::new(Vec::new()),
        };
        let err = run_keyring_init_with(&KeyringInitArgs { force: true }, &keys).unwrap_err();
        assert!(matches!(err, AppError::SecretServiceUnavailable { .. }));
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use votegate_config::ResolvedConfig;

use crate::audit::{AuditLog, JsonlAuditLog};
use crate::credentials::{
    peek_expiry, CredentialIssuer, PermitSigner, TokenIssuer, VerificationClaims,
};
use crate::decision::{run_verification_with, VerificationPolicy, VerifyOutcome, VerifyRequest};
use crate::errors::AppResult;
use crate::faces::enrollment::{
    run_enrollment_with, EnrollmentOutcome, EnrollmentPolicy, EnrollmentRequest,
};
use crate::faces::extractor::{DlibBackend, FaceEmbeddingBackend, OracleConfig};
use crate::faces::store::{EnrollmentStore, FilesystemEnrollmentStore};
use crate::identity::Identity;
use crate::rate_limit::RateLimiter;
use crate::secret_service::{
    resolve_embedding_key, resolve_signer_key, resolve_token_secret, EmbeddingKeyStore,
    KeyringEmbeddingKeyStore, ProcessEnv, SecretSource,
};

pub const SERVICE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub enrolled: bool,
    pub identity: Identity,
    pub enrollment_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_address: Option<String>,
}

/// Everything a transport needs, built once at startup and shared behind
/// `Arc`.
pub struct VerificationService {
    oracle: Arc<dyn FaceEmbeddingBackend>,
    store: Arc<dyn EnrollmentStore>,
    audit: Arc<dyn AuditLog>,
    credentials: CredentialIssuer,
    limiter: RateLimiter,
    policy: VerificationPolicy,
    enrollment_policy: EnrollmentPolicy,
    request_timeout: Duration,
}

impl VerificationService {
    pub fn new(
        config: &ResolvedConfig,
        oracle: Arc<dyn FaceEmbeddingBackend>,
        store: Arc<dyn EnrollmentStore>,
        audit: Arc<dyn AuditLog>,
        credentials: CredentialIssuer,
    ) -> Self {
        Self {
            oracle,
            store,
            audit,
            credentials,
            limiter: RateLimiter::new(config.rate_limit_requests, config.rate_limit_period),
            policy: VerificationPolicy::from_config(config),
            enrollment_policy: EnrollmentPolicy {
                min_face_ratio: config.min_face_ratio,
            },
            request_timeout: config.request_timeout,
        }
    }

    /// Loads the dlib models and resolves secrets from the process
    /// environment and the Secret Service.
    pub fn bootstrap(config: &ResolvedConfig) -> AppResult<Self> {
        let oracle = DlibBackend::from_config(&OracleConfig {
            landmark_model: config.landmark_model.clone(),
            encoder_model: config.encoder_model.clone(),
            jitters: config.jitters,
        })?;
        Self::bootstrap_with(config, Arc::new(oracle), &ProcessEnv, &KeyringEmbeddingKeyStore)
    }

    pub fn bootstrap_with<E, K>(
        config: &ResolvedConfig,
        oracle: Arc<dyn FaceEmbeddingBackend>,
        env: &E,
        keys: &K,
    ) -> AppResult<Self>
    where
        E: SecretSource,
        K: EmbeddingKeyStore,
    {
        let embedding_key = resolve_embedding_key(env, keys)?;
        let token_secret = resolve_token_secret(env)?;
        let tokens = TokenIssuer::new(&token_secret, &config.token_algorithm, config.token_expiry)?;

        let signer = match resolve_signer_key(env) {
            Some(hex) => {
                let signer = PermitSigner::from_hex(&hex).map_err(|err| {
                    error!(error = %err, "signer key rejected");
                    err
                })?;
                info!(address = %signer.checksum_address(), "permit signer loaded");
                Some(signer)
            }
            None => {
                warn!("no signer key configured; voting permits will not be signed");
                None
            }
        };

        let store = FilesystemEnrollmentStore::new(&config.embedding_store_dir, embedding_key);
        let audit = JsonlAuditLog::open(&config.audit_log_path)?;
        info!(
            store = %config.embedding_store_dir.display(),
            audit = %config.audit_log_path.display(),
            "verification service ready"
        );

        Ok(Self::new(
            config,
            oracle,
            Arc::new(store),
            Arc::new(audit),
            CredentialIssuer::new(tokens, signer),
        ))
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn check_rate_limit(&self, key: &str) -> AppResult<()> {
        self.limiter.check(key)
    }

    pub fn enroll(&self, identity: &Identity, image: Vec<u8>) -> AppResult<EnrollmentOutcome> {
        let request = EnrollmentRequest {
            identity: identity.clone(),
            image,
        };
        run_enrollment_with(
            &request,
            &self.enrollment_policy,
            self.oracle.as_ref(),
            self.store.as_ref(),
        )
    }

    pub fn verify(&self, request: &VerifyRequest) -> AppResult<VerifyOutcome> {
        run_verification_with(
            request,
            &self.policy,
            self.oracle.as_ref(),
            self.store.as_ref(),
            self.audit.as_ref(),
            &self.credentials,
        )
    }

    pub fn status(&self, identity: &Identity) -> AppResult<StatusReport> {
        enrollment_status(self.store.as_ref(), identity)
    }

    pub fn validate_token(&self, token: &str) -> Option<VerificationClaims> {
        self.credentials.tokens().validate(token)
    }

    pub fn peek_token_expiry(&self, token: &str) -> Option<DateTime<Utc>> {
        peek_expiry(token)
    }

    /// Deletes the stored template. Returns `false` when nothing was
    /// enrolled.
    pub fn revoke_enrollment(&self, identity: &Identity) -> AppResult<bool> {
        let removed = self.store.delete(identity)?;
        if removed {
            info!(identity = %identity.redacted(), "enrollment revoked");
        }
        Ok(removed)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            timestamp: Utc::now(),
            version: SERVICE_VERSION,
            signer_address: self.credentials.signer_address(),
        }
    }
}

pub fn enrollment_status<S>(store: &S, identity: &Identity) -> AppResult<StatusReport>
where
    S: EnrollmentStore + ?Sized,
{
    let record = store.get(identity)?.filter(|record| record.is_usable());
    Ok(StatusReport {
        enrolled: record.is_some(),
        identity: identity.clone(),
        enrollment_date: record.map(|record| record.created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::errors::AppError;
    use crate::faces::decode::tests::png_bytes;
    use crate::secret_service::tests::MapEnv;
    use crate::secret_service::{
        EmbeddingKey, EmbeddingKeyLookupError, EmbeddingKeyStatus, SecretServiceError,
        EMBEDDING_KEY_ENV, SIGNER_KEY_ENV, TOKEN_SECRET_ENV,
    };
    use crate::testing::{credentials, voter, MemoryAudit, MemoryStore, StubOracle};

    struct NoKeyring;

    impl EmbeddingKeyStore for NoKeyring {
        fn fetch(&self) -> Result<EmbeddingKeyStatus, EmbeddingKeyLookupError> {
            Ok(EmbeddingKeyStatus::Missing)
        }

        fn store(&self, _key: &EmbeddingKey) -> Result<(), SecretServiceError> {
            Ok(())
        }
    }

    fn memory_service(oracle: StubOracle) -> VerificationService {
        let config = ResolvedConfig {
            enable_liveness: false,
            ..ResolvedConfig::default()
        };
        VerificationService::new(
            &config,
            Arc::new(oracle),
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryAudit::default()),
            credentials(None),
        )
    }

    fn temp_config(dir: &Path) -> ResolvedConfig {
        ResolvedConfig {
            embedding_store_dir: dir.join("enrollments"),
            audit_log_path: dir.join("audit.jsonl"),
            ..ResolvedConfig::default()
        }
    }

    #[test]
    fn status_tracks_enroll_and_revoke() {
        let service = memory_service(StubOracle::single(vec![0.3, 0.4, 0.5]));
        let voter = voter();

        assert!(!service.status(&voter).unwrap().enrolled);
        service.enroll(&voter, png_bytes(100, 100)).unwrap();

        let status = service.status(&voter).unwrap();
        assert!(status.enrolled);
        assert!(status.enrollment_date.is_some());

        assert!(service.revoke_enrollment(&voter).unwrap());
        assert!(!service.revoke_enrollment(&voter).unwrap());
        assert!(!service.status(&voter).unwrap().enrolled);
    }

    #[test]
    fn issued_token_validates_through_service() {
        let service = memory_service(StubOracle::single(vec![0.3, 0.4, 0.5]));
        let voter = voter();
        service.enroll(&voter, png_bytes(100, 100)).unwrap();

        let outcome = service
            .verify(&VerifyRequest::new(voter.clone(), png_bytes(100, 100)))
            .unwrap();
        let token = outcome.token.unwrap();

        let claims = service.validate_token(&token).unwrap();
        assert_eq!(claims.sub, voter.as_str());
        assert!(service.peek_token_expiry(&token).is_some());
        assert!(service.validate_token("not-a-token").is_none());
    }

    #[test]
    fn health_reports_version_without_signer() {
        let health = memory_service(StubOracle::single(vec![1.0])).health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.version, SERVICE_VERSION);
        assert!(health.signer_address.is_none());
    }

    #[test]
    fn bootstrap_requires_token_secret() {
        let dir = tempfile::tempdir().unwrap();
        let key = EmbeddingKey::generate().to_base64();
        let env = MapEnv::with(&[(EMBEDDING_KEY_ENV, key.as_str())]);

        let result = VerificationService::bootstrap_with(
            &temp_config(dir.path()),
            Arc::new(StubOracle::single(vec![1.0])),
            &env,
            &NoKeyring,
        );
        assert!(matches!(
            result,
            Err(AppError::MissingSecret {
                env: TOKEN_SECRET_ENV,
                ..
            })
        ));
    }

    #[test]
    fn bootstrap_requires_embedding_key() {
        let dir = tempfile::tempdir().unwrap();
        let secret = "s".repeat(40);
        let env = MapEnv::with(&[(TOKEN_SECRET_ENV, secret.as_str())]);

        let result = VerificationService::bootstrap_with(
            &temp_config(dir.path()),
            Arc::new(StubOracle::single(vec![1.0])),
            &env,
            &NoKeyring,
        );
        assert!(matches!(
            result,
            Err(AppError::MissingSecret {
                env: EMBEDDING_KEY_ENV,
                ..
            })
        ));
    }

    #[test]
    fn bootstrap_rejects_invalid_signer_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = EmbeddingKey::generate().to_base64();
        let secret = "s".repeat(40);
        let env = MapEnv::with(&[
            (EMBEDDING_KEY_ENV, key.as_str()),
            (TOKEN_SECRET_ENV, secret.as_str()),
            (SIGNER_KEY_ENV, "not-hex"),
        ]);

        let result = VerificationService::bootstrap_with(
            &temp_config(dir.path()),
            Arc::new(StubOracle::single(vec![1.0])),
            &env,
            &NoKeyring,
        );
        assert!(matches!(result, Err(AppError::InvalidSecret { .. })));
    }

    #[test]
    fn bootstrap_exposes_signer_address() {
        let dir = tempfile::tempdir().unwrap();
        let key = EmbeddingKey::generate().to_base64();
        let secret = "s".repeat(40);
        let env = MapEnv::with(&[
            (EMBEDDING_KEY_ENV, key.as_str()),
            (TOKEN_SECRET_ENV, secret.as_str()),
            (
                SIGNER_KEY_ENV,
                "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
            ),
        ]);

        let service = VerificationService::bootstrap_with(
            &temp_config(dir.path()),
            Arc::new(StubOracle::single(vec![1.0])),
            &env,
            &NoKeyring,
        )
        .unwrap();
        assert_eq!(
            service.health().signer_address.as_deref(),
            Some("0x2c7536E3605D9C16a7a3D7b1898e529396a65c23")
        );
        assert!(dir.path().join("audit.jsonl").exists());
    }
}

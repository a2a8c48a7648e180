use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use tempfile::TempDir;
use votegate_config::ResolvedConfig;
use votegate_core::audit::{read_entries, AttemptOutcome};
use votegate_core::decision::VerifyRequest;
use votegate_core::errors::{AppError, AppResult};
use votegate_core::faces::{
    BoundingBox, FaceDetection, FaceEmbeddingBackend, FaceEmbeddingRecord, OracleOutcome,
};
use votegate_core::secret_service::{
    EmbeddingKey, EmbeddingKeyLookupError, EmbeddingKeyStatus, EmbeddingKeyStore,
    SecretServiceError, SecretSource, EMBEDDING_KEY_ENV, TOKEN_SECRET_ENV,
};
use votegate_core::{Identity, VerificationService};

const VOTER: &str = "0xAb5801a7D398351b8bE11C439e05C5B3259aeC9B";

#[test]
fn integration_enroll_verify_revoke_against_disk() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    let oracle = Arc::new(SwitchableOracle::new(vec![0.2, 0.9, 0.1, 0.4]));
    let env = StaticEnv::new();
    let service =
        VerificationService::bootstrap_with(&config, oracle.clone(), &env, &NoKeyring).unwrap();
    let voter = Identity::parse(VOTER).unwrap();

    assert!(!service.status(&voter).unwrap().enrolled);
    let enrolled = service.enroll(&voter, checkerboard_png()).unwrap();
    assert_eq!(enrolled.enrollment_count, 1);

    // The record on disk is ciphertext.
    let record_file = std::fs::read_dir(&config.embedding_store_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let raw = std::fs::read_to_string(&record_file).unwrap();
    assert!(raw.contains("AES-256-GCM"));
    assert!(!raw.contains(&voter.to_string()));

    let accepted = service
        .verify(&VerifyRequest::new(voter.clone(), checkerboard_png()))
        .unwrap();
    assert!(accepted.verified);
    assert!(accepted.liveness_passed);
    assert!(accepted.signature.is_none());
    let claims = service
        .validate_token(accepted.token.as_deref().unwrap())
        .unwrap();
    assert_eq!(claims.sub, voter.as_str());

    oracle.set(vec![-0.2, -0.9, -0.1, -0.4]);
    let rejected = service
        .verify(&VerifyRequest::new(voter.clone(), checkerboard_png()))
        .unwrap();
    assert!(!rejected.verified);
    assert!(rejected.token.is_none());

    assert!(service.revoke_enrollment(&voter).unwrap());
    assert!(!service.status(&voter).unwrap().enrolled);
    let err = service
        .verify(&VerifyRequest::new(voter.clone(), checkerboard_png()))
        .unwrap_err();
    assert!(matches!(err, AppError::NotEnrolled { .. }));

    let entries = read_entries(&config.audit_log_path, Some(&voter), None).unwrap();
    let outcomes: Vec<_> = entries.iter().map(|entry| entry.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Accepted,
            AttemptOutcome::Rejected,
            AttemptOutcome::Rejected
        ]
    );
    let sequences: Vec<_> = entries.iter().map(|entry| entry.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert_eq!(
        entries[2].failure_reason.as_deref(),
        Some("User not enrolled")
    );
}

#[test]
fn integration_audit_sequence_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    let env = StaticEnv::new();
    let voter = Identity::parse(VOTER).unwrap();

    {
        let oracle = Arc::new(SwitchableOracle::new(vec![1.0, 0.0]));
        let service =
            VerificationService::bootstrap_with(&config, oracle, &env, &NoKeyring).unwrap();
        service.enroll(&voter, checkerboard_png()).unwrap();
        service
            .verify(&VerifyRequest::new(voter.clone(), checkerboard_png()))
            .unwrap();
    }

    let oracle = Arc::new(SwitchableOracle::new(vec![1.0, 0.0]));
    let service = VerificationService::bootstrap_with(&config, oracle, &env, &NoKeyring).unwrap();
    let outcome = service
        .verify(&VerifyRequest::new(voter.clone(), checkerboard_png()))
        .unwrap();
    assert!(outcome.verified);
    assert_eq!(outcome.audit_sequence, 1);
    assert_eq!(read_entries(&config.audit_log_path, None, None).unwrap().len(), 2);
}

#[test]
fn integration_reenrollment_keeps_one_record() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    let oracle = Arc::new(SwitchableOracle::new(vec![1.0, 0.0]));
    let service =
        VerificationService::bootstrap_with(&config, oracle.clone(), &StaticEnv::new(), &NoKeyring)
            .unwrap();
    let voter = Identity::parse(VOTER).unwrap();

    service.enroll(&voter, checkerboard_png()).unwrap();
    oracle.set(vec![0.0, 1.0]);
    let second = service.enroll(&voter, checkerboard_png()).unwrap();
    assert_eq!(second.enrollment_count, 2);
    assert_eq!(
        std::fs::read_dir(&config.embedding_store_dir).unwrap().count(),
        1
    );

    // Only the newest template matches.
    let outcome = service
        .verify(&VerifyRequest::new(voter, checkerboard_png()))
        .unwrap();
    assert!(outcome.verified);
}

fn config_in(dir: &Path) -> ResolvedConfig {
    ResolvedConfig {
        embedding_store_dir: dir.join("enrollments"),
        audit_log_path: dir.join("audit").join("attempts.jsonl"),
        ..ResolvedConfig::default()
    }
}

fn checkerboard_png() -> Vec<u8> {
    let image = RgbImage::from_fn(100, 100, |x, y| {
        if (x + y) % 2 == 0 {
            Rgb([255, 0, 0])
        } else {
            Rgb([0, 0, 255])
        }
    });
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buffer, ImageOutputFormat::Png)
        .unwrap();
    buffer.into_inner()
}

fn centre_box() -> BoundingBox {
    BoundingBox {
        left: 25,
        top: 25,
        right: 75,
        bottom: 75,
    }
}

struct SwitchableOracle {
    embedding: Mutex<Vec<f64>>,
}

impl SwitchableOracle {
    fn new(embedding: Vec<f64>) -> Self {
        Self {
            embedding: Mutex::new(embedding),
        }
    }

    fn set(&self, embedding: Vec<f64>) {
        *self.embedding.lock().unwrap() = embedding;
    }
}

impl FaceEmbeddingBackend for SwitchableOracle {
    fn detect(&self, _image: &RgbImage) -> AppResult<Vec<FaceDetection>> {
        Ok(vec![FaceDetection {
            bounding_box: centre_box(),
            landmarks: true,
            detection_score: Some(0.95),
        }])
    }

    fn extract(&self, _image: &RgbImage) -> AppResult<OracleOutcome> {
        Ok(OracleOutcome::from_faces(vec![FaceEmbeddingRecord {
            bounding_box: centre_box(),
            embedding: self.embedding.lock().unwrap().clone(),
        }]))
    }
}

struct StaticEnv(HashMap<&'static str, String>);

impl StaticEnv {
    fn new() -> Self {
        let mut vars = HashMap::new();
        vars.insert(EMBEDDING_KEY_ENV, EmbeddingKey::generate().to_base64());
        vars.insert(TOKEN_SECRET_ENV, "integration-token-secret-0123456789abcdef".into());
        Self(vars)
    }
}

impl SecretSource for StaticEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

struct NoKeyring;

impl EmbeddingKeyStore for NoKeyring {
    fn fetch(&self) -> Result<EmbeddingKeyStatus, EmbeddingKeyLookupError> {
        Ok(EmbeddingKeyStatus::Missing)
    }

    fn store(&self, _key: &EmbeddingKey) -> Result<(), SecretServiceError> {
        Ok(())
    }
}

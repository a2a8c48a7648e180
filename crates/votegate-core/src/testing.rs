use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use image::RgbImage;
use uuid::Uuid;

use crate::audit::{AttemptRecord, AuditLog, NewAttempt};
use crate::credentials::{CredentialIssuer, PermitSigner, TokenIssuer};
use crate::errors::{AppError, AppResult};
use crate::faces::extractor::{
    BoundingBox, FaceDetection, FaceEmbeddingBackend, FaceEmbeddingRecord, OracleOutcome,
};
use crate::faces::store::{EnrollmentRecord, EnrollmentStore};
use crate::identity::Identity;

pub(crate) const TEST_TOKEN_SECRET: &[u8] = b"unit-test-token-secret-0123456789abcdef";
pub(crate) const VOTER: &str = "0x52908400098527886e0f7030069857d2e4169ee7";

pub(crate) fn voter() -> Identity {
    Identity::parse(VOTER).unwrap()
}

pub(crate) fn centre_box() -> BoundingBox {
    BoundingBox {
        left: 25,
        top: 25,
        right: 75,
        bottom: 75,
    }
}

pub(crate) struct StubOracle {
    pub detections: Vec<FaceDetection>,
    pub faces: Result<Vec<FaceEmbeddingRecord>, String>,
    pub detect_calls: AtomicUsize,
    pub extract_calls: AtomicUsize,
}

impl StubOracle {
    pub fn with_faces(faces: Vec<FaceEmbeddingRecord>) -> Self {
        Self {
            detections: vec![FaceDetection {
                bounding_box: centre_box(),
                landmarks: true,
                detection_score: Some(0.95),
            }],
            faces: Ok(faces),
            detect_calls: AtomicUsize::new(0),
            extract_calls: AtomicUsize::new(0),
        }
    }

    pub fn single(embedding: Vec<f64>) -> Self {
        Self::with_faces(vec![FaceEmbeddingRecord {
            bounding_box: centre_box(),
            embedding,
        }])
    }

    pub fn failing(message: &str) -> Self {
        let mut oracle = Self::with_faces(Vec::new());
        oracle.faces = Err(message.to_string());
        oracle
    }

    pub fn detects(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }

    pub fn extracts(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

impl FaceEmbeddingBackend for StubOracle {
    fn detect(&self, _image: &RgbImage) -> AppResult<Vec<FaceDetection>> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.detections.clone())
    }

    fn extract(&self, _image: &RgbImage) -> AppResult<OracleOutcome> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        match &self.faces {
            Ok(faces) => Ok(OracleOutcome::from_faces(faces.clone())),
            Err(message) => Err(AppError::Oracle(message.clone())),
        }
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub records: Mutex<HashMap<Identity, EnrollmentRecord>>,
}

impl MemoryStore {
    pub fn with_record(identity: &Identity, embedding: Vec<f64>) -> Self {
        let store = Self::default();
        store.put(&EnrollmentRecord::new(identity.clone(), embedding, Utc::now()))
            .unwrap();
        store
    }
}

impl EnrollmentStore for MemoryStore {
    fn get(&self, identity: &Identity) -> AppResult<Option<EnrollmentRecord>> {
        Ok(self.records.lock().unwrap().get(identity).cloned())
    }

    fn put(&self, record: &EnrollmentRecord) -> AppResult<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.identity.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, identity: &Identity) -> AppResult<bool> {
        Ok(self.records.lock().unwrap().remove(identity).is_some())
    }
}

/// Every call fails as if the store directory were unreadable.
pub(crate) struct UnavailableStore;

impl UnavailableStore {
    fn outage() -> AppError {
        AppError::StoreRead {
            path: "/unavailable".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "store offline"),
        }
    }
}

impl EnrollmentStore for UnavailableStore {
    fn get(&self, _identity: &Identity) -> AppResult<Option<EnrollmentRecord>> {
        Err(Self::outage())
    }

    fn put(&self, _record: &EnrollmentRecord) -> AppResult<()> {
        Err(Self::outage())
    }

    fn delete(&self, _identity: &Identity) -> AppResult<bool> {
        Err(Self::outage())
    }
}

#[derive(Default)]
pub(crate) struct MemoryAudit {
    pub entries: Mutex<Vec<AttemptRecord>>,
    pub fail: bool,
}

impl MemoryAudit {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> Vec<AttemptRecord> {
        self.entries.lock().unwrap().clone()
    }
}

impl AuditLog for MemoryAudit {
    fn append(&self, attempt: NewAttempt) -> AppResult<AttemptRecord> {
        if self.fail {
            return Err(AppError::AuditWrite {
                path: "memory".into(),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            });
        }
        let mut entries = self.entries.lock().unwrap();
        let record = AttemptRecord {
            sequence: entries.len() as u64,
            attempt_id: Uuid::new_v4(),
            identity: attempt.identity,
            timestamp: Utc::now(),
            outcome: attempt.outcome,
            similarity_score: attempt.similarity_score,
            liveness_passed: attempt.liveness_passed,
            client_ip: attempt.client.ip,
            client_agent: attempt.client.agent,
            failure_reason: attempt.failure_reason,
        };
        entries.push(record.clone());
        Ok(record)
    }
}

pub(crate) fn credentials(signer: Option<PermitSigner>) -> CredentialIssuer {
    let tokens = TokenIssuer::new(TEST_TOKEN_SECRET, "HS256", Duration::from_secs(600)).unwrap();
    CredentialIssuer::new(tokens, signer)
}

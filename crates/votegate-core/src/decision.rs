//! The verification decision pipeline.
//!
//! Every attempt that gets past rate limiting leaves exactly one audit entry,
//! and that entry is written before any credential exists.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use votegate_config::ResolvedConfig;

use crate::audit::{AttemptOutcome, AuditLog, ClientInfo, NewAttempt};
use crate::credentials::CredentialIssuer;
use crate::errors::{AppError, AppResult};
use crate::faces::comparer::similarity_score;
use crate::faces::decode::decode_image;
use crate::faces::extractor::{FaceEmbeddingBackend, OracleOutcome};
use crate::faces::liveness::{evaluate_liveness, LivenessPolicy};
use crate::faces::store::EnrollmentStore;
use crate::identity::Identity;

pub const TIMEOUT_REASON: &str = "processing timeout";

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationPolicy {
    pub similarity_threshold: f64,
    pub liveness_enabled: bool,
    pub liveness: LivenessPolicy,
    pub token_expiry_minutes: u64,
}

impl VerificationPolicy {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            liveness_enabled: config.enable_liveness,
            liveness: config.liveness.clone(),
            token_expiry_minutes: config.token_expiry_minutes(),
        }
    }
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self::from_config(&ResolvedConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub identity: Identity,
    pub image: Vec<u8>,
    pub skip_liveness: bool,
    pub client: ClientInfo,
    pub deadline: Option<Instant>,
}

impl VerifyRequest {
    pub fn new(identity: Identity, image: Vec<u8>) -> Self {
        Self {
            identity,
            image,
            skip_liveness: false,
            client: ClientInfo::default(),
            deadline: None,
        }
    }

    fn expired(&self) -> bool {
        self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub verified: bool,
    /// Percent, two decimals.
    pub similarity_score: f64,
    pub liveness_passed: bool,
    pub token: Option<String>,
    pub signature: Option<String>,
    pub expires_in_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub message: String,
    pub failure_reason: Option<String>,
    pub audit_sequence: u64,
    #[serde(skip)]
    pub logs: Vec<String>,
}

/// Pipeline state carried between steps so a late rejection can still
/// record what was measured.
struct Attempt<'a, A: ?Sized> {
    request: &'a VerifyRequest,
    audit: &'a A,
    liveness_passed: Option<bool>,
    logs: Vec<String>,
}

impl<'a, A: AuditLog + ?Sized> Attempt<'a, A> {
    fn reject(
        mut self,
        reason: String,
        message: String,
        similarity: Option<f64>,
    ) -> AppResult<VerifyOutcome> {
        let mut entry = NewAttempt::rejected(&self.request.identity, &self.request.client, &reason)
            .with_liveness(self.liveness_passed);
        if let Some(score) = similarity {
            entry = entry.with_similarity(score);
        }
        let record = self.audit.append(entry)?;
        info!(
            identity = %self.request.identity.redacted(),
            sequence = record.sequence,
            reason = %reason,
            "verification rejected"
        );
        self.logs.push(format!("Rejected: {reason}"));

        Ok(VerifyOutcome {
            verified: false,
            similarity_score: similarity.map(percent).unwrap_or(0.0),
            liveness_passed: self.liveness_passed.unwrap_or(true),
            token: None,
            signature: None,
            expires_in_seconds: None,
            expires_at: None,
            message,
            failure_reason: Some(reason),
            audit_sequence: record.sequence,
            logs: self.logs,
        })
    }

    fn reject_timeout(self) -> AppResult<VerifyOutcome> {
        warn!(identity = %self.request.identity.redacted(), "verification deadline exceeded");
        self.reject(TIMEOUT_REASON.into(), TIMEOUT_REASON.into(), None)
    }

    fn record_failure(&self, reason: String) -> AppResult<u64> {
        let entry = NewAttempt::rejected(&self.request.identity, &self.request.client, reason)
            .with_liveness(self.liveness_passed);
        self.audit.append(entry).map(|record| record.sequence)
    }
}

pub fn run_verification_with<O, S, A>(
    request: &VerifyRequest,
    policy: &VerificationPolicy,
    oracle: &O,
    store: &S,
    audit: &A,
    credentials: &CredentialIssuer,
) -> AppResult<VerifyOutcome>
where
    O: FaceEmbeddingBackend + ?Sized,
    S: EnrollmentStore + ?Sized,
    A: AuditLog + ?Sized,
{
    let identity = &request.identity;
    let mut attempt = Attempt {
        request,
        audit,
        liveness_passed: None,
        logs: Vec::new(),
    };
    info!(identity = %identity.redacted(), "verification requested");

    if request.expired() {
        return attempt.reject_timeout();
    }

    let enrolled = match store.get(identity) {
        Ok(record) => record.filter(|record| record.is_usable()),
        Err(err) => {
            if let Err(audit_err) =
                attempt.record_failure(format!("Enrollment lookup failed: {err}"))
            {
                warn!(error = %audit_err, "could not audit enrollment lookup failure");
            }
            return Err(err);
        }
    };
    let Some(enrolled) = enrolled else {
        attempt.record_failure("User not enrolled".into())?;
        return Err(AppError::NotEnrolled {
            identity: identity.to_string(),
        });
    };
    attempt.logs.push(format!(
        "Loaded enrollment #{} for {}",
        enrolled.enrollment_count,
        identity.redacted()
    ));

    if request.expired() {
        return attempt.reject_timeout();
    }

    let rgb = match decode_image(&request.image) {
        Ok(rgb) => rgb,
        Err(err) => {
            attempt.record_failure(err.to_string())?;
            return Err(err);
        }
    };
    attempt
        .logs
        .push(format!("Decoded image ({}x{})", rgb.width(), rgb.height()));

    if policy.liveness_enabled && !request.skip_liveness {
        if request.expired() {
            return attempt.reject_timeout();
        }
        let report = evaluate_liveness(&rgb, oracle, &policy.liveness);
        attempt.liveness_passed = Some(report.is_live);
        attempt.logs.push(format!(
            "Liveness confidence {:.2} ({})",
            report.confidence,
            if report.is_live { "live" } else { "not live" }
        ));
        if !report.is_live {
            let cause = report.reason_or_default();
            return attempt.reject(
                format!("Liveness failed: {cause}"),
                format!("Liveness check failed: {cause}"),
                None,
            );
        }
    } else {
        attempt.logs.push("Liveness check skipped".into());
    }

    if request.expired() {
        return attempt.reject_timeout();
    }

    let extracted = match oracle.extract(&rgb) {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Err(audit_err) = attempt.record_failure(format!("Face extraction failed: {err}"))
            {
                warn!(error = %audit_err, "could not audit oracle failure");
            }
            return Err(err);
        }
    };
    if let OracleOutcome::Multiple(faces) = &extracted {
        warn!(
            identity = %identity.redacted(),
            faces = faces.len(),
            "multiple faces detected; using the largest"
        );
    }
    let Some(face) = extracted.into_primary() else {
        return attempt.reject(
            "Face extraction failed: no_face".into(),
            "Face detection failed: no_face".into(),
            None,
        );
    };

    if request.expired() {
        return attempt.reject_timeout();
    }

    let similarity = similarity_score(&face.embedding, &enrolled.embedding);
    let verified = similarity >= policy.similarity_threshold;
    attempt.logs.push(format!(
        "Similarity {:.2}% (threshold {:.0}%)",
        similarity * 100.0,
        policy.similarity_threshold * 100.0
    ));

    if !verified {
        return attempt.reject(
            format!("Similarity {:.2}% below threshold", similarity * 100.0),
            format!(
                "Face match failed ({:.1}% < {:.0}% required)",
                similarity * 100.0,
                policy.similarity_threshold * 100.0
            ),
            Some(similarity),
        );
    }

    let entry = NewAttempt {
        identity: identity.clone(),
        outcome: AttemptOutcome::Accepted,
        similarity_score: Some(similarity),
        liveness_passed: attempt.liveness_passed,
        client: request.client.clone(),
        failure_reason: None,
    };
    let record = audit.append(entry)?;

    let credential = credentials.issue(identity, similarity)?;
    info!(
        identity = %identity.redacted(),
        sequence = record.sequence,
        similarity = %format!("{:.2}%", similarity * 100.0),
        signed = credential.signature.is_some(),
        "verification accepted"
    );
    attempt.logs.push("Issued verification token".into());
    if credential.signature.is_some() {
        attempt.logs.push("Signed voting permit".into());
    }

    Ok(VerifyOutcome {
        verified: true,
        similarity_score: percent(similarity),
        liveness_passed: attempt.liveness_passed.unwrap_or(true),
        token: Some(credential.token),
        signature: credential.signature,
        expires_in_seconds: Some(policy.token_expiry_minutes * 60),
        expires_at: Some(credential.expires_at),
        message: "Verification successful".into(),
        failure_reason: None,
        audit_sequence: record.sequence,
        logs: attempt.logs,
    })
}

fn percent(similarity: f64) -> f64 {
    (similarity * 10_000.0).round() / 100.0
}

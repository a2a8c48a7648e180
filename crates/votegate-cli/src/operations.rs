use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::info;
use votegate_config::ResolvedConfig;
use votegate_core::audit::{read_entries, AttemptRecord, ClientInfo};
use votegate_core::credentials::{peek_expiry, TokenIssuer, VerificationClaims};
use votegate_core::decision::{VerifyOutcome, VerifyRequest};
use votegate_core::faces::{EnrollmentOutcome, EnrollmentStore, FilesystemEnrollmentStore};
use votegate_core::secret_service::{
    resolve_embedding_key, resolve_token_secret, KeyringEmbeddingKeyStore, ProcessEnv,
};
use votegate_core::{enrollment_status, Identity, StatusReport, VerificationService};

use crate::cli::{AuditArgs, EnrollArgs, IdentityArgs, TokenArgs, VerifyArgs};
use crate::config;
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub identity: Identity,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl From<Option<VerificationClaims>> for TokenReport {
    fn from(claims: Option<VerificationClaims>) -> Self {
        match claims {
            Some(claims) => Self {
                valid: true,
                expires: Utc.timestamp_opt(claims.exp, 0).single(),
                user_id: Some(claims.sub),
                verified: Some(claims.verified),
                score: Some(claims.score),
            },
            None => Self {
                valid: false,
                user_id: None,
                verified: None,
                score: None,
                expires: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpiryReport {
    pub expires: Option<DateTime<Utc>>,
    pub expired: Option<bool>,
    pub remaining_seconds: Option<i64>,
}

impl ExpiryReport {
    pub fn at(expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let remaining = expires.map(|exp| (exp - now).num_seconds().max(0));
        Self {
            expires,
            expired: expires.map(|exp| exp <= now),
            remaining_seconds: remaining,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub path: PathBuf,
    pub entries: Vec<AttemptRecord>,
}

pub fn run_enroll(args: &EnrollArgs, location: Option<&Path>) -> AppResult<EnrollmentOutcome> {
    let identity = Identity::parse(&args.identity)?;
    let image = read_image(&args.image)?;
    let config = config::load_with_models(location, &args.models)?;
    let service = VerificationService::bootstrap(&config)?;
    service.enroll(&identity, image)
}

pub fn run_verify(args: &VerifyArgs, location: Option<&Path>) -> AppResult<VerifyOutcome> {
    let identity = Identity::parse(&args.identity)?;
    let image = read_image(&args.image)?;
    let config = config::load_with_models(location, &args.models)?;
    let service = VerificationService::bootstrap(&config)?;

    let request = VerifyRequest {
        identity,
        image,
        skip_liveness: args.skip_liveness,
        client: ClientInfo::new(None, Some(client_agent())),
        deadline: Some(Instant::now() + service.request_timeout()),
    };
    service.verify(&request)
}

pub fn run_status(args: &IdentityArgs, location: Option<&Path>) -> AppResult<StatusReport> {
    let identity = Identity::parse(&args.identity)?;
    let config = config::load(location)?;
    let store = open_store(&config)?;
    enrollment_status(&store, &identity)
}

pub fn run_revoke(args: &IdentityArgs, location: Option<&Path>) -> AppResult<RevokeOutcome> {
    let identity = Identity::parse(&args.identity)?;
    let config = config::load(location)?;
    let store = open_store(&config)?;
    revoke_with(&store, identity)
}

pub fn revoke_with<S>(store: &S, identity: Identity) -> AppResult<RevokeOutcome>
where
    S: EnrollmentStore + ?Sized,
{
    if !store.delete(&identity)? {
        return Err(AppError::NotEnrolled {
            identity: identity.to_string(),
        });
    }
    info!(identity = %identity.redacted(), "enrollment revoked");
    Ok(RevokeOutcome {
        identity,
        removed: true,
    })
}

pub fn run_token_validate(args: &TokenArgs, location: Option<&Path>) -> AppResult<TokenReport> {
    let config = config::load(location)?;
    let secret = resolve_token_secret(&ProcessEnv)?;
    let issuer = TokenIssuer::new(&secret, &config.token_algorithm, config.token_expiry)?;
    Ok(TokenReport::from(issuer.validate(args.token.trim())))
}

pub fn run_token_expiry(args: &TokenArgs) -> AppResult<ExpiryReport> {
    Ok(ExpiryReport::at(peek_expiry(args.token.trim()), Utc::now()))
}

pub fn run_audit(args: &AuditArgs, location: Option<&Path>) -> AppResult<AuditReport> {
    let config = config::load(location)?;
    audit_from(&config.audit_log_path, args)
}

pub fn audit_from(path: &Path, args: &AuditArgs) -> AppResult<AuditReport> {
    let identity = args
        .identity
        .as_deref()
        .map(Identity::parse)
        .transpose()?;
    let entries = read_entries(path, identity.as_ref(), Some(args.limit))?;
    Ok(AuditReport {
        path: path.to_path_buf(),
        entries,
    })
}

fn open_store(config: &ResolvedConfig) -> AppResult<FilesystemEnrollmentStore> {
    let key = resolve_embedding_key(&ProcessEnv, &KeyringEmbeddingKeyStore)?;
    Ok(FilesystemEnrollmentStore::new(
        &config.embedding_store_dir,
        key,
    ))
}

fn read_image(path: &Path) -> AppResult<Vec<u8>> {
    fs::read(path)
        .map_err(|err| AppError::InvalidImage(format!("cannot read {}: {err}", path.display())))
}

fn client_agent() -> String {
    format!("votegate-cli/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;
    use tempfile::tempdir;
    use votegate_core::audit::{AuditLog, JsonlAuditLog, NewAttempt};

    #[test]
    fn missing_image_is_input_error() {
        let dir = tempdir().unwrap();
        let err = read_image(&dir.path().join("absent.png")).unwrap_err();
        assert!(matches!(err, AppError::InvalidImage(_)));
    }

    #[test]
    fn invalid_claims_report_only_validity() {
        let report = TokenReport::from(None);
        assert!(!report.valid);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, serde_json::json!({ "valid": false }));
    }

    #[test]
    fn expiry_report_counts_down() {
        let now = Utc::now();
        let report = ExpiryReport::at(Some(now + Duration::seconds(90)), now);
        assert_eq!(report.expired, Some(false));
        assert_eq!(report.remaining_seconds, Some(90));

        let stale = ExpiryReport::at(Some(now - Duration::seconds(5)), now);
        assert_eq!(stale.expired, Some(true));
        assert_eq!(stale.remaining_seconds, Some(0));

        let unknown = ExpiryReport::at(None, now);
        assert!(unknown.expired.is_none());
    }

    #[test]
    fn undecodable_token_has_no_expiry() {
        let report = run_token_expiry(&TokenArgs {
            token: "not.a.jwt".into(),
        })
        .unwrap();
        assert!(report.expires.is_none());
    }

    #[test]
    fn audit_filters_by_identity_and_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = JsonlAuditLog::open(&path).unwrap();
        let alice = Identity::parse("alice").unwrap();
        let bob = Identity::parse("bob").unwrap();
        for identity in [&alice, &bob, &alice, &alice] {
            log.append(NewAttempt::rejected(identity, &ClientInfo::default(), "test"))
                .unwrap();
        }

        let report = audit_from(
            &path,
            &AuditArgs {
                identity: Some("ALICE".into()),
                limit: 2,
            },
        )
        .unwrap();
        let sequences: Vec<_> = report.entries.iter().map(|entry| entry.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[test]
    fn audit_of_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let report = audit_from(
            &dir.path().join("absent.jsonl"),
            &AuditArgs {
                identity: None,
                limit: 10,
            },
        )
        .unwrap();
        assert!(report.entries.is_empty());
    }

    #[test]
    fn audit_rejects_torn_middle_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        let result = audit_from(
            &path,
            &AuditArgs {
                identity: None,
                limit: 10,
            },
        );
        assert!(result.is_err());
    }
}

use std::error::Error;
use std::io::{self, Write};

use serde::Serialize;
use serde_json::json;
use votegate_core::audit::{AttemptOutcome, AttemptRecord};
use votegate_core::decision::VerifyOutcome;
use votegate_core::faces::EnrollmentOutcome;
use votegate_core::StatusReport;

use crate::cli::OutputMode;
use crate::doctor::{CheckStatus, DoctorOutcome};
use crate::errors::{AppError, AppResult};
use crate::keyring::KeyringInitOutcome;
use crate::operations::{AuditReport, ExpiryReport, RevokeOutcome, TokenReport};

fn write_json<T: Serialize + ?Sized>(payload: &T) -> AppResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let payload = serde_json::to_string(payload)?;
    handle.write_all(payload.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

pub fn render_enroll(
    outcome: &EnrollmentOutcome,
    mode: OutputMode,
    verbose: bool,
) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if verbose {
                for line in &outcome.logs {
                    println!("{line}");
                }
            }
            println!(
                "Enrollment successful: {} (enrollment #{}, quality {:.2})",
                outcome.identity, outcome.enrollment_count, outcome.quality_score
            );
            if let Some(warning) = &outcome.warning {
                println!("warning: {warning}");
            }
        }
        OutputMode::Json => write_json(outcome)?,
    }
    Ok(())
}

pub fn render_verify(outcome: &VerifyOutcome, mode: OutputMode, verbose: bool) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if verbose {
                for line in &outcome.logs {
                    println!("{line}");
                }
            }
            println!("{}", outcome.message);
            println!(
                "Similarity: {:.2}% (liveness {})",
                outcome.similarity_score,
                if outcome.liveness_passed {
                    "passed"
                } else {
                    "failed"
                }
            );
            if let Some(token) = &outcome.token {
                println!("Token: {token}");
            }
            if let Some(signature) = &outcome.signature {
                println!("Signature: {signature}");
            }
            if let Some(expires_at) = outcome.expires_at {
                println!("Expires: {}", expires_at.to_rfc3339());
            }
        }
        OutputMode::Json => write_json(outcome)?,
    }
    Ok(())
}

pub fn render_status(report: &StatusReport, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => match report.enrollment_date {
            Some(date) if report.enrolled => println!(
                "{} is enrolled (since {})",
                report.identity,
                date.to_rfc3339()
            ),
            _ => println!("{} is not enrolled", report.identity),
        },
        OutputMode::Json => write_json(report)?,
    }
    Ok(())
}

pub fn render_revoke(outcome: &RevokeOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => println!("Enrollment for {} deleted", outcome.identity),
        OutputMode::Json => write_json(outcome)?,
    }
    Ok(())
}

pub fn render_token(report: &TokenReport, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if !report.valid {
                println!("Token invalid or expired");
                return Ok(());
            }
            println!("Token valid");
            if let Some(user_id) = &report.user_id {
                println!("User: {user_id}");
            }
            if let Some(score) = report.score {
                println!("Score: {score:.2}%");
            }
            if let Some(expires) = report.expires {
                println!("Expires: {}", expires.to_rfc3339());
            }
        }
        OutputMode::Json => write_json(report)?,
    }
    Ok(())
}

pub fn render_expiry(report: &ExpiryReport, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => match (report.expires, report.remaining_seconds) {
            (Some(expires), Some(0)) => println!("Expired at {}", expires.to_rfc3339()),
            (Some(expires), Some(remaining)) => println!(
                "Expires at {} ({remaining}s remaining)",
                expires.to_rfc3339()
            ),
            _ => println!("Token carries no readable expiry"),
        },
        OutputMode::Json => write_json(report)?,
    }
    Ok(())
}

pub fn render_audit(report: &AuditReport, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if report.entries.is_empty() {
                println!("No attempts recorded in {}", report.path.display());
            }
            for entry in &report.entries {
                println!("{}", audit_line(entry));
            }
        }
        OutputMode::Json => write_json(&report.entries)?,
    }
    Ok(())
}

fn audit_line(entry: &AttemptRecord) -> String {
    let outcome = match entry.outcome {
        AttemptOutcome::Accepted => "accepted",
        AttemptOutcome::Rejected => "rejected",
    };
    let mut line = format!(
        "#{} {} {} {}",
        entry.sequence,
        entry.timestamp.to_rfc3339(),
        entry.identity,
        outcome
    );
    if let Some(score) = entry.similarity_score {
        line.push_str(&format!(" score={score:.2}"));
    }
    if let Some(reason) = &entry.failure_reason {
        line.push_str(&format!(" reason=\"{reason}\""));
    }
    line
}

pub fn render_keyring_init(outcome: &KeyringInitOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            let verb = if outcome.replaced {
                "replaced"
            } else {
                "stored"
            };
            println!(
                "Embedding key {verb} in Secret Service (service '{}', entry '{}')",
                outcome.service, outcome.entry
            );
        }
        OutputMode::Json => write_json(&json!({
            "status": "ok",
            "service": outcome.service,
            "entry": outcome.entry,
            "replaced": outcome.replaced,
        }))?,
    }
    Ok(())
}

pub fn render_doctor(outcome: &DoctorOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for check in &outcome.checks {
                let tag = match check.status {
                    CheckStatus::Pass => "PASS",
                    CheckStatus::Warn => "WARN",
                    CheckStatus::Fail => "FAIL",
                };
                println!("[{tag}] {}: {}", check.name, check.message);
            }
            if outcome.ok {
                println!("All required checks passed");
            } else {
                println!("One or more checks failed");
            }
        }
        OutputMode::Json => write_json(outcome)?,
    }
    Ok(())
}

pub fn render_error(err: &AppError, mode: OutputMode) {
    if let AppError::SecretServiceUnavailable {
        entry,
        service,
        message,
    } = err
    {
        match mode {
            OutputMode::Human => {
                eprintln!(
                    "Secret Service unavailable for entry '{entry}' (service '{service}'): {message}"
                );
            }
            OutputMode::Json => {
                let payload = json!({
                    "success": false,
                    "entry": entry,
                    "service": service,
                    "error": message,
                });
                println!("{payload}");
            }
        }
        return;
    }

    match mode {
        OutputMode::Human => {
            eprintln!("error: {}", err.human_message());
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "success": false,
                "error": err.human_message(),
            });
            if let Ok(json) = serde_json::to_string(&payload) {
                println!("{json}");
            }
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
        }
    }
}

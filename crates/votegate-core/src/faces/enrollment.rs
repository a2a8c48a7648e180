use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::faces::decode::decode_image;
use crate::faces::extractor::{
    ensure_valid_embedding, largest_by_area, FaceDetection, FaceEmbeddingBackend, OracleOutcome,
};
use crate::faces::store::EnrollmentStore;
use crate::identity::Identity;

const CENTER_OFFSET_WARN: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub identity: Identity,
    pub image: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnrollmentPolicy {
    pub min_face_ratio: f64,
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        Self {
            min_face_ratio: votegate_config::DEFAULT_MIN_FACE_RATIO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceQuality {
    pub face_count: usize,
    pub face_size_ratio: f64,
    pub center_offset_x: f64,
    pub center_offset_y: f64,
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnrollmentOutcome {
    pub identity: Identity,
    pub enrollment_count: u32,
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub warning: Option<String>,
    #[serde(skip)]
    pub logs: Vec<String>,
}

/// Face size and centering of the largest detection. `Err` carries the
/// rejection reason shown to the user.
pub fn assess_quality(
    image: &RgbImage,
    faces: &[FaceDetection],
    policy: &EnrollmentPolicy,
) -> Result<FaceQuality, String> {
    let Some(face) = largest_by_area(faces, |face| &face.bounding_box) else {
        return Err("No face detected".into());
    };

    let (width, height) = image.dimensions();
    let (img_w, img_h) = (f64::from(width), f64::from(height));
    let bbox = &face.bounding_box;
    let ratio = bbox.area() as f64 / (img_w * img_h);
    if ratio < policy.min_face_ratio {
        return Err("Face too small - move closer to camera".into());
    }

    let center_x = (bbox.left + bbox.right) as f64 / 2.0;
    let center_y = (bbox.top + bbox.bottom) as f64 / 2.0;
    let offset_x = (center_x - img_w / 2.0).abs() / img_w;
    let offset_y = (center_y - img_h / 2.0).abs() / img_h;
    let warning = (offset_x > CENTER_OFFSET_WARN || offset_y > CENTER_OFFSET_WARN)
        .then(|| "Face not centered - please look at camera".to_string());

    Ok(FaceQuality {
        face_count: faces.len(),
        face_size_ratio: round_to(ratio, 3),
        center_offset_x: round_to(offset_x, 3),
        center_offset_y: round_to(offset_y, 3),
        warning,
    })
}

pub fn run_enrollment_with<O, S>(
    request: &EnrollmentRequest,
    policy: &EnrollmentPolicy,
    oracle: &O,
    store: &S,
) -> AppResult<EnrollmentOutcome>
where
    O: FaceEmbeddingBackend + ?Sized,
    S: EnrollmentStore + ?Sized,
{
    let mut logs = Vec::new();
    let identity = &request.identity;

    let rgb = decode_image(&request.image)?;
    logs.push(format!("Decoded image ({}x{})", rgb.width(), rgb.height()));

    let faces = oracle.detect(&rgb)?;
    let quality = assess_quality(&rgb, &faces, policy).map_err(|reason| {
        AppError::EnrollmentRejected {
            reason: format!("Image quality check failed: {reason}"),
        }
    })?;
    logs.push(format!(
        "Detected {} face(s); face covers {:.1}% of the frame",
        quality.face_count,
        quality.face_size_ratio * 100.0
    ));
    if let Some(warning) = &quality.warning {
        warn!(identity = %identity.redacted(), "{warning}");
        logs.push(format!("Warning: {warning}"));
    }

    let face = match oracle.extract(&rgb)? {
        OracleOutcome::NoFace => {
            return Err(AppError::EnrollmentRejected {
                reason: "Face extraction failed: no_face".into(),
            })
        }
        outcome => {
            if outcome.face_count() > 1 {
                warn!(
                    faces = outcome.face_count(),
                    "multiple faces in enrollment image; using the largest"
                );
            }
            outcome.into_primary().ok_or_else(|| AppError::EnrollmentRejected {
                reason: "Face extraction failed: no_face".into(),
            })?
        }
    };
    let dimension = ensure_valid_embedding(&face.embedding)?;
    logs.push(format!("Embedding vector length: {dimension}"));

    let record = store.upsert(identity, face.embedding)?;
    if record.enrollment_count > 1 {
        info!(
            identity = %identity.redacted(),
            count = record.enrollment_count,
            "updated enrollment"
        );
        logs.push(format!(
            "Replaced enrollment for {} (enrollment #{})",
            identity.redacted(),
            record.enrollment_count
        ));
    } else {
        info!(identity = %identity.redacted(), "new enrollment");
        logs.push(format!("Enrolled {}", identity.redacted()));
    }

    Ok(EnrollmentOutcome {
        identity: identity.clone(),
        enrollment_count: record.enrollment_count,
        quality_score: round_to(quality.face_size_ratio * 100.0, 2),
        created_at: record.created_at,
        updated_at: record.updated_at,
        warning: quality.warning,
        logs,
    })
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

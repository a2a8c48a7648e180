use image::RgbImage;
use serde::Serialize;
use tracing::{debug, warn};
use votegate_config::LivenessThresholds;

use crate::faces::extractor::{largest_by_area, FaceDetection, FaceEmbeddingBackend};

/// Thresholds for the fixed liveness check set, loaded from `[liveness]`.
pub type LivenessPolicy = LivenessThresholds;

const CHECK_COUNT: f64 = 6.0;
const BRIGHT_PIXEL_LEVEL: u8 = 240;

/// Raw measurements next to the pass/fail result of each check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessChecks {
    pub sharpness: f64,
    pub is_sharp: bool,
    pub color_variance: f64,
    pub natural_colors: bool,
    pub face_size_ratio: f64,
    pub good_face_size: bool,
    pub bright_pixel_ratio: f64,
    pub no_reflection: bool,
    pub has_landmarks: bool,
    pub detection_score: Option<f64>,
    pub high_confidence: bool,
}

impl LivenessChecks {
    fn results(&self) -> [(bool, &'static str); 6] {
        [
            (self.is_sharp, "image_blurry"),
            (self.natural_colors, "unnatural_colors"),
            (self.good_face_size, "face_size"),
            (self.no_reflection, "possible_reflection"),
            (self.has_landmarks, "missing_landmarks"),
            (self.high_confidence, "low_detection_confidence"),
        ]
    }

    pub fn passed_count(&self) -> usize {
        self.results().iter().filter(|(passed, _)| *passed).count()
    }

    pub fn failed_names(&self) -> Vec<&'static str> {
        self.results()
            .iter()
            .filter(|(passed, _)| !passed)
            .map(|(_, name)| *name)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessReport {
    pub is_live: bool,
    pub confidence: f64,
    pub checks: Option<LivenessChecks>,
    pub reason: Option<String>,
}

impl LivenessReport {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_live: false,
            confidence: 0.0,
            checks: None,
            reason: Some(reason.into()),
        }
    }

    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("liveness check failed")
    }
}

/// Runs face detection through the oracle and scores the primary face.
/// Detector failures become a rejected report, never an error.
pub fn evaluate_liveness<O>(image: &RgbImage, oracle: &O, policy: &LivenessPolicy) -> LivenessReport
where
    O: FaceEmbeddingBackend + ?Sized,
{
    match oracle.detect(image) {
        Ok(faces) => assess_faces(image, &faces, policy),
        Err(err) => {
            warn!(error = %err, "liveness detection error");
            LivenessReport::rejected(format!("Detection error: {err}"))
        }
    }
}

pub fn assess_faces(
    image: &RgbImage,
    faces: &[FaceDetection],
    policy: &LivenessPolicy,
) -> LivenessReport {
    let Some(face) = largest_by_area(faces, |face| &face.bounding_box) else {
        return LivenessReport::rejected("No face detected");
    };

    let (width, height) = image.dimensions();
    let Some((x, y, crop_w, crop_h)) = face.bounding_box.clamp_to(width, height) else {
        return LivenessReport::rejected("Invalid face region");
    };

    let gray = grayscale_region(image, x, y, crop_w, crop_h);

    let sharpness = laplacian_variance(&gray, crop_w as usize, crop_h as usize);
    let color_variance = hsv_variance_sum(image, x, y, crop_w, crop_h);
    let face_size_ratio =
        f64::from(crop_w) * f64::from(crop_h) / (f64::from(width) * f64::from(height));
    let bright_pixel_ratio = gray
        .iter()
        .filter(|value| **value > BRIGHT_PIXEL_LEVEL)
        .count() as f64
        / gray.len() as f64;

    let checks = LivenessChecks {
        sharpness: round_to(sharpness, 2),
        is_sharp: sharpness > policy.sharpness_min,
        color_variance: round_to(color_variance, 2),
        natural_colors: color_variance > policy.color_variance_min,
        face_size_ratio: round_to(face_size_ratio, 3),
        good_face_size: face_size_ratio > policy.face_ratio_min
            && face_size_ratio < policy.face_ratio_max,
        bright_pixel_ratio: round_to(bright_pixel_ratio, 4),
        no_reflection: bright_pixel_ratio < policy.bright_pixel_ratio_max,
        has_landmarks: face.landmarks,
        detection_score: face.detection_score.map(|score| round_to(score, 3)),
        high_confidence: face
            .detection_score
            .map(|score| score > policy.detection_score_min)
            .unwrap_or(false),
    };

    let confidence = round_to(checks.passed_count() as f64 / CHECK_COUNT, 2);
    let is_live = confidence >= policy.min_confidence;
    let reason = if is_live {
        None
    } else {
        Some(format!("Failed checks: {}", checks.failed_names().join(", ")))
    };

    debug!(
        confidence,
        is_live,
        passed = checks.passed_count(),
        "liveness evaluated"
    );

    LivenessReport {
        is_live,
        confidence,
        checks: Some(checks),
        reason,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

// 8-bit luma with the usual 14-bit fixed point weights (0.299, 0.587, 0.114).
fn luma(r: u8, g: u8, b: u8) -> u8 {
    let weighted = u32::from(r) * 4899 + u32::from(g) * 9617 + u32::from(b) * 1868;
    ((weighted + (1 << 13)) >> 14).min(255) as u8
}

fn grayscale_region(image: &RgbImage, x: u32, y: u32, width: u32, height: u32) -> Vec<u8> {
    let mut gray = Vec::with_capacity((width * height) as usize);
    for row in y..y + height {
        for col in x..x + width {
            let [r, g, b] = image.get_pixel(col, row).0;
            gray.push(luma(r, g, b));
        }
    }
    gray
}

// Mirror without repeating the edge pixel: -1 -> 1, len -> len - 2.
fn reflect101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mirrored = if index < 0 {
        -index
    } else if index > last {
        2 * last - index
    } else {
        index
    };
    mirrored.clamp(0, last) as usize
}

/// Population variance of the 4-neighbour Laplacian.
fn laplacian_variance(gray: &[u8], width: usize, height: usize) -> f64 {
    if gray.is_empty() {
        return 0.0;
    }

    let at = |col: isize, row: isize| -> f64 {
        let c = reflect101(col, width);
        let r = reflect101(row, height);
        f64::from(gray[r * width + c])
    };

    let mut values = Vec::with_capacity(gray.len());
    for row in 0..height as isize {
        for col in 0..width as isize {
            let response = at(col, row - 1) + at(col - 1, row) + at(col + 1, row)
                + at(col, row + 1)
                - 4.0 * at(col, row);
            values.push(response);
        }
    }
    variance(values.iter().copied())
}

fn variance<I>(values: I) -> f64
where
    I: Iterator<Item = f64> + Clone,
{
    let (count, sum) = values
        .clone()
        .fold((0usize, 0.0), |(n, s), value| (n + 1, s + value));
    if count == 0 {
        return 0.0;
    }
    let mean = sum / count as f64;
    values.map(|value| (value - mean).powi(2)).sum::<f64>() / count as f64
}

/// Hue in [0, 180), saturation and value in [0, 255], rounded like 8-bit
/// image tooling stores them.
fn hsv_u8(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { delta * 255.0 / max } else { 0.0 };
    let mut hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }

    let hue = (hue / 2.0).round();
    (if hue >= 180.0 { 0.0 } else { hue }, saturation.round(), max)
}

fn hsv_variance_sum(image: &RgbImage, x: u32, y: u32, width: u32, height: u32) -> f64 {
    let mut hsv = Vec::with_capacity((width * height) as usize);
    for row in y..y + height {
        for col in x..x + width {
            let [r, g, b] = image.get_pixel(col, row).0;
            hsv.push(hsv_u8(r, g, b));
        }
    }
    variance(hsv.iter().map(|p| p.0))
        + variance(hsv.iter().map(|p| p.1))
        + variance(hsv.iter().map(|p| p.2))
}

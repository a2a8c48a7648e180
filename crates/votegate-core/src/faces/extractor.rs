use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use dlib_face_recognition::{
    FaceDetector, FaceDetectorTrait, FaceEncoderNetwork, FaceEncoderTrait, ImageMatrix,
    LandmarkPredictor, LandmarkPredictorTrait,
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{AppError, AppResult};

pub const LANDMARK_ENV: &str = "DLIB_LANDMARK_MODEL";
pub const ENCODER_ENV: &str = "DLIB_ENCODER_MODEL";

#[derive(Debug, Clone, Default)]
pub struct OracleConfig {
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: u32,
}

#[derive(Debug, Clone)]
pub struct FaceModelPaths {
    pub landmark: PathBuf,
    pub encoder: PathBuf,
}

pub trait ModelPathResolver {
    fn resolve(&self, config: &OracleConfig) -> AppResult<FaceModelPaths>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvModelPathResolver;

impl ModelPathResolver for EnvModelPathResolver {
    fn resolve(&self, config: &OracleConfig) -> AppResult<FaceModelPaths> {
        let landmark = config
            .landmark_model
            .clone()
            .or_else(|| env::var(LANDMARK_ENV).ok().map(PathBuf::from))
            .ok_or(AppError::MissingModel {
                kind: "landmark predictor",
                flag: "landmark_model",
                env: LANDMARK_ENV,
            })?;

        let encoder = config
            .encoder_model
            .clone()
            .or_else(|| env::var(ENCODER_ENV).ok().map(PathBuf::from))
            .ok_or(AppError::MissingModel {
                kind: "face encoding network",
                flag: "encoder_model",
                env: ENCODER_ENV,
            })?;

        Ok(FaceModelPaths { landmark, encoder })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl BoundingBox {
    pub fn width(&self) -> i64 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.bottom - self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    /// Intersects the box with a `width x height` image. `None` when nothing
    /// of the box lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let left = self.left.clamp(0, i64::from(width));
        let top = self.top.clamp(0, i64::from(height));
        let right = self.right.clamp(0, i64::from(width));
        let bottom = self.bottom.clamp(0, i64::from(height));
        if right <= left || bottom <= top {
            return None;
        }
        Some((
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        ))
    }
}

/// Detector output without an embedding; feeds the liveness checks.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
    pub bounding_box: BoundingBox,
    pub landmarks: bool,
    pub detection_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceEmbeddingRecord {
    pub bounding_box: BoundingBox,
    #[serde(rename = "embedding")]
    pub embedding: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OracleOutcome {
    Single(FaceEmbeddingRecord),
    Multiple(Vec<FaceEmbeddingRecord>),
    NoFace,
}

impl OracleOutcome {
    pub fn from_faces(mut faces: Vec<FaceEmbeddingRecord>) -> Self {
        match faces.len() {
            0 => OracleOutcome::NoFace,
            1 => OracleOutcome::Single(faces.remove(0)),
            _ => OracleOutcome::Multiple(faces),
        }
    }

    pub fn face_count(&self) -> usize {
        match self {
            OracleOutcome::Single(_) => 1,
            OracleOutcome::Multiple(faces) => faces.len(),
            OracleOutcome::NoFace => 0,
        }
    }

    /// The face the pipeline acts on: the only one, or the largest of several.
    pub fn into_primary(self) -> Option<FaceEmbeddingRecord> {
        match self {
            OracleOutcome::Single(face) => Some(face),
            OracleOutcome::Multiple(faces) => {
                let index = largest_index(faces.iter().map(|face| &face.bounding_box))?;
                faces.into_iter().nth(index)
            }
            OracleOutcome::NoFace => None,
        }
    }
}

/// Picks the item with the largest bounding-box area; the first one wins ties.
pub fn largest_by_area<T, F>(items: &[T], bbox: F) -> Option<&T>
where
    F: Fn(&T) -> &BoundingBox,
{
    let index = largest_index(items.iter().map(bbox))?;
    items.get(index)
}

fn largest_index<'a, I>(boxes: I) -> Option<usize>
where
    I: Iterator<Item = &'a BoundingBox>,
{
    let mut best: Option<(usize, i64)> = None;
    for (idx, bbox) in boxes.enumerate() {
        let area = bbox.area();
        match best {
            Some((_, best_area)) if area <= best_area => {}
            _ => best = Some((idx, area)),
        }
    }
    best.map(|(idx, _)| idx)
}

pub fn ensure_valid_embedding(embedding: &[f64]) -> AppResult<usize> {
    if embedding.is_empty() {
        return Err(AppError::Oracle("embedding vector is empty".into()));
    }
    if embedding.iter().any(|value| !value.is_finite()) {
        return Err(AppError::Oracle(
            "embedding vector contains non-finite values".into(),
        ));
    }
    let magnitude = embedding
        .iter()
        .map(|value| value * value)
        .sum::<f64>()
        .sqrt();
    if magnitude <= f64::EPSILON {
        return Err(AppError::Oracle("embedding has zero magnitude".into()));
    }
    Ok(embedding.len())
}

/// Face detection and embedding extraction. Implementations are shared
/// across request workers.
pub trait FaceEmbeddingBackend: Send + Sync {
    fn detect(&self, image: &RgbImage) -> AppResult<Vec<FaceDetection>>;
    fn extract(&self, image: &RgbImage) -> AppResult<OracleOutcome>;
}

struct DlibModels {
    detector: FaceDetector,
    predictor: LandmarkPredictor,
    encoder: FaceEncoderNetwork,
}

pub struct DlibBackend {
    models: Mutex<DlibModels>,
    jitters: u32,
}

impl DlibBackend {
    pub fn new(models: &FaceModelPaths, jitters: u32) -> AppResult<Self> {
        debug!(path = %models.landmark.display(), "loading landmark model");
        let predictor =
            LandmarkPredictor::open(&models.landmark).map_err(|message| AppError::ModelLoad {
                path: models.landmark.clone(),
                message,
            })?;
        debug!(path = %models.encoder.display(), "loading encoder model");
        let encoder =
            FaceEncoderNetwork::open(&models.encoder).map_err(|message| AppError::ModelLoad {
                path: models.encoder.clone(),
                message,
            })?;
        let detector = FaceDetector::new();

        Ok(Self {
            models: Mutex::new(DlibModels {
                detector,
                predictor,
                encoder,
            }),
            jitters,
        })
    }

    pub fn from_config(config: &OracleConfig) -> AppResult<Self> {
        let paths = EnvModelPathResolver.resolve(config)?;
        Self::new(&paths, config.jitters)
    }
}

impl FaceEmbeddingBackend for DlibBackend {
    // The 68-point predictor always fits a full shape to a detected box, and
    // the HOG detector has no calibrated confidence, so `detection_score`
    // stays empty.
    fn detect(&self, image: &RgbImage) -> AppResult<Vec<FaceDetection>> {
        let models = self
            .models
            .lock()
            .map_err(|_| AppError::Oracle("face model lock poisoned".into()))?;
        let matrix = ImageMatrix::from_image(image);
        let locations = models.detector.face_locations(&matrix);

        let mut detections = Vec::with_capacity(locations.len());
        for rect in locations.iter() {
            detections.push(FaceDetection {
                bounding_box: BoundingBox {
                    left: rect.left,
                    top: rect.top,
                    right: rect.right,
                    bottom: rect.bottom,
                },
                landmarks: true,
                detection_score: None,
            });
        }
        debug!(faces = detections.len(), "face detection finished");
        Ok(detections)
    }

    fn extract(&self, image: &RgbImage) -> AppResult<OracleOutcome> {
        let models = self
            .models
            .lock()
            .map_err(|_| AppError::Oracle("face model lock poisoned".into()))?;
        let matrix = ImageMatrix::from_image(image);
        let locations = models.detector.face_locations(&matrix);

        let mut landmarks = Vec::with_capacity(locations.len());
        for rect in locations.iter() {
            landmarks.push(models.predictor.face_landmarks(&matrix, rect));
        }

        let encodings = models
            .encoder
            .get_face_encodings(&matrix, &landmarks, self.jitters);

        let mut records = Vec::with_capacity(locations.len());
        for (rect, encoding) in locations.iter().zip(encodings.iter()) {
            records.push(FaceEmbeddingRecord {
                bounding_box: BoundingBox {
                    left: rect.left,
                    top: rect.top,
                    right: rect.right,
                    bottom: rect.bottom,
                },
                embedding: encoding.as_ref().to_vec(),
            });
        }

        Ok(OracleOutcome::from_faces(records))
    }
}

pub mod comparer;
pub mod decode;
pub mod enrollment;
pub mod extractor;
pub mod liveness;
pub mod store;

pub use comparer::{cosine_similarity, similarity_score};

pub use decode::{
    decode_image, decode_image_payload, validate_image_payload, MIN_IMAGE_PAYLOAD_LEN,
};

pub use enrollment::{
    run_enrollment_with, EnrollmentOutcome, EnrollmentPolicy, EnrollmentRequest,
};

pub use extractor::{
    ensure_valid_embedding, largest_by_area, BoundingBox, DlibBackend, EnvModelPathResolver,
    FaceDetection, FaceEmbeddingBackend, FaceEmbeddingRecord, FaceModelPaths, ModelPathResolver,
    OracleConfig, OracleOutcome,
};

pub use liveness::{evaluate_liveness, LivenessChecks, LivenessPolicy, LivenessReport};

pub use store::{EnrollmentRecord, EnrollmentStore, FilesystemEnrollmentStore};

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/votegate/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/votegate/config.toml";
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.70;
pub const DEFAULT_TOKEN_EXPIRY_MINUTES: u64 = 10;
pub const DEFAULT_TOKEN_ALGORITHM: &str = "HS256";
pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 10;
pub const DEFAULT_RATE_LIMIT_PERIOD_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_STORE_DIR: &str = "/var/lib/votegate/enrollments";
pub const DEFAULT_AUDIT_LOG_PATH: &str = "/var/lib/votegate/audit.jsonl";
pub const DEFAULT_JITTERS: u32 = 1;
pub const DEFAULT_MIN_FACE_RATIO: f64 = 0.05;
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:8080",
    "http://127.0.0.1:8080",
];

pub const DEFAULT_SHARPNESS_MIN: f64 = 50.0;
pub const DEFAULT_COLOR_VARIANCE_MIN: f64 = 500.0;
pub const DEFAULT_FACE_RATIO_MIN: f64 = 0.05;
pub const DEFAULT_FACE_RATIO_MAX: f64 = 0.8;
pub const DEFAULT_BRIGHT_PIXEL_RATIO_MAX: f64 = 0.10;
pub const DEFAULT_DETECTION_SCORE_MIN: f64 = 0.70;
pub const DEFAULT_MIN_LIVENESS_CONFIDENCE: f64 = 0.66;
pub const DEFAULT_BLINK_THRESHOLD: f64 = 0.25;

const SUPPORTED_TOKEN_ALGORITHMS: [&str; 3] = ["HS256", "HS384", "HS512"];

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub similarity_threshold: Option<f64>,
    pub token_expiry_minutes: Option<u64>,
    pub token_algorithm: Option<String>,
    pub enable_liveness: Option<bool>,
    pub rate_limit_requests: Option<u32>,
    pub rate_limit_period_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub embedding_store_dir: Option<PathBuf>,
    pub audit_log_path: Option<PathBuf>,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: Option<u32>,
    pub min_face_ratio: Option<f64>,
    pub listen_addr: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
    pub liveness: Option<LivenessSection>,
}

/// `[liveness]` table. Every threshold of the check set is spelled out here so
/// the policy in force is visible in one place.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LivenessSection {
    pub sharpness_min: Option<f64>,
    pub color_variance_min: Option<f64>,
    pub face_ratio_min: Option<f64>,
    pub face_ratio_max: Option<f64>,
    pub bright_pixel_ratio_max: Option<f64>,
    pub detection_score_min: Option<f64>,
    pub min_confidence: Option<f64>,
    pub blink_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessThresholds {
    pub sharpness_min: f64,
    pub color_variance_min: f64,
    pub face_ratio_min: f64,
    pub face_ratio_max: f64,
    pub bright_pixel_ratio_max: f64,
    pub detection_score_min: f64,
    pub min_confidence: f64,
    pub blink_threshold: f64,
}

impl LivenessThresholds {
    pub fn from_raw(raw: LivenessSection) -> Self {
        Self {
            sharpness_min: raw.sharpness_min.unwrap_or(DEFAULT_SHARPNESS_MIN),
            color_variance_min: raw.color_variance_min.unwrap_or(DEFAULT_COLOR_VARIANCE_MIN),
            face_ratio_min: raw.face_ratio_min.unwrap_or(DEFAULT_FACE_RATIO_MIN),
            face_ratio_max: raw.face_ratio_max.unwrap_or(DEFAULT_FACE_RATIO_MAX),
            bright_pixel_ratio_max: raw
                .bright_pixel_ratio_max
                .unwrap_or(DEFAULT_BRIGHT_PIXEL_RATIO_MAX),
            detection_score_min: raw
                .detection_score_min
                .unwrap_or(DEFAULT_DETECTION_SCORE_MIN),
            min_confidence: raw
                .min_confidence
                .unwrap_or(DEFAULT_MIN_LIVENESS_CONFIDENCE),
            blink_threshold: raw.blink_threshold.unwrap_or(DEFAULT_BLINK_THRESHOLD),
        }
    }
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self::from_raw(LivenessSection::default())
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub similarity_threshold: f64,
    pub token_expiry: Duration,
    pub token_algorithm: String,
    pub enable_liveness: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_period: Duration,
    pub request_timeout: Duration,
    pub embedding_store_dir: PathBuf,
    pub audit_log_path: PathBuf,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: u32,
    pub min_face_ratio: f64,
    pub listen_addr: String,
    pub allowed_origins: Vec<String>,
    pub liveness: LivenessThresholds,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Self {
        Self {
            similarity_threshold: raw
                .similarity_threshold
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            token_expiry: Duration::from_secs(
                raw.token_expiry_minutes
                    .unwrap_or(DEFAULT_TOKEN_EXPIRY_MINUTES)
                    .max(1)
                    * 60,
            ),
            token_algorithm: raw
                .token_algorithm
                .map(|alg| alg.trim().to_ascii_uppercase())
                .unwrap_or_else(|| DEFAULT_TOKEN_ALGORITHM.to_string()),
            enable_liveness: raw.enable_liveness.unwrap_or(true),
            rate_limit_requests: raw
                .rate_limit_requests
                .unwrap_or(DEFAULT_RATE_LIMIT_REQUESTS),
            rate_limit_period: Duration::from_secs(
                raw.rate_limit_period_secs
                    .unwrap_or(DEFAULT_RATE_LIMIT_PERIOD_SECS),
            ),
            request_timeout: Duration::from_secs(
                raw.request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
                    .max(1),
            ),
            embedding_store_dir: raw
                .embedding_store_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR)),
            audit_log_path: raw
                .audit_log_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_LOG_PATH)),
            landmark_model: raw.landmark_model,
            encoder_model: raw.encoder_model,
            jitters: raw.jitters.unwrap_or(DEFAULT_JITTERS),
            min_face_ratio: raw.min_face_ratio.unwrap_or(DEFAULT_MIN_FACE_RATIO),
            listen_addr: raw
                .listen_addr
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            allowed_origins: raw.allowed_origins.unwrap_or_else(|| {
                DEFAULT_ALLOWED_ORIGINS
                    .iter()
                    .map(|origin| origin.to_string())
                    .collect()
            }),
            liveness: LivenessThresholds::from_raw(raw.liveness.unwrap_or_default()),
        }
    }

    /// Token lifetime in whole minutes, as reported to clients.
    pub fn token_expiry_minutes(&self) -> u64 {
        self.token_expiry.as_secs() / 60
    }

    pub fn validate(&self, source: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            path: source.to_path_buf(),
            message,
        };

        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(invalid(format!(
                "similarity_threshold must be in (0, 1], found {}",
                self.similarity_threshold
            )));
        }
        if !SUPPORTED_TOKEN_ALGORITHMS.contains(&self.token_algorithm.as_str()) {
            return Err(invalid(format!(
                "token_algorithm '{}' unsupported; use one of {}",
                self.token_algorithm,
                SUPPORTED_TOKEN_ALGORITHMS.join(", ")
            )));
        }
        if self.rate_limit_requests == 0 {
            return Err(invalid("rate_limit_requests must be at least 1".into()));
        }
        if self.rate_limit_period.is_zero() {
            return Err(invalid("rate_limit_period_secs must be at least 1".into()));
        }
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(invalid(format!(
                "listen_addr '{}' is not a socket address",
                self.listen_addr
            )));
        }

        let liveness = &self.liveness;
        if liveness.face_ratio_min >= liveness.face_ratio_max {
            return Err(invalid(format!(
                "liveness.face_ratio_min ({}) must be below face_ratio_max ({})",
                liveness.face_ratio_min, liveness.face_ratio_max
            )));
        }
        if !(0.0..=1.0).contains(&liveness.min_confidence) {
            return Err(invalid(format!(
                "liveness.min_confidence must be in [0, 1], found {}",
                liveness.min_confidence
            )));
        }

        Ok(())
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_raw(ConfigFile::default())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

pub fn default_config_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

pub fn load_config() -> Result<Option<LoadedConfig>, ConfigError> {
    load_from_paths(&default_config_paths())
}

pub fn load_resolved_config() -> Result<ResolvedConfigWithSource, ConfigError> {
    load_resolved_from_paths(&default_config_paths())
}

/// Resolves configuration from an explicit file when given, otherwise from the
/// default search paths. An explicit file that does not exist is an error.
pub fn load_resolved_config_with(
    explicit: Option<&Path>,
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match explicit {
        Some(path) => {
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let parsed = parse_contents(path, &contents)?;
            resolve_entry(LoadedConfig::new(parsed, path.to_path_buf()))
        }
        None => load_resolved_config(),
    }
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed = parse_contents(path, &contents)?;
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => resolve_entry(entry),
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}

fn parse_contents(path: &Path, contents: &str) -> Result<ConfigFile, ConfigError> {
    toml::from_str::<ConfigFile>(contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn resolve_entry(entry: LoadedConfig) -> Result<ResolvedConfigWithSource, ConfigError> {
    let resolved = ResolvedConfig::from_raw(entry.contents);
    resolved.validate(&entry.source)?;
    Ok(ResolvedConfigWithSource {
        resolved,
        source: Some(entry.source),
    })
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use votegate_core::audit::ClientInfo;
use votegate_core::decision::{VerifyOutcome, VerifyRequest};
use votegate_core::faces::{decode_image_payload, validate_image_payload};
use votegate_core::{HealthReport, Identity, VerificationService};

use crate::error::ApiError;

/// How long past the pipeline deadline the transport waits for the worker.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Clone)]
pub struct AppState {
    service: Arc<VerificationService>,
    grace: Duration,
}

impl AppState {
    pub fn new(service: Arc<VerificationService>) -> Self {
        Self::with_grace(service, TIMEOUT_GRACE)
    }

    pub fn with_grace(service: Arc<VerificationService>, grace: Duration) -> Self {
        Self { service, grace }
    }
}

#[derive(Debug, Deserialize)]
pub struct EnrollBody {
    pub user_id: String,
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub success: bool,
    pub message: String,
    pub user_id: Identity,
    pub quality_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub user_id: String,
    pub image: String,
    #[serde(default)]
    pub skip_liveness: bool,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub verified: bool,
    pub similarity_score: f64,
    pub liveness_passed: bool,
    pub token: Option<String>,
    pub signature: Option<String>,
    pub expires_in_seconds: Option<u64>,
    pub message: String,
}

impl From<VerifyOutcome> for VerifyResponse {
    fn from(outcome: VerifyOutcome) -> Self {
        Self {
            success: true,
            verified: outcome.verified,
            similarity_score: outcome.similarity_score,
            liveness_passed: outcome.liveness_passed,
            token: outcome.token,
            signature: outcome.signature,
            expires_in_seconds: outcome.expires_in_seconds,
            message: outcome.message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub enrolled: bool,
    pub user_id: Identity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub valid: bool,
    pub user_id: String,
    pub verified: bool,
    pub score: f64,
    pub expires: i64,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: &'static str,
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/enroll", post(enroll))
        .route("/verify", post(verify))
        .route("/status/:user_id", get(status))
        .route("/validate-token", post(validate_token))
        .route("/user/:user_id", delete(delete_user))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

async fn root(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "online",
        ..state.service.health()
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.service.health())
}

async fn enroll(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<EnrollBody>,
) -> Result<Json<EnrollResponse>, ApiError> {
    let client = client_info(connect.as_ref(), &headers);
    state.service.check_rate_limit(rate_key(&client))?;

    let identity = Identity::parse(&body.user_id)?;
    info!(identity = %identity.redacted(), "enrollment request");
    validate_image_payload(&body.image)?;
    let image = decode_image_payload(&body.image)?;

    let service = Arc::clone(&state.service);
    let target = identity.clone();
    let outcome = tokio::task::spawn_blocking(move || service.enroll(&target, image))
        .await
        .map_err(ApiError::worker_failed)??;

    Ok(Json(EnrollResponse {
        success: true,
        message: "Face enrolled successfully".into(),
        user_id: identity,
        quality_score: Some(outcome.quality_score),
    }))
}

async fn verify(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<VerifyBody>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let client = client_info(connect.as_ref(), &headers);
    state.service.check_rate_limit(rate_key(&client))?;

    let identity = Identity::parse(&body.user_id)?;
    info!(identity = %identity.redacted(), "verification request");
    validate_image_payload(&body.image)?;
    let image = decode_image_payload(&body.image)?;

    let timeout = state.service.request_timeout();
    let request = VerifyRequest {
        identity,
        image,
        skip_liveness: body.skip_liveness,
        client,
        deadline: Some(Instant::now() + timeout),
    };
    let redacted = request.identity.redacted();

    let service = Arc::clone(&state.service);
    let worker = tokio::task::spawn_blocking(move || service.verify(&request));
    let outcome = match tokio::time::timeout(timeout + state.grace, worker).await {
        Ok(joined) => joined.map_err(ApiError::worker_failed)??,
        Err(_) => {
            warn!(identity = %redacted, "verification worker did not finish in time");
            return Err(ApiError::timeout());
        }
    };

    Ok(Json(VerifyResponse::from(outcome)))
}

async fn status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let identity = Identity::parse(&user_id)?;
    let service = Arc::clone(&state.service);
    let report = tokio::task::spawn_blocking(move || service.status(&identity))
        .await
        .map_err(ApiError::worker_failed)??;

    Ok(Json(StatusResponse {
        enrolled: report.enrolled,
        user_id: report.identity,
        enrollment_date: report.enrollment_date,
    }))
}

async fn validate_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = bearer_token(&headers)?;
    let claims = state
        .service
        .validate_token(token)
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

    Ok(Json(TokenResponse {
        valid: true,
        user_id: claims.sub,
        verified: claims.verified,
        score: claims.score,
        expires: claims.exp,
    }))
}

async fn delete_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let identity = Identity::parse(&user_id)?;
    let service = Arc::clone(&state.service);
    let removed = tokio::task::spawn_blocking(move || service.revoke_enrollment(&identity))
        .await
        .map_err(ApiError::worker_failed)??;

    if !removed {
        return Err(ApiError::not_found("User not found"));
    }
    Ok(Json(DeleteResponse {
        success: true,
        message: "User data deleted",
    }))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("No authorization header"))?;
    let invalid_format =
        || ApiError::unauthorized("Invalid authorization format. Use: Bearer <token>");

    let value = value.to_str().map_err(|_| invalid_format())?;
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(invalid_format()),
    }
}

fn client_info(connect: Option<&ConnectInfo<SocketAddr>>, headers: &HeaderMap) -> ClientInfo {
    let ip = connect.map(|ConnectInfo(addr)| addr.ip().to_string());
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ClientInfo::new(ip, agent)
}

fn rate_key(client: &ClientInfo) -> &str {
    client.ip.as_deref().unwrap_or(UNKNOWN_CLIENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token(&headers_with("bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(&headers_with("Bearer  abc ")).unwrap(), "abc");
    }

    #[test]
    fn malformed_authorization_is_rejected() {
        for value in ["Basic abc", "Bearer", "Bearer a b"] {
            let err = bearer_token(&headers_with(value)).unwrap_err();
            assert_eq!(
                err.detail(),
                "Invalid authorization format. Use: Bearer <token>"
            );
        }
        let err = bearer_token(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.detail(), "No authorization header");
    }

    #[test]
    fn client_key_falls_back_without_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("probe/1.0"));
        let client = client_info(None, &headers);
        assert_eq!(rate_key(&client), UNKNOWN_CLIENT);
        assert_eq!(client.agent.as_deref(), Some("probe/1.0"));

        let addr: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        let client = client_info(Some(&ConnectInfo(addr)), &headers);
        assert_eq!(rate_key(&client), "10.0.0.7");
    }
}

//! HTTP adapter for identity reconciliation.
//!
//! # Responsibility
//! - Decode `/identify` requests and map outcomes to HTTP status codes.
//! - Open one store connection per request on a blocking worker.
//!
//! # Invariants
//! - Validation failures return 400 before any store access.
//! - Server-side failures return a generic 500 body; details only reach logs.

pub mod config;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use identity_core::db::open_db_with;
use identity_core::{
    core_version, IdentifyError, IdentifyOptions, IdentifyRequest, IdentifyResponse,
    IdentityService,
};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

const INTERNAL_ERROR_MESSAGE: &str = "internal server error";
const INVALID_BODY_MESSAGE: &str = "invalid request body";

/// Shared, immutable per-process state.
#[derive(Debug, Clone)]
pub struct AppState {
    db_path: Arc<PathBuf>,
    busy_timeout: Duration,
    options: IdentifyOptions,
}

impl AppState {
    pub fn new(db_path: impl Into<PathBuf>, busy_timeout: Duration, options: IdentifyOptions) -> Self {
        Self {
            db_path: Arc::new(db_path.into()),
            busy_timeout,
            options,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.db_path.clone(),
            config.busy_timeout,
            IdentifyOptions {
                max_attempts: config.max_attempts,
                timeout: Some(config.request_timeout),
            },
        )
    }

    fn run_identify(&self, request: &IdentifyRequest) -> Result<IdentifyResponse, IdentifyError> {
        let conn = open_db_with(self.db_path.as_path(), self.busy_timeout)
            .map_err(|err| IdentifyError::Store(err.into()))?;
        IdentityService::with_options(&conn, self.options).identify(request)
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(healthz))
        .route("/healthz", get(healthz))
        .route("/identify", post(identify))
        .with_state(state)
}

/// `/identify` request body.
///
/// `phoneNumber` is accepted as a JSON string or number.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyBody {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<PhoneNumberField>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PhoneNumberField {
    Text(String),
    Number(serde_json::Number),
}

impl PhoneNumberField {
    fn into_text(self) -> String {
        match self {
            Self::Text(value) => value,
            Self::Number(value) => value.to_string(),
        }
    }
}

impl From<IdentifyBody> for IdentifyRequest {
    fn from(body: IdentifyBody) -> Self {
        Self {
            email: body.email,
            phone_number: body.phone_number.map(PhoneNumberField::into_text),
        }
    }
}

/// Error body: `{ "error": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Failure returned by handlers, rendered as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: core_version().to_string(),
    })
}

/// `POST /identify`.
pub async fn identify(
    State(state): State<AppState>,
    payload: Result<Json<IdentifyBody>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ApiError> {
    let Json(body) = payload.map_err(|rejection| {
        warn!(
            "event=identify_http module=http status=rejected error_code=invalid_body error={}",
            rejection.body_text()
        );
        ApiError::bad_request(INVALID_BODY_MESSAGE)
    })?;

    let request = IdentifyRequest::from(body);
    if let Err(err) = request.normalized() {
        warn!("event=identify_http module=http status=rejected error_code=validation");
        return Err(ApiError::bad_request(err.to_string()));
    }

    let outcome = tokio::task::spawn_blocking(move || state.run_identify(&request)).await;
    match outcome {
        Ok(Ok(response)) => Ok(Json(response)),
        Ok(Err(err)) if err.is_client_error() => Err(ApiError::bad_request(err.to_string())),
        // Service already logged the failure with its error code.
        Ok(Err(_)) => Err(ApiError::internal()),
        Err(join_err) => {
            error!(
                "event=identify_http module=http status=error error_code=worker_failed error={}",
                join_err
            );
            Err(ApiError::internal())
        }
    }
}

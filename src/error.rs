use std::convert::Infallible;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

use crate::assets::AssetError;
use crate::auth::AuthError;
use crate::tracker::TrackerError;

const INTERNAL_MESSAGE: &str = "Something went wrong on our end. Please try again later.";

/// Every error body the API sends is `{"message": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    TooManyRequests(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidState(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::Internal(_) => INTERNAL_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}

// warp's blanket `From<T: Reject> for Rejection` lets handlers use `?` on ApiError.
impl warp::reject::Reject for ApiError {}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::AlreadyRunning | TrackerError::NotRunning => {
                ApiError::InvalidState(err.to_string())
            }
            TrackerError::InvalidWindow => ApiError::Validation(err.to_string()),
            TrackerError::Internal(e) => ApiError::Internal(e),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Validation(msg) => ApiError::Validation(msg),
            AuthError::EmailTaken => ApiError::Conflict(err.to_string()),
            AuthError::InvalidCredentials
            | AuthError::MissingToken
            | AuthError::InvalidToken
            | AuthError::ExternalRejected(_) => ApiError::Unauthorized(err.to_string()),
            AuthError::ExternalNotConfigured => ApiError::Unavailable(err.to_string()),
            AuthError::Internal(e) => ApiError::Internal(e),
        }
    }
}

impl From<AssetError> for ApiError {
    fn from(err: AssetError) -> Self {
        match err {
            AssetError::Validation(msg) => ApiError::Validation(msg),
            AssetError::Internal(e) => ApiError::Internal(e),
        }
    }
}

fn json_error(message: impl Into<String>, status: StatusCode) -> warp::reply::Response {
    let body = ErrorMessage {
        message: message.into(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

/// Turns every rejection, ours or warp's, into a JSON error body.
pub async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    if let Some(api_err) = err.find::<ApiError>() {
        match api_err {
            ApiError::Internal(e) => tracing::error!(error = ?e, "request failed"),
            other => tracing::debug!(error = %other, "request rejected"),
        }
        return Ok(json_error(api_err.message(), api_err.status()));
    }

    let (message, status) = if err.is_not_found() {
        ("Not found", StatusCode::NOT_FOUND)
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        ("Invalid request body", StatusCode::BAD_REQUEST)
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        ("Invalid query string", StatusCode::BAD_REQUEST)
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        ("Payload too large", StatusCode::PAYLOAD_TOO_LARGE)
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        ("Unsupported media type", StatusCode::UNSUPPORTED_MEDIA_TYPE)
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        ("Length required", StatusCode::LENGTH_REQUIRED)
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        ("Method not allowed", StatusCode::METHOD_NOT_ALLOWED)
    } else {
        tracing::error!(rejection = ?err, "unhandled rejection");
        (INTERNAL_MESSAGE, StatusCode::INTERNAL_SERVER_ERROR)
    };

    Ok(json_error(message, status))
}

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::session::TokenProviderError;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status} ({code}): {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },
    #[error("access token expired and could not be renewed")]
    TokenExpired,
    #[error("credential renewal failed: {0}")]
    Credentials(#[from] TokenProviderError),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Connection,
    Recoverable,
    ExpiredCredential,
    Permission,
    Malformed,
    Permanent,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl DriveError {
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::from_body(status, &body)
    }

    pub(crate) fn from_body(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => DriveError::Api {
                status,
                code: envelope.error.code.unwrap_or_else(|| "unknown".into()),
                message: envelope.error.message.unwrap_or_default(),
            },
            Err(_) => DriveError::Api {
                status,
                code: "unknown".into(),
                message: body.to_string(),
            },
        }
    }

    pub fn classification(&self) -> ApiErrorClass {
        match self {
            DriveError::Request(err) if is_connection_failure(err) => ApiErrorClass::Connection,
            DriveError::Request(err) if err.is_decode() => ApiErrorClass::Malformed,
            DriveError::Api { status, .. } => classify_api_status(*status),
            DriveError::TokenExpired => ApiErrorClass::ExpiredCredential,
            DriveError::Credentials(_) => ApiErrorClass::Permission,
            DriveError::MalformedResponse(_) => ApiErrorClass::Malformed,
            _ => ApiErrorClass::Permanent,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    pub fn is_name_conflict(&self) -> bool {
        matches!(self, DriveError::Api { status, .. } if *status == StatusCode::CONFLICT)
    }
}

pub(crate) fn is_connection_failure(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

pub(crate) fn is_recoverable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::ExpiredCredential
    } else if status == StatusCode::FORBIDDEN {
        ApiErrorClass::Permission
    } else if is_recoverable_status(status) {
        ApiErrorClass::Recoverable
    } else {
        ApiErrorClass::Permanent
    }
}

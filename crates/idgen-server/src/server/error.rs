use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use idgen::Error;
use serde_json::json;

/// Library errors rendered as JSON responses.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::SourceNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidSource { .. } | Error::DuplicateIdentifier { .. } => StatusCode::CONFLICT,
            Error::Validation(_) | Error::InsufficientCapacity { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }

        let mut body = json!({ "error": self.0.to_string() });
        match self.0 {
            Error::Validation(errors) => body["fields"] = json!(errors),
            Error::DuplicateIdentifier { identifiers } => body["duplicates"] = json!(identifiers),
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::models::ErrorBody;
use crate::processor::ProcessError;
use crate::upload::UploadError;

#[derive(Debug, Error)]
pub enum AppError {
    /// Anything wrong with the multipart upload itself
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Invalid route parameter; nothing was dispatched
    #[error("{0}")]
    BadRequest(String),

    /// The external program failed. `message` is all the client sees.
    #[error("{message}")]
    Processing {
        message: &'static str,
        #[source]
        source: ProcessError,
    },

    /// Failure inside the gateway itself
    #[error("Failed to {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Upload(err) => err.status_code(),
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Processing { .. } | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to hand to the client
    pub fn user_message(&self) -> String {
        match self {
            AppError::Upload(err) if err.status_code().is_client_error() => err.to_string(),
            AppError::BadRequest(message) => message.clone(),
            AppError::Processing { message, .. } => message.to_string(),
            AppError::Upload(_) | AppError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            // processing failures are logged with their stderr where they happen
            AppError::Processing { .. } => (),
            AppError::Upload(err) if status.is_server_error() => {
                error!(error = ?err, "upload could not be stored")
            }
            AppError::Internal(_) => error!(error = %self, "internal error"),
            _ => tracing::debug!(error = %self, %status, "rejected request"),
        }

        (
            status,
            Json(ErrorBody {
                error: self.user_message(),
            }),
        )
            .into_response()
    }
}

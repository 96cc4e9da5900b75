use crate::services::{
    part_store::StoreError, upload_service::UploadError, user_service::UserError,
};
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::fmt;

/// Error surfaced to the mobile client.
///
/// Rendered the way MCA expects failures: a `text/html` body with an `ERROR`
/// line followed by the message.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request on a missing or empty header.
    pub fn missing_header(name: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            format!("Missing {} parameter", name),
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "request failed: {}", self.message);
        } else {
            tracing::debug!(status = %self.status, "request rejected: {}", self.message);
        }

        let body = format!("ERROR\n{}\n", self.message);
        let mut response = (self.status, body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html"),
        );
        response
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::MissingHeader(_) | UploadError::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            UploadError::Unauthorized => StatusCode::UNAUTHORIZED,
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::InvalidState(_) => StatusCode::CONFLICT,
            UploadError::Store(StoreError::InvalidBody(body_err))
                if body_err.kind() == std::io::ErrorKind::TimedOut =>
            {
                StatusCode::REQUEST_TIMEOUT
            }
            UploadError::Store(StoreError::InvalidBody(_)) => StatusCode::BAD_REQUEST,
            UploadError::Store(_) | UploadError::Finalize(_) | UploadError::User(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<UserError> for AppError {
    fn from(err: UserError) -> Self {
        let status = match &err {
            UserError::UserNotFound(_) => StatusCode::NOT_FOUND,
            UserError::UserAlreadyExists(_) => StatusCode::CONFLICT,
            UserError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            UserError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sequence::SequenceId;
    use std::io;

    #[test]
    fn upload_errors_map_to_statuses() {
        let timed_out = UploadError::Store(StoreError::InvalidBody(io::Error::new(
            io::ErrorKind::TimedOut,
            "no data",
        )));
        let reset = UploadError::Store(StoreError::InvalidBody(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "gone",
        )));
        let cases = [
            (timed_out, StatusCode::REQUEST_TIMEOUT),
            (reset, StatusCode::BAD_REQUEST),
            (UploadError::MissingHeader("Moteve-Part"), StatusCode::BAD_REQUEST),
            (UploadError::Unauthorized, StatusCode::UNAUTHORIZED),
            (UploadError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (UploadError::InvalidState(SequenceId::new()), StatusCode::CONFLICT),
            (
                UploadError::Store(StoreError::Io(io::Error::other("disk"))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }

    #[test]
    fn errors_are_rendered_as_html() {
        let response = AppError::missing_header("Moteve-Token").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
    }
}

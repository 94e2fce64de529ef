//! Engine error to HTTP status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::kernel::UwsError;

/// Wrapper turning [`UwsError`] into an HTTP response: 400 for request
/// violations, 403 for permission failures, 404 for unknown resources,
/// 500 for engine-side failures.
#[derive(Debug)]
pub struct ApiError(pub UwsError);

impl From<UwsError> for ApiError {
    fn from(error: UwsError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            UwsError::IllegalPhaseTransition { .. }
            | UwsError::InvalidParameter { .. }
            | UwsError::ModificationForbidden(_)
            | UwsError::BadRequest(_) => StatusCode::BAD_REQUEST,
            UwsError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            UwsError::JobNotFound(_)
            | UwsError::ResultNotFound { .. }
            | UwsError::ListNotFound(_) => StatusCode::NOT_FOUND,
            UwsError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
        }
        (status, self.0.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ExecutionPhase;

    fn status_of(error: UwsError) -> StatusCode {
        ApiError(error).into_response().status()
    }

    #[test]
    fn statuses_follow_the_error_taxonomy() {
        assert_eq!(
            status_of(UwsError::BadRequest("nope".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(UwsError::IllegalPhaseTransition {
                from: ExecutionPhase::Completed,
                to: ExecutionPhase::Executing,
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(UwsError::PermissionDenied("denied".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(UwsError::JobNotFound("42".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(UwsError::Internal(anyhow::anyhow!("boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

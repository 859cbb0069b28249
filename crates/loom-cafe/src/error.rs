use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use loom_node::NodeError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Node(NodeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<NodeError> for ServerError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Unauthorized => ServerError::Unauthorized,
            NodeError::Forbidden => ServerError::Forbidden,
            other => ServerError::Node(other),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Node(e) => {
                let status = StatusCode::from_u16(e.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!(error = %e, "cafe request failed");
                    (status, "Internal server error".to_string())
                } else {
                    (status, e.to_string())
                }
            }
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_auth_errors_keep_their_status() {
        let resp = ServerError::from(NodeError::Unauthorized).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = ServerError::from(NodeError::Forbidden).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = ServerError::from(NodeError::ContactNotFound("abc".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ServerError::from(NodeError::NotWritable).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

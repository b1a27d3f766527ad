//! Static bearer-token check for the HTTP API.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;

use crate::web::api::{AppState, json_error};

/// Rejects requests without the configured token. A no-op when the server
/// has no token.
pub async fn require_token(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };
    match auth {
        Some(TypedHeader(auth)) if auth.token() == expected => next.run(req).await,
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "rejected request with invalid token");
            json_error("Invalid token", StatusCode::UNAUTHORIZED)
        }
        None => json_error("Missing bearer token", StatusCode::UNAUTHORIZED),
    }
}

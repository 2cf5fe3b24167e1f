use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::{AppError, AppResult};

/// Shared secret expected in `Authorization: Bearer ...`. `None` leaves the API open.
#[derive(Clone, Default)]
pub struct ApiToken(Option<Arc<str>>);

impl ApiToken {
    pub fn new(token: Option<String>) -> Self {
        ApiToken(token.filter(|token| !token.is_empty()).map(Arc::from))
    }

    pub fn accepts(&self, header: Option<&str>) -> bool {
        let Some(expected) = &self.0 else {
            return true;
        };

        header
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|given| given.trim() == &**expected)
    }
}

pub async fn require_bearer(
    State(token): State<ApiToken>,
    request: Request,
    next: Next,
) -> AppResult<Response> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if !token.accepts(header) {
        tracing::warn!(path = %request.uri().path(), "rejected unauthenticated request");
        return Err(AppError::unauthorized());
    }

    Ok(next.run(request).await)
}

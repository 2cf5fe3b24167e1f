pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod rooms;

use axum::{
    extract::FromRef,
    http::{Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sqlx::SqlitePool;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};

pub use error::ChatError;
pub use rooms::{ChatRelay, ConnectionId, MessageStore, RoomKey};

pub type UserId = i64;
/// Organizational site of a sender. Carried as metadata, never used for routing.
pub type EntityId = i64;
/// Client-generated token identifying an optimistic message until it is confirmed.
pub type TempId = i64;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: MessageStore,
    pub relay: ChatRelay,
    pub api_token: auth::ApiToken,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, api_token: Option<String>) -> Self {
        let store = MessageStore::new(db_pool);
        let relay = ChatRelay::new(store.clone());

        AppState {
            store,
            relay,
            api_token: auth::ApiToken::new(api_token),
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .merge(rooms::router())
        .route_layer(middleware::from_fn_with_state(app_state.clone(), auth::require_bearer))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

async fn health() -> &'static str {
    "ok"
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub StatusCode, pub anyhow::Error);

impl AppError {
    pub fn unauthorized() -> Self {
        Self(StatusCode::UNAUTHORIZED, anyhow::Error::msg("missing or invalid bearer token"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let AppError(status, err) = self;
        if status.is_server_error() {
            tracing::error!("{err:#}");
            (status, format!("{}\n\n{}", err, err.backtrace())).into_response()
        } else {
            (status, err.to_string()).into_response()
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let status = if err.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self(status, anyhow::Error::from(err))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(StatusCode::INTERNAL_SERVER_ERROR, anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(serde_json::Error);
apperr_impl!(sqlx::Error);
apperr_impl!(axum::Error);

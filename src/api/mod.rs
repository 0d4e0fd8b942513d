use axum::Router;

use self::rest::router as rest_router;

pub mod rest;

pub fn build_router() -> Router {
    Router::new().nest("/quota-manager", rest_router())
}

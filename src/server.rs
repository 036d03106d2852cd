//! Route table (§4.10, §4.7): the proxy engine mounted at `/proxy/*`, the
//! admin API mounted at `/api/*`, and a bare health check.

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use crate::admin;
use crate::config::AppConfig;
use crate::proxy;
use crate::state::AppState;

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Builds the CORS layer from `AppConfig`'s `ALLOWED_ORIGINS`/`ALLOWED_METHODS`/
/// `ALLOWED_HEADERS`/`ALLOW_CREDENTIALS` (§6.5). `enable_cors = false` disables
/// the layer entirely rather than installing a deny-all one.
fn build_cors(cfg: &AppConfig) -> Option<CorsLayer> {
    if !cfg.enable_cors {
        return None;
    }

    let origin = if cfg.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = cfg
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let methods = if cfg.allowed_methods.iter().any(|m| m == "*") {
        AllowMethods::any()
    } else {
        let methods: Vec<Method> = cfg
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse::<Method>().ok())
            .collect();
        AllowMethods::list(methods)
    };

    let headers = if cfg.allowed_headers.iter().any(|h| h == "*") {
        AllowHeaders::any()
    } else {
        let headers: Vec<HeaderName> = cfg
            .allowed_headers
            .iter()
            .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
            .collect();
        AllowHeaders::list(headers)
    };

    let mut cors = CorsLayer::new().allow_origin(origin).allow_methods(methods).allow_headers(headers);
    if cfg.allow_credentials {
        cors = cors.allow_credentials(true);
    }
    Some(cors)
}

pub fn app(state: AppState) -> Router {
    let cors = build_cors(&state.cfg);
    let router = Router::new()
        .route("/health", get(health))
        .route("/proxy/:group_name/*rest", axum::routing::any(proxy::handle))
        .nest("/api", admin::router(state.clone()));

    match cors {
        Some(cors) => router.layer(cors).with_state(state),
        None => router.with_state(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send<T: Send>() {}

    #[test]
    fn app_router_is_send() {
        is_send::<Router>();
    }
}

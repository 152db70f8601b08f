//! HTTP surface
//!
//! The gateway API listener. Credentials arrive in the `X-API-Key` header;
//! every response body is JSON. The metrics listener is separate (see
//! `metrics_server`) so operational scrape traffic never shares a port
//! with the authenticated surface.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::GatewayError;
use crate::gateway::{Capabilities, ExecuteResponse, Gateway, PostureRequest, PostureResponse};
use crate::posture::PostureState;
use crate::validator::CommandRequest;

/// Header carrying the caller's credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Build the gateway router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/execute", post(execute_handler))
        .route("/posture", post(posture_handler).get(posture_status_handler))
        .route("/capabilities", get(capabilities_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Serve the gateway API until the process exits.
pub async fn serve(gateway: Arc<Gateway>, config: &ServerConfig) -> Result<()> {
    let mut app = router(gateway);

    if !config.allowed_origins.is_empty() {
        app = app.layer(cors_layer(&config.allowed_origins)?);
    }

    let listen = &config.listen;
    info!("Starting gateway server on {}", listen);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind gateway server on {}", listen))?;

    axum::serve(listener, app)
        .await
        .context("Gateway server error")?;

    Ok(())
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .with_context(|| format!("Invalid allowed origin: {}", o))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)]))
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

async fn execute_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<CommandRequest>,
) -> Result<Json<ExecuteResponse>, GatewayError> {
    let response = gateway.handle_execute(api_key(&headers), request).await?;
    Ok(Json(response))
}

async fn posture_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<PostureRequest>,
) -> Result<Json<PostureResponse>, GatewayError> {
    let response = gateway.handle_posture(api_key(&headers), request).await?;
    Ok(Json(response))
}

async fn posture_status_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, PostureState>>, GatewayError> {
    let status = gateway.posture_status(api_key(&headers))?;
    Ok(Json(status))
}

async fn capabilities_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Capabilities>, GatewayError> {
    let caps = gateway.capabilities(api_key(&headers))?;
    Ok(Json(caps))
}

/// Unauthenticated liveness probe. Reports nothing but liveness.
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "up" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::auth::PrivilegeTier;
    use crate::config::{ApiKeyEntry, Config, RateLimitSettings};
    use crate::policy::{ArgPatternSpec, PolicySet, PolicyStore, RuleSpec};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_gateway() -> Arc<Gateway> {
        let mut config = Config::default();
        config.sandbox.scratch_dir = std::env::temp_dir().display().to_string();
        config.rate_limit = RateLimitSettings {
            enabled: false,
            ..Default::default()
        };
        config.auth.keys = vec![ApiKeyEntry {
            key: "op-key".to_string(),
            identity: "alice".to_string(),
            tier: PrivilegeTier::Operator,
        }];

        let mut specs = HashMap::new();
        specs.insert(
            "echo".to_string(),
            RuleSpec {
                patterns: vec![ArgPatternSpec::Regex {
                    regex: "[a-zA-Z0-9 ._-]{0,64}".to_string(),
                }],
                max_timeout_secs: 5,
                required_tier: PrivilegeTier::ReadOnly,
                ..Default::default()
            },
        );
        let policy = PolicyStore::new(PolicySet::compile(specs).unwrap());
        let (audit, _sink) = AuditLogger::in_memory(64);

        Arc::new(Gateway::assemble(&config, policy, audit).unwrap())
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let app = router(test_gateway());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_execute_without_key_is_401() {
        let app = router(test_gateway());
        let request = Request::post("/execute")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"program":"echo","args":["hi"]}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_json(response).await;
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let app = router(test_gateway());
        let request = Request::post("/execute")
            .header("content-type", "application/json")
            .header("x-api-key", "op-key")
            .body(Body::from(r#"{"program":"echo","args":["hello"]}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["exit_code"], 0);
        assert_eq!(body["stdout"].as_str().unwrap().trim(), "hello");
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_denied_command_is_403_with_generic_body() {
        let app = router(test_gateway());
        let request = Request::post("/execute")
            .header("content-type", "application/json")
            .header("x-api-key", "op-key")
            .body(Body::from(r#"{"program":"rm","args":["-rf","/"]}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(body["error"], "policy_denied");
        // No hint about which rules exist.
        assert!(!body["message"].as_str().unwrap().contains("rm"));
    }

    #[tokio::test]
    async fn test_posture_get_requires_auth() {
        let app = router(test_gateway());
        let response = app
            .oneshot(Request::get("/posture").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_posture_get_reports_all_dimensions() {
        let app = router(test_gateway());
        let request = Request::get("/posture")
            .header("x-api-key", "op-key")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        for dim in ["firewall", "proxy", "vpn", "tor"] {
            assert_eq!(body[dim], "off");
        }
    }

    #[tokio::test]
    async fn test_posture_post_below_admin_is_403() {
        let app = router(test_gateway());
        let request = Request::post("/posture")
            .header("content-type", "application/json")
            .header("x-api-key", "op-key")
            .body(Body::from(r#"{"dimension":"vpn","target":"on"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_capabilities_round_trip() {
        let app = router(test_gateway());
        let request = Request::get("/capabilities")
            .header("x-api-key", "op-key")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["identity"], "alice");
        assert_eq!(body["programs"], serde_json::json!(["echo"]));
    }
}

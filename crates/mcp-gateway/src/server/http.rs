//! HTTP serving shim for upstream MCP traffic.
//!
//! A concrete rendition of the transport-collaborator contract: `POST /mcp`
//! carries one JSON-RPC frame in and one out, with the session resolved from
//! the `Mcp-Session-Id` (or `X-Session-Id`) header and echoed back on every
//! response. Notifications return `202 Accepted` with no body. Auth, rate
//! limiting, and metrics endpoints live in front of this router, not here.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::protocol::JsonRpcRequest;

use super::handler::GatewayHandler;

/// Session continuity headers accepted from upstream clients.
const SESSION_HEADERS: [&str; 2] = ["Mcp-Session-Id", "X-Session-Id"];

/// Build the upstream router.
pub fn create_router(handler: Arc<GatewayHandler>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/mcp", post(handle_mcp_post))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

/// Serve on the given port until the process exits.
pub async fn run_http(handler: Arc<GatewayHandler>, port: u16) -> anyhow::Result<()> {
    let router = create_router(handler);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Upstream HTTP transport listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn handle_health(State(handler): State<Arc<GatewayHandler>>) -> impl IntoResponse {
    let sessions = handler.sessions().count().await;
    let backends = handler.router().supervisor().reports().await.len();
    Json(serde_json::json!({
        "status": "ok",
        "service": "mcp-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "backends": backends,
    }))
}

async fn handle_mcp_post(
    State(handler): State<Arc<GatewayHandler>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let session_id = SESSION_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok());

    let session = handler.sessions().get_or_create(session_id).await;

    match handler.handle(request, &session).await {
        Some(response) => {
            let mut http_response = Json(response).into_response();
            if let Ok(value) = HeaderValue::from_str(&session.id) {
                http_response.headers_mut().insert("Mcp-Session-Id", value);
            }
            http_response
        }
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::supervisor::BackendSupervisor;
    use crate::config::{GatewayInfo, GatewayLimits};
    use crate::router::AggregationRouter;
    use crate::sandbox::gate::ExecutionGate;
    use crate::sandbox::CodeExecutor;
    use crate::server::session::SessionManager;

    fn test_handler() -> Arc<GatewayHandler> {
        let supervisor = BackendSupervisor::new();
        let router =
            Arc::new(AggregationRouter::new(supervisor.clone(), ExecutionGate::allow_all()));
        let sessions = Arc::new(SessionManager::new(GatewayLimits::default()));
        let executor = Arc::new(CodeExecutor::new(supervisor, ExecutionGate::allow_all()));
        Arc::new(GatewayHandler::new(GatewayInfo::default(), router, sessions, executor))
    }

    #[tokio::test]
    async fn test_router_builds() {
        let _router = create_router(test_handler());
    }

    #[tokio::test]
    async fn test_post_returns_response_and_session_header() {
        use tower::ServiceExt;

        let router = create_router(test_handler());
        let body = serde_json::to_vec(&JsonRpcRequest::request(1, "ping", None)).unwrap();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("Mcp-Session-Id"));
    }
}

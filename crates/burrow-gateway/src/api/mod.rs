//! Administrative HTTP API
//!
//! JSON endpoints for managing clients and their tunnels at runtime. Every
//! route except `/api/health` requires the `x-access-key` header.

pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::relay::Relay;

pub use middleware::ACCESS_KEY_HEADER;

/// Application state shared across handlers
pub struct AppState {
    pub relay: Arc<Relay>,
    pub access_key: String,
}

/// Build the router with all routes
pub fn build_router(relay: Arc<Relay>, access_key: impl Into<String>) -> Router {
    let state = Arc::new(AppState {
        relay,
        access_key: access_key.into(),
    });

    let public_router = Router::new()
        .route("/api/health", get(handlers::health_check))
        .with_state(state.clone());

    let protected_router = Router::new()
        .route("/api/clients", get(handlers::list_clients))
        .route(
            "/api/clients/{identity}",
            post(handlers::create_client).delete(handlers::delete_client),
        )
        .route("/api/clients/{identity}/online", get(handlers::client_online))
        .route("/api/clients/{identity}/key", get(handlers::client_key))
        .route(
            "/api/clients/{identity}/tunnels",
            get(handlers::list_tunnels).post(handlers::create_tunnel),
        )
        .route(
            "/api/clients/{identity}/tunnels/{rule_id}",
            put(handlers::update_tunnel).delete(handlers::delete_tunnel),
        )
        .route(
            "/api/clients/{identity}/tunnels/{rule_id}/stats",
            get(handlers::tunnel_stats),
        )
        .with_state(state.clone())
        .layer(axum_middleware::from_fn_with_state(
            state,
            middleware::require_access_key,
        ));

    public_router.merge(protected_router)
}

/// Bound admin listener, ready to serve
pub struct AdminServer {
    listener: TcpListener,
    router: Router,
}

impl AdminServer {
    pub async fn bind(
        addr: &str,
        relay: Arc<Relay>,
        access_key: impl Into<String>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: build_router(relay, access_key),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        info!("Admin API listening on {}", self.local_addr()?);
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use burrow_proto::TunnelRule;
    use models::{ClientList, ErrorResponse, KeyResponse, OnlineResponse, TunnelList, TunnelStats};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt; // For oneshot()

    const KEY: &str = "test-access-key";

    async fn app() -> (Router, Arc<Relay>) {
        let config = GatewayConfig::parse("gateway: { ip: 127.0.0.1, port: 0 }").unwrap();
        let relay = Arc::new(Relay::new(config, None));
        relay.start().await.unwrap();
        (build_router(relay.clone(), KEY), relay)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(ACCESS_KEY_HEADER, KEY);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn json<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    const TUNNEL: &str = r#"{"public_protocol":"tcp","public_ip":"127.0.0.1","public_port":0,
        "internal_ip":"127.0.0.1","internal_port":8080}"#;

    #[tokio::test]
    async fn test_health_is_public() {
        let (app, relay) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_access_key_required() {
        let (app, relay) = app().await;
        let missing = app
            .clone()
            .oneshot(Request::builder().uri("/api/clients").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .oneshot(
                Request::builder()
                    .uri("/api/clients")
                    .header(ACCESS_KEY_HEADER, "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(wrong.into_body(), usize::MAX).await.unwrap();
        let error: ErrorResponse = json(&body);
        assert_eq!(error.code.as_deref(), Some("UNAUTHORIZED"));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_lifecycle() {
        let (app, relay) = app().await;

        let (status, body) = call(&app, "POST", "/api/clients/agent1", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: KeyResponse = json(&body);
        assert_eq!(created.identity, "agent1");

        let (status, _) = call(&app, "POST", "/api/clients/agent1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = call(&app, "GET", "/api/clients/agent1/key", None).await;
        let key: KeyResponse = json(&body);
        assert_eq!(key.key, created.key);

        let (_, body) = call(&app, "GET", "/api/clients/agent1/online", None).await;
        let online: OnlineResponse = json(&body);
        assert!(!online.online);

        let (_, body) = call(&app, "GET", "/api/clients", None).await;
        let list: ClientList = json(&body);
        assert_eq!(list.clients.len(), 1);
        assert_eq!(list.clients[0].tunnels, 0);

        let (status, _) = call(&app, "DELETE", "/api/clients/agent1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, "GET", "/api/clients/agent1/online", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ErrorResponse = json(&body);
        assert_eq!(error.code.as_deref(), Some("CLIENT_NOT_FOUND"));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_tunnel_lifecycle() {
        let (app, relay) = app().await;
        call(&app, "POST", "/api/clients/agent1", None).await;

        let (status, body) = call(&app, "POST", "/api/clients/agent1/tunnels", Some(TUNNEL)).await;
        assert_eq!(status, StatusCode::CREATED);
        let rule: TunnelRule = json(&body);
        assert_eq!(rule.identity, "agent1");
        assert!(!rule.id.is_empty());

        let (_, body) = call(&app, "GET", "/api/clients/agent1/tunnels", None).await;
        let list: TunnelList = json(&body);
        assert_eq!(list.tunnels, vec![rule.clone()]);

        let stats_uri = format!("/api/clients/agent1/tunnels/{}/stats", rule.id);
        let (status, body) = call(&app, "GET", &stats_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let stats: TunnelStats = json(&body);
        assert_eq!((stats.input, stats.output), (0, 0));

        let rule_uri = format!("/api/clients/agent1/tunnels/{}", rule.id);
        let updated_body = TUNNEL.replace("8080", "9090");
        let (status, body) = call(&app, "PUT", &rule_uri, Some(&updated_body)).await;
        assert_eq!(status, StatusCode::OK);
        let updated: TunnelRule = json(&body);
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.internal_port, 9090);

        let (status, _) = call(&app, "DELETE", &rule_uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "DELETE", &rule_uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_tunnel_for_unknown_client() {
        let (app, relay) = app().await;
        let (status, _) = call(&app, "POST", "/api/clients/ghost/tunnels", Some(TUNNEL)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let (_, relay) = app().await;
        let server = AdminServer::bind("127.0.0.1:0", relay.clone(), KEY).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.run(shutdown.clone()));

        tokio::net::TcpStream::connect(addr).await.unwrap();
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        relay.shutdown().await;
    }
}

//! Admin API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use burrow_server_tcp::TcpServerError;
use burrow_server_udp::UdpServerError;
use std::sync::Arc;
use tracing::{debug, info};

use super::models::{
    ClientInfo, ClientList, ErrorResponse, HealthResponse, KeyResponse, OnlineResponse,
    TunnelList, TunnelRequest, TunnelStats,
};
use super::AppState;
use crate::manager::ManagerError;
use crate::relay::RelayError;
use burrow_proto::TunnelRule;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(err: RelayError) -> ApiError {
    let (status, code) = match &err {
        RelayError::Manager(ManagerError::ClientNotFound(_)) => {
            (StatusCode::NOT_FOUND, "CLIENT_NOT_FOUND")
        }
        RelayError::Manager(ManagerError::RuleNotFound { .. }) => {
            (StatusCode::NOT_FOUND, "TUNNEL_NOT_FOUND")
        }
        RelayError::Manager(ManagerError::ClientExists(_)) => (StatusCode::CONFLICT, "CLIENT_EXISTS"),
        RelayError::Manager(ManagerError::RuleExists { .. }) => (StatusCode::CONFLICT, "TUNNEL_EXISTS"),
        RelayError::Manager(ManagerError::Tcp(TcpServerError::BindError { .. }))
        | RelayError::Manager(ManagerError::Udp(UdpServerError::BindError { .. })) => {
            (StatusCode::BAD_REQUEST, "BIND_FAILED")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        clients: state.relay.clients().await.len(),
        online: state.relay.registry().count().await,
    })
}

pub async fn list_clients(State(state): State<Arc<AppState>>) -> Json<ClientList> {
    let mut clients = Vec::new();
    for identity in state.relay.clients().await {
        let Ok(tunnels) = state.relay.tunnels(&identity).await else {
            continue;
        };
        clients.push(ClientInfo {
            online: state.relay.is_online(&identity).await,
            tunnels: tunnels.len(),
            identity,
        });
    }
    Json(ClientList { clients })
}

pub async fn create_client(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<(StatusCode, Json<KeyResponse>)> {
    info!("Creating client: {}", identity);
    state.relay.add_client(&identity).await.map_err(api_error)?;
    let key = state.relay.key_for(&identity).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(KeyResponse { identity, key })))
}

pub async fn delete_client(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<StatusCode> {
    info!("Deleting client: {}", identity);
    state.relay.remove_client(&identity).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn client_online(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<Json<OnlineResponse>> {
    if !state.relay.manager().check_identity_registered(&identity).await {
        return Err(api_error(ManagerError::ClientNotFound(identity).into()));
    }
    let online = state.relay.is_online(&identity).await;
    Ok(Json(OnlineResponse { identity, online }))
}

pub async fn client_key(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<Json<KeyResponse>> {
    let key = state.relay.key_for(&identity).await.map_err(api_error)?;
    Ok(Json(KeyResponse { identity, key }))
}

pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<Json<TunnelList>> {
    let tunnels = state.relay.tunnels(&identity).await.map_err(api_error)?;
    Ok(Json(TunnelList { tunnels }))
}

pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    Json(request): Json<TunnelRequest>,
) -> ApiResult<(StatusCode, Json<TunnelRule>)> {
    info!(
        "Creating {} tunnel for {} on {}:{}",
        request.public_protocol, identity, request.public_ip, request.public_port
    );
    let rule = state
        .relay
        .add_tunnel(&identity, &request)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn update_tunnel(
    State(state): State<Arc<AppState>>,
    Path((identity, rule_id)): Path<(String, String)>,
    Json(request): Json<TunnelRequest>,
) -> ApiResult<Json<TunnelRule>> {
    info!("Updating tunnel {} of {}", rule_id, identity);
    let rule = state
        .relay
        .update_tunnel(&identity, &rule_id, &request)
        .await
        .map_err(api_error)?;
    Ok(Json(rule))
}

pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path((identity, rule_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    info!("Deleting tunnel {} of {}", rule_id, identity);
    state
        .relay
        .remove_tunnel(&identity, &rule_id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn tunnel_stats(
    State(state): State<Arc<AppState>>,
    Path((identity, rule_id)): Path<(String, String)>,
) -> ApiResult<Json<TunnelStats>> {
    debug!("Getting stats for tunnel {} of {}", rule_id, identity);
    let stats = state
        .relay
        .tunnel_stats(&identity, &rule_id)
        .await
        .map_err(api_error)?;
    Ok(Json(TunnelStats {
        identity,
        rule_id,
        input: stats.input,
        output: stats.output,
    }))
}

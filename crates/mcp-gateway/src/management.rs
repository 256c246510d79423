use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use http::StatusCode;
use http::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::gateway::Gateway;
use crate::storage::{LogQuery, ServerUpdate, StorageError};
use crate::types::registry::ServerConfig;
use crate::*;

/// Management REST surface, mounted at `/api` and guarded by a single bearer
/// token (header or `?token=`). `/health` stays open for liveness probes.
pub fn router(gateway: Arc<Gateway>, token: &str) -> Router {
	let token: Arc<str> = token.into();
	let protected = Router::new()
		.route("/logs", get(query_logs))
		.route("/logs/clear", post(clear_logs))
		.route("/servers", get(server_aggregates))
		.route("/servers/health", get(server_health))
		.route("/sessions", get(session_aggregates))
		.route("/clients", get(client_aggregates))
		.route("/methods", get(method_aggregates))
		.route("/servers/config", get(server_configs).post(add_server))
		.route(
			"/servers/config/{name}",
			put(update_server).delete(remove_server),
		)
		.route("/servers/{name}/health-check", post(health_check))
		.layer(axum::middleware::from_fn(move |req: Request, next: Next| {
			let token = token.clone();
			async move {
				if authorized(&token, &req) {
					next.run(req).await
				} else {
					ApiError::Unauthorized.into_response()
				}
			}
		}))
		.with_state(gateway);
	Router::new()
		.merge(protected)
		.route("/health", get(liveness))
		.layer(CorsLayer::permissive())
}

fn authorized(token: &str, req: &Request) -> bool {
	if let Some(header) = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok())
		&& let Some(bearer) = header.strip_prefix("Bearer ")
		&& bearer == token
	{
		return true;
	}
	if let Some(query) = req.uri().query()
		&& let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query)
	{
		return pairs.iter().any(|(k, v)| k == "token" && v == token);
	}
	false
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
	#[error("invalid or missing token")]
	Unauthorized,
	#[error("{0}")]
	NotFound(String),
	#[error("{0}")]
	Conflict(String),
	#[error("{0}")]
	Invalid(String),
	#[error("internal error")]
	Internal,
}

impl From<StorageError> for ApiError {
	fn from(e: StorageError) -> ApiError {
		match e {
			StorageError::ServerNotFound(_) => ApiError::NotFound(e.to_string()),
			StorageError::ServerAlreadyExists(_) => ApiError::Conflict(e.to_string()),
			StorageError::InvalidRange(_) | StorageError::Invalid(_) => ApiError::Invalid(e.to_string()),
			other => {
				error!("management storage failure: {other}");
				ApiError::Internal
			},
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, code) = match &self {
			ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
			ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
			ApiError::Conflict(_) => (StatusCode::CONFLICT, "ServerAlreadyExists"),
			ApiError::Invalid(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
			ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
		};
		(
			status,
			Json(json!({"error": {"code": code, "message": self.to_string()}})),
		)
			.into_response()
	}
}

async fn query_logs(
	State(gateway): State<Arc<Gateway>>,
	Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
	Ok(Json(gateway.storage.query_logs(&query).await?))
}

async fn clear_logs(State(gateway): State<Arc<Gateway>>) -> Result<impl IntoResponse, ApiError> {
	gateway.storage.clear_all().await?;
	Ok(Json(json!({"status": "cleared"})))
}

async fn server_aggregates(
	State(gateway): State<Arc<Gateway>>,
) -> Result<impl IntoResponse, ApiError> {
	Ok(Json(gateway.storage.get_servers().await?))
}

#[derive(Debug, Default, Deserialize)]
struct SessionsQuery {
	server: Option<String>,
}

async fn session_aggregates(
	State(gateway): State<Arc<Gateway>>,
	Query(query): Query<SessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
	Ok(Json(
		gateway.storage.get_sessions(query.server.as_deref()).await?,
	))
}

async fn client_aggregates(
	State(gateway): State<Arc<Gateway>>,
) -> Result<impl IntoResponse, ApiError> {
	Ok(Json(gateway.storage.get_clients().await?))
}

async fn method_aggregates(
	State(gateway): State<Arc<Gateway>>,
	Query(query): Query<SessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
	Ok(Json(
		gateway.storage.get_methods(query.server.as_deref()).await?,
	))
}

async fn server_health(
	State(gateway): State<Arc<Gateway>>,
) -> Result<impl IntoResponse, ApiError> {
	Ok(Json(gateway.storage.get_server_health().await?))
}

/// The only read path that returns full configs, `headers` included.
async fn server_configs(
	State(gateway): State<Arc<Gateway>>,
) -> Result<impl IntoResponse, ApiError> {
	Ok(Json(gateway.storage.get_registered_servers().await?))
}

async fn add_server(
	State(gateway): State<Arc<Gateway>>,
	Json(config): Json<ServerConfig>,
) -> Result<impl IntoResponse, ApiError> {
	let config = config
		.normalized()
		.map_err(|e| ApiError::Invalid(e.to_string()))?;
	gateway.storage.add_server(&config).await?;
	info!(server_name = %config.name, url = %config.url, "registered server");
	Ok((StatusCode::CREATED, Json(config)))
}

async fn update_server(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
	Json(update): Json<ServerUpdate>,
) -> Result<impl IntoResponse, ApiError> {
	let updated = gateway.storage.update_server(&name, &update).await?;
	// The URL may have moved; retire the old connection pool.
	if update.url.is_some() {
		gateway.clients.remove(&name);
	}
	Ok(Json(updated))
}

/// Removal drops the client pool, cached session identity, and probe state.
/// Capture history is preserved.
async fn remove_server(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let bound_sessions = gateway.storage.get_sessions(Some(&name)).await?;
	gateway.storage.remove_server(&name).await?;
	for session in &bound_sessions {
		gateway.client_info.clear(&session.session_id);
		gateway.server_info.clear(&session.session_id);
	}
	gateway.clients.remove(&name);
	gateway.health.forget(&name);
	info!(server_name = %name, "removed server (logs preserved)");
	Ok(StatusCode::NO_CONTENT)
}

async fn health_check(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	gateway.health.check_one(&name).await?;
	Ok(Json(json!({"status": "ok"})))
}

async fn liveness() -> impl IntoResponse {
	Json(json!({"status": "ok"}))
}

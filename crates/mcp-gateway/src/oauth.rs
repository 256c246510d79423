use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use cookie::{Cookie, SameSite};
use http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::{Value, json};

use crate::gateway::Gateway;
use crate::storage::StorageError;
use crate::types::registry::ServerConfig;
use crate::*;

pub const COOKIE_NAME: &str = "mcp-gateway-server";

const PROTECTED_RESOURCE: &str = "/.well-known/oauth-protected-resource";
const AUTHORIZATION_SERVER: &str = "/.well-known/oauth-authorization-server";
const OPENID_CONFIGURATION: &str = "/.well-known/openid-configuration";

/// OAuth discovery routes. Both the `/s/` and `/servers/` aliases are bound,
/// plus bare `/.well-known/*` fallbacks that resolve the server from the
/// scoped cookie set by earlier discovery (or 401) responses.
pub fn router(gateway: Arc<Gateway>) -> Router {
	let mut router = Router::new();
	for alias in ["s", "servers"] {
		router = router
			.route(
				&format!("{PROTECTED_RESOURCE}/{alias}/{{name}}/mcp"),
				get(protected_resource),
			)
			.route(
				&format!("{AUTHORIZATION_SERVER}/{alias}/{{name}}/mcp"),
				get(authorization_server),
			)
			.route(
				&format!("{OPENID_CONFIGURATION}/{alias}/{{name}}/mcp"),
				get(openid_configuration),
			)
			.route(
				&format!("/{alias}/{{name}}/mcp{OPENID_CONFIGURATION}"),
				get(openid_configuration),
			)
			.route(&format!("/{alias}/{{name}}/mcp/register"), post(register));
	}
	router
		.route(PROTECTED_RESOURCE, get(protected_resource_by_cookie))
		.route(AUTHORIZATION_SERVER, get(authorization_server_by_cookie))
		.route(OPENID_CONFIGURATION, get(openid_configuration_by_cookie))
		.with_state(gateway)
}

/// The scoped cookie that routes bare `/.well-known/*` hits back to the right
/// upstream.
pub(crate) fn server_cookie(name: &str) -> String {
	Cookie::build((COOKIE_NAME, name))
		.path("/.well-known")
		.http_only(true)
		.same_site(SameSite::Lax)
		.build()
		.to_string()
}

/// Upstream base: the MCP endpoint minus its trailing `/mcp` or `/sse`
/// segment.
pub(crate) fn base_url(url: &str) -> &str {
	for suffix in ["/mcp", "/sse"] {
		if let Some(stripped) = url.strip_suffix(suffix) {
			return stripped;
		}
	}
	url
}

fn cookie_server(headers: &HeaderMap) -> Option<String> {
	for value in headers.get_all(COOKIE) {
		let Ok(value) = value.to_str() else {
			continue;
		};
		for cookie in Cookie::split_parse(value).flatten() {
			if cookie.name() == COOKIE_NAME {
				return Some(cookie.value().to_string());
			}
		}
	}
	None
}

/// External base URL of the gateway as the client sees it, for rewritten
/// `resource` fields.
fn gateway_base(headers: &HeaderMap) -> String {
	let scheme = headers
		.get("x-forwarded-proto")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("http");
	let host = headers
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("localhost");
	format!("{scheme}://{host}")
}

fn discovery_response(status: StatusCode, body: Value, server_name: &str) -> Response {
	let mut response = (status, axum::Json(body)).into_response();
	decorate(response.headers_mut(), server_name);
	response
}

/// Every discovery response carries permissive CORS (browser-based clients
/// drive this flow) and the scoped server cookie.
fn decorate(headers: &mut HeaderMap, server_name: &str) {
	headers.insert(
		"access-control-allow-origin",
		HeaderValue::from_static("*"),
	);
	headers.insert(
		"access-control-allow-methods",
		HeaderValue::from_static("GET, POST, OPTIONS"),
	);
	headers.insert(
		"access-control-allow-headers",
		HeaderValue::from_static("Content-Type, Authorization, MCP-Protocol-Version"),
	);
	if let Ok(value) = HeaderValue::from_str(&server_cookie(server_name)) {
		headers.insert(SET_COOKIE, value);
	}
}

async fn lookup(gateway: &Gateway, name: &str) -> Result<ServerConfig, Response> {
	match gateway.storage.get_server(name).await {
		Ok(cfg) => Ok(cfg),
		Err(StorageError::ServerNotFound(_)) => Err((
			StatusCode::NOT_FOUND,
			axum::Json(json!({"error": {"code": "ServerNotFound", "message": format!("server {name:?} is not registered")}})),
		)
			.into_response()),
		Err(e) => {
			error!(server_name = name, "registry lookup failed: {e}");
			Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
		},
	}
}

async fn fetch_json(
	gateway: &Gateway,
	cfg: &ServerConfig,
	path: &str,
) -> Result<(StatusCode, Option<Value>), Response> {
	let client = gateway.clients.get(&cfg.name).map_err(|e| {
		error!(server_name = %cfg.name, "failed to build upstream client: {e}");
		StatusCode::INTERNAL_SERVER_ERROR.into_response()
	})?;
	let url = format!("{}{path}", base_url(&cfg.url));
	let resp = client.get(&url).send().await.map_err(|e| {
		(
			StatusCode::BAD_GATEWAY,
			axum::Json(json!({"error": {"code": "UpstreamError", "message": e.to_string()}})),
		)
			.into_response()
	})?;
	let status = resp.status();
	let body = resp.json::<Value>().await.ok();
	Ok((status, body))
}

async fn protected_resource(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
	req: Request,
) -> Response {
	protected_resource_inner(&gateway, &name, req.headers()).await
}

async fn protected_resource_by_cookie(
	State(gateway): State<Arc<Gateway>>,
	req: Request,
) -> Response {
	let Some(name) = cookie_server(req.headers()) else {
		return StatusCode::NOT_FOUND.into_response();
	};
	protected_resource_inner(&gateway, &name, req.headers()).await
}

async fn protected_resource_inner(
	gateway: &Gateway,
	name: &str,
	headers: &HeaderMap,
) -> Response {
	let cfg = match lookup(gateway, name).await {
		Ok(cfg) => cfg,
		Err(resp) => return resp,
	};
	let resource = format!("{}/s/{name}/mcp", gateway_base(headers));
	let (status, body) = match fetch_json(gateway, &cfg, PROTECTED_RESOURCE).await {
		Ok(r) => r,
		Err(resp) => return resp,
	};
	if status == StatusCode::NOT_FOUND {
		// Some upstreams have no protected-resource document but do publish
		// an authorization-server one; assemble the former from the latter.
		// MCP Inspector depends on this.
		let (as_status, as_body) = match fetch_json(gateway, &cfg, AUTHORIZATION_SERVER).await {
			Ok(r) => r,
			Err(resp) => return resp,
		};
		if as_status.is_success()
			&& let Some(issuer) = as_body.as_ref().and_then(|b| b.get("issuer")).cloned()
		{
			return discovery_response(
				StatusCode::OK,
				json!({
					"resource": resource,
					"authorization_servers": [issuer],
				}),
				name,
			);
		}
		return discovery_response(StatusCode::NOT_FOUND, json!({"error": "not found"}), name);
	}
	let Some(mut body) = body else {
		return discovery_response(status, json!({"error": "invalid upstream body"}), name);
	};
	// Only the resource field is rewritten; everything else passes through.
	if let Some(obj) = body.as_object_mut() {
		obj.insert("resource".to_string(), json!(resource));
	}
	discovery_response(status, body, name)
}

async fn authorization_server(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
	_req: Request,
) -> Response {
	passthrough(&gateway, &name, AUTHORIZATION_SERVER).await
}

async fn authorization_server_by_cookie(
	State(gateway): State<Arc<Gateway>>,
	req: Request,
) -> Response {
	let Some(name) = cookie_server(req.headers()) else {
		return StatusCode::NOT_FOUND.into_response();
	};
	passthrough(&gateway, &name, AUTHORIZATION_SERVER).await
}

async fn openid_configuration(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
	_req: Request,
) -> Response {
	passthrough(&gateway, &name, OPENID_CONFIGURATION).await
}

async fn openid_configuration_by_cookie(
	State(gateway): State<Arc<Gateway>>,
	req: Request,
) -> Response {
	let Some(name) = cookie_server(req.headers()) else {
		return StatusCode::NOT_FOUND.into_response();
	};
	passthrough(&gateway, &name, OPENID_CONFIGURATION).await
}

/// CORS-rewritten passthrough; the body is relayed unchanged.
async fn passthrough(gateway: &Gateway, name: &str, path: &str) -> Response {
	let cfg = match lookup(gateway, name).await {
		Ok(cfg) => cfg,
		Err(resp) => return resp,
	};
	let (status, body) = match fetch_json(gateway, &cfg, path).await {
		Ok(r) => r,
		Err(resp) => return resp,
	};
	discovery_response(status, body.unwrap_or_else(|| json!({"error": "not found"})), name)
}

/// Dynamic client registration forwards to the upstream `/register`.
async fn register(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
	req: Request,
) -> Response {
	let cfg = match lookup(&gateway, &name).await {
		Ok(cfg) => cfg,
		Err(resp) => return resp,
	};
	let client = match gateway.clients.get(&cfg.name) {
		Ok(client) => client,
		Err(e) => {
			error!(server_name = %cfg.name, "failed to build upstream client: {e}");
			return StatusCode::INTERNAL_SERVER_ERROR.into_response();
		},
	};
	let body = match axum::body::to_bytes(req.into_body(), 1024 * 1024).await {
		Ok(body) => body,
		Err(e) => {
			return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
		},
	};
	let url = format!("{}/register", base_url(&cfg.url));
	let resp = match client
		.post(&url)
		.header(CONTENT_TYPE, "application/json")
		.body(body)
		.send()
		.await
	{
		Ok(resp) => resp,
		Err(e) => {
			return (
				StatusCode::BAD_GATEWAY,
				axum::Json(json!({"error": {"code": "UpstreamError", "message": e.to_string()}})),
			)
				.into_response();
		},
	};
	let status = resp.status();
	let bytes = resp.bytes().await.unwrap_or_default();
	let mut response = http::Response::builder()
		.status(status)
		.header(CONTENT_TYPE, "application/json")
		.body(Body::from(bytes))
		.expect("valid response");
	decorate(response.headers_mut(), &name);
	response
}

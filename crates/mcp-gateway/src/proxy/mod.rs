use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::header::{CONTENT_TYPE, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::{Value, json};
use tokio_util::codec::Decoder;

use crate::capture::{CaptureEngine, HttpContext};
use crate::gateway::Gateway;
use crate::oauth::server_cookie;
use crate::parse::sse::{SseCodec, SseEvent};
use crate::storage::StorageError;
use crate::track::PendingKey;
use crate::types::capture::STATELESS_SESSION;
use crate::types::jsonrpc::{self, JsonRpcMessage, UPSTREAM_ERROR};
use crate::types::registry::ServerConfig;
use crate::*;

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const EVENT_STREAM: &str = "text/event-stream";
const MAX_BODY: usize = 4 * 1024 * 1024;

/// Hop-by-hop headers are stripped in both directions.
const HOP_BY_HOP: &[&str] = &[
	"connection",
	"keep-alive",
	"transfer-encoding",
	"te",
	"trailer",
	"trailers",
	"upgrade",
	"proxy-authenticate",
	"proxy-authorization",
];

/// Client headers forwarded upstream alongside the server's configured ones.
const PASSTHROUGH_REQUEST: &[&str] = &[
	"accept",
	"content-type",
	SESSION_HEADER,
	PROTOCOL_HEADER,
	"last-event-id",
	"authorization",
];

/// Wire routes. `/s/` is canonical; `/servers/` is the long alias.
pub fn router(gateway: Arc<Gateway>) -> Router {
	Router::new()
		.route(
			"/s/{name}/mcp",
			post(handle_post).get(handle_get).delete(handle_delete),
		)
		.route(
			"/servers/{name}/mcp",
			post(handle_post).get(handle_get).delete(handle_delete),
		)
		.with_state(gateway)
}

fn session_of(headers: &HeaderMap) -> String {
	headers
		.get(SESSION_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.unwrap_or_else(|| STATELESS_SESSION.to_string())
}

fn http_context(req: &Request) -> HttpContext {
	let headers = req.headers();
	let client_ip = headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.map(|v| v.trim().to_string())
		.or_else(|| {
			req.extensions()
				.get::<ConnectInfo<SocketAddr>>()
				.map(|ci| ci.0.ip().to_string())
		});
	HttpContext {
		user_agent: headers
			.get(http::header::USER_AGENT)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.to_string()),
		client_ip,
	}
}

fn plain_error(status: StatusCode, code: &str, message: &str) -> Response {
	(
		status,
		axum::Json(json!({"error": {"code": code, "message": message}})),
	)
		.into_response()
}

fn jsonrpc_error(status: StatusCode, body: Value) -> Response {
	(
		status,
		[(CONTENT_TYPE, "application/json")],
		body.to_string(),
	)
		.into_response()
}

async fn lookup_server(gateway: &Gateway, name: &str) -> Result<ServerConfig, Response> {
	match gateway.storage.get_server(name).await {
		Ok(cfg) => Ok(cfg),
		Err(StorageError::ServerNotFound(_)) => Err(plain_error(
			StatusCode::NOT_FOUND,
			"ServerNotFound",
			&format!("server {name:?} is not registered"),
		)),
		Err(e) => {
			error!(server_name = name, "registry lookup failed: {e}");
			Err(plain_error(
				StatusCode::INTERNAL_SERVER_ERROR,
				"StorageError",
				"storage unavailable",
			))
		},
	}
}

fn upstream_headers(client_headers: &HeaderMap, cfg: &ServerConfig) -> HeaderMap {
	let mut out = HeaderMap::new();
	for name in PASSTHROUGH_REQUEST {
		for value in client_headers.get_all(*name) {
			out.append(HeaderName::from_static(name), value.clone());
		}
	}
	// Configured headers win over client-provided ones.
	for (k, v) in &cfg.headers {
		if let (Ok(name), Ok(value)) = (k.parse::<HeaderName>(), v.parse::<HeaderValue>()) {
			out.insert(name, value);
		}
	}
	out
}

/// Copy upstream response headers, dropping hop-by-hop ones and the content
/// length (recomputed after the body is re-framed).
fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in upstream {
		let n = name.as_str();
		if HOP_BY_HOP.contains(&n) || n == "content-length" {
			continue;
		}
		out.append(name.clone(), value.clone());
	}
	out
}

async fn handle_post(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
	req: Request,
) -> Response {
	let cfg = match lookup_server(&gateway, &name).await {
		Ok(cfg) => cfg,
		Err(resp) => return resp,
	};
	let ctx = http_context(&req);
	let session = session_of(req.headers());
	let client_headers = req.headers().clone();
	let body = match axum::body::to_bytes(req.into_body(), MAX_BODY).await {
		Ok(body) => body,
		Err(e) => {
			return plain_error(StatusCode::BAD_REQUEST, "InvalidBody", &e.to_string());
		},
	};
	let is_single = !body.trim_ascii_start().starts_with(b"[");
	let messages = match jsonrpc::parse_payload(&body) {
		Ok(messages) => messages,
		Err(e) => {
			return jsonrpc_error(
				StatusCode::BAD_REQUEST,
				jsonrpc::error_response(&None, e.code(), &e.to_string(), None),
			);
		},
	};

	// Track and capture before forwarding; wire order is capture order.
	for message in &messages {
		if let JsonRpcMessage::Request(request) = message {
			if let Some(id) = &request.id {
				gateway
					.tracker
					.track_request(PendingKey::new(&cfg.name, &session, id), &request.method);
			}
			gateway
				.capture
				.append_request(&cfg.name, &session, request, &ctx)
				.await;
		}
	}

	let client = match gateway.clients.get(&cfg.name) {
		Ok(client) => client,
		Err(e) => {
			error!(server_name = %cfg.name, "failed to build upstream client: {e}");
			return plain_error(
				StatusCode::INTERNAL_SERVER_ERROR,
				"ClientError",
				"failed to build upstream client",
			);
		},
	};
	let result = client
		.post(&cfg.url)
		.headers(upstream_headers(&client_headers, &cfg))
		.body(body.clone())
		.send()
		.await;
	let upstream = match result {
		Ok(upstream) => upstream,
		Err(e) => {
			return upstream_failure(&gateway, &cfg, &session, &messages, is_single, &e.to_string())
				.await;
		},
	};
	relay(gateway, cfg, session, ctx, upstream).await
}

async fn handle_get(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
	req: Request,
) -> Response {
	let cfg = match lookup_server(&gateway, &name).await {
		Ok(cfg) => cfg,
		Err(resp) => return resp,
	};
	let ctx = http_context(&req);
	let session = session_of(req.headers());
	let client = match gateway.clients.get(&cfg.name) {
		Ok(client) => client,
		Err(e) => {
			error!(server_name = %cfg.name, "failed to build upstream client: {e}");
			return plain_error(
				StatusCode::INTERNAL_SERVER_ERROR,
				"ClientError",
				"failed to build upstream client",
			);
		},
	};
	let result = client
		.get(&cfg.url)
		.headers(upstream_headers(req.headers(), &cfg))
		.send()
		.await;
	match result {
		Ok(upstream) => relay(gateway, cfg, session, ctx, upstream).await,
		Err(e) => {
			warn!(server_name = %cfg.name, "upstream subscribe failed: {e}");
			// The subscription never opened; note the failure the same way a
			// mid-stream drop is noted.
			let event = SseEvent {
				event: Some("gateway-error".to_string()),
				data: Some(e.to_string()),
				..Default::default()
			};
			gateway
				.capture
				.sse_event(&cfg.name, &session, &event, &ctx)
				.await;
			plain_error(StatusCode::BAD_GATEWAY, "UpstreamError", &e.to_string())
		},
	}
}

/// Session teardown. Forwarded transparently; the cached identity for the
/// session is dropped either way.
async fn handle_delete(
	State(gateway): State<Arc<Gateway>>,
	Path(name): Path<String>,
	req: Request,
) -> Response {
	let cfg = match lookup_server(&gateway, &name).await {
		Ok(cfg) => cfg,
		Err(resp) => return resp,
	};
	let session = session_of(req.headers());
	if session != STATELESS_SESSION {
		gateway.client_info.clear(&session);
		gateway.server_info.clear(&session);
	}
	let client = match gateway.clients.get(&cfg.name) {
		Ok(client) => client,
		Err(e) => {
			error!(server_name = %cfg.name, "failed to build upstream client: {e}");
			return plain_error(
				StatusCode::INTERNAL_SERVER_ERROR,
				"ClientError",
				"failed to build upstream client",
			);
		},
	};
	let result = client
		.delete(&cfg.url)
		.headers(upstream_headers(req.headers(), &cfg))
		.send()
		.await;
	match result {
		Ok(upstream) => {
			let status = upstream.status();
			let headers = upstream.headers().clone();
			let body = upstream.bytes().await.unwrap_or_default();
			let mut builder = http::Response::builder().status(status);
			*builder.headers_mut().expect("valid builder") = relay_headers(&headers);
			builder.body(Body::from(body)).expect("valid response")
		},
		Err(e) => plain_error(StatusCode::BAD_GATEWAY, "UpstreamError", &e.to_string()),
	}
}

/// Synthesize `-32000` envelopes for every request in the failed payload and
/// record them. Notifications get captured but produce no envelope.
async fn upstream_failure(
	gateway: &Gateway,
	cfg: &ServerConfig,
	session: &str,
	messages: &[JsonRpcMessage],
	is_single: bool,
	cause: &str,
) -> Response {
	let mut envelopes = Vec::new();
	for message in messages {
		let JsonRpcMessage::Request(request) = message else {
			continue;
		};
		let duration_ms = match &request.id {
			Some(id) => gateway
				.tracker
				.calculate_duration(&PendingKey::new(&cfg.name, session, id)),
			None => 0,
		};
		gateway
			.capture
			.capture_error_response(&cfg.name, session, request, cause, 502, duration_ms)
			.await;
		if request.id.is_some() {
			envelopes.push(jsonrpc::error_response(
				&request.id,
				UPSTREAM_ERROR,
				"upstream error",
				Some(json!({ "cause": cause })),
			));
		}
	}
	let body = if is_single {
		envelopes.pop().unwrap_or_else(|| {
			jsonrpc::error_response(
				&None,
				UPSTREAM_ERROR,
				"upstream error",
				Some(json!({ "cause": cause })),
			)
		})
	} else {
		Value::Array(envelopes)
	};
	jsonrpc_error(StatusCode::BAD_GATEWAY, body)
}

async fn relay(
	gateway: Arc<Gateway>,
	cfg: ServerConfig,
	session: String,
	ctx: HttpContext,
	upstream: reqwest::Response,
) -> Response {
	let status = upstream.status();
	let headers = upstream.headers().clone();

	// The upstream may assign a session on the response; migrate the cached
	// identity so later requests on the new id still resolve it.
	if let Some(new_session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
		&& new_session != session
	{
		gateway.migrate_session(&session, new_session).await;
	}

	let is_sse = headers
		.get(CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|ct| ct.starts_with(EVENT_STREAM));
	if is_sse {
		return relay_sse(gateway, cfg, session, ctx, status, headers, upstream);
	}

	let body = match upstream.bytes().await {
		Ok(body) => body,
		Err(e) => {
			warn!(server_name = %cfg.name, "failed to read upstream body: {e}");
			return plain_error(StatusCode::BAD_GATEWAY, "UpstreamError", &e.to_string());
		},
	};
	// Non-JSON-RPC bodies relay untouched; they are simply not captured.
	if let Ok(messages) = jsonrpc::parse_payload(&body) {
		for message in messages {
			if let JsonRpcMessage::Response(response) = message {
				gateway
					.capture
					.append_response(&cfg.name, &session, &response, status.as_u16(), &ctx)
					.await;
			}
		}
	}

	let mut builder = http::Response::builder().status(status);
	*builder.headers_mut().expect("valid builder") = relay_headers(&headers);
	builder
		.body(Body::from(body))
		.expect("valid response")
}

/// Streaming pass-through: the client sees the upstream bytes verbatim while
/// a bounded per-connection task feeds the same bytes to the SSE parser. The
/// upstream read waits on the slower of the two sinks; a dead capture task
/// only disables capture, never forwarding.
fn relay_sse(
	gateway: Arc<Gateway>,
	cfg: ServerConfig,
	session: String,
	ctx: HttpContext,
	status: StatusCode,
	headers: HeaderMap,
	upstream: reqwest::Response,
) -> Response {
	let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(64);
	{
		let capture = gateway.capture.clone();
		let server_name = cfg.name.clone();
		let session = session.clone();
		let ctx = ctx.clone();
		gateway.tasks.spawn(async move {
			let mut codec = SseCodec::new();
			let mut buf = BytesMut::new();
			while let Some(chunk) = rx.recv().await {
				buf.extend_from_slice(&chunk);
				while let Ok(Some(event)) = codec.decode(&mut buf) {
					dispatch_event(&capture, &server_name, &session, &ctx, event).await;
				}
			}
			if let Ok(Some(event)) = codec.decode_eof(&mut buf) {
				dispatch_event(&capture, &server_name, &session, &ctx, event).await;
			}
		});
	}

	let mut upstream_body = upstream.bytes_stream();
	let capture = gateway.capture.clone();
	let server_name = cfg.name.clone();
	let stream_session = session.clone();
	let stream = async_stream::stream! {
		while let Some(chunk) = upstream_body.next().await {
			match chunk {
				Ok(bytes) => {
					// Tee to capture; if that side is gone, keep forwarding.
					let _ = tx.send(bytes.clone()).await;
					yield Ok::<Bytes, std::io::Error>(bytes);
				},
				Err(e) => {
					warn!(server_name = %server_name, "upstream stream failed: {e}");
					let event = SseEvent {
						event: Some("gateway-error".to_string()),
						data: Some(e.to_string()),
						..Default::default()
					};
					capture.sse_event(&server_name, &stream_session, &event, &ctx).await;
					yield Err(std::io::Error::other(e));
					break;
				},
			}
		}
	};

	let mut builder = http::Response::builder().status(status);
	*builder.headers_mut().expect("valid builder") = relay_headers(&headers);
	let mut response = builder
		.body(Body::from_stream(stream))
		.expect("valid response");
	// A 401 means the client is about to run OAuth discovery against the
	// gateway root; the cookie routes those hits back to this server.
	if status == StatusCode::UNAUTHORIZED
		&& let Ok(value) = HeaderValue::from_str(&server_cookie(&cfg.name))
	{
		response.headers_mut().append(SET_COOKIE, value);
	}
	response
}

async fn dispatch_event(
	capture: &CaptureEngine,
	server_name: &str,
	session: &str,
	ctx: &HttpContext,
	event: SseEvent,
) {
	match event.json_rpc_frames() {
		Some(frames) => {
			for frame in &frames {
				capture
					.sse_json_rpc(server_name, session, frame, &event, ctx)
					.await;
			}
		},
		None => capture.sse_event(server_name, session, &event, ctx).await,
	}
}

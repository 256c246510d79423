use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::parse::sse::SseEvent;
use crate::sessions::SessionStore;
use crate::storage::Storage;
use crate::track::{PendingKey, RequestTracker};
use crate::types::capture::{CaptureMetadata, CaptureRecord, Direction, PeerInfo};
use crate::types::jsonrpc::{
	JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, UPSTREAM_ERROR, error_response,
};
use crate::*;

/// Request-scoped HTTP details attached to capture metadata.
#[derive(Clone, Debug, Default)]
pub struct HttpContext {
	pub user_agent: Option<String>,
	pub client_ip: Option<String>,
}

/// Builds capture records and writes them. Every operation is best-effort:
/// the proxy must never fail because telemetry failed.
#[derive(Debug)]
pub struct CaptureEngine {
	storage: Arc<Storage>,
	tracker: Arc<RequestTracker>,
	client_info: Arc<SessionStore>,
	server_info: Arc<SessionStore>,
}

impl CaptureEngine {
	pub fn new(
		storage: Arc<Storage>,
		tracker: Arc<RequestTracker>,
		client_info: Arc<SessionStore>,
		server_info: Arc<SessionStore>,
	) -> CaptureEngine {
		CaptureEngine {
			storage,
			tracker,
			client_info,
			server_info,
		}
	}

	/// Record an inbound request (or notification). An `initialize` request
	/// also seeds the session's client identity.
	pub async fn append_request(
		&self,
		server_name: &str,
		session_id: &str,
		request: &JsonRpcRequest,
		ctx: &HttpContext,
	) {
		if request.method == "initialize"
			&& let Some(info) = extract_peer(request.params(), "clientInfo")
		{
			self.client_info.store(session_id, info);
		}
		let record = CaptureRecord {
			timestamp: Utc::now(),
			method: request.method.clone(),
			id: request.id.clone(),
			direction: Direction::Request,
			metadata: CaptureMetadata {
				server_name: server_name.to_string(),
				session_id: session_id.to_string(),
				duration_ms: 0,
				http_status: 200,
				client: self.client_info.get(session_id).await,
				server: self.server_info.get(session_id).await,
				user_agent: ctx.user_agent.clone(),
				client_ip: ctx.client_ip.clone(),
				method_detail: method_detail(request),
				..Default::default()
			},
			request: Some(request.raw.clone()),
			response: None,
			sse_event: None,
		};
		self.write(record).await;
	}

	/// Record a unary response, computing its duration from the tracker.
	pub async fn append_response(
		&self,
		server_name: &str,
		session_id: &str,
		response: &JsonRpcResponse,
		http_status: u16,
		ctx: &HttpContext,
	) {
		let (method, duration_ms) = self
			.resolve_response(server_name, session_id, response)
			.await;
		let record = CaptureRecord {
			timestamp: Utc::now(),
			method,
			id: response.id.clone(),
			direction: Direction::Response,
			metadata: CaptureMetadata {
				server_name: server_name.to_string(),
				session_id: session_id.to_string(),
				duration_ms,
				http_status,
				client: self.client_info.get(session_id).await,
				server: self.server_info.get(session_id).await,
				user_agent: ctx.user_agent.clone(),
				client_ip: ctx.client_ip.clone(),
				..Default::default()
			},
			request: None,
			response: Some(response.raw.clone()),
			sse_event: None,
		};
		self.write(record).await;
	}

	/// Synthesize and record an error response for a request that failed in
	/// transit. Notifications never receive responses, so they are skipped.
	pub async fn capture_error_response(
		&self,
		server_name: &str,
		session_id: &str,
		request: &JsonRpcRequest,
		error: &str,
		http_status: u16,
		duration_ms: u64,
	) {
		if request.id.is_none() {
			return;
		}
		let body = error_response(
			&request.id,
			UPSTREAM_ERROR,
			"upstream error",
			Some(serde_json::json!({ "cause": error })),
		);
		let record = CaptureRecord {
			timestamp: Utc::now(),
			method: request.method.clone(),
			id: request.id.clone(),
			direction: Direction::Response,
			metadata: CaptureMetadata {
				server_name: server_name.to_string(),
				session_id: session_id.to_string(),
				duration_ms,
				http_status,
				client: self.client_info.get(session_id).await,
				server: self.server_info.get(session_id).await,
				..Default::default()
			},
			request: None,
			response: Some(body),
			sse_event: None,
		};
		self.write(record).await;
	}

	/// Record a raw SSE event (no JSON-RPC payload recognized).
	pub async fn sse_event(
		&self,
		server_name: &str,
		session_id: &str,
		event: &SseEvent,
		ctx: &HttpContext,
	) {
		let record = CaptureRecord {
			timestamp: Utc::now(),
			method: event
				.event
				.clone()
				.unwrap_or_else(|| "message".to_string()),
			id: None,
			direction: Direction::SseEvent,
			metadata: CaptureMetadata {
				server_name: server_name.to_string(),
				session_id: session_id.to_string(),
				duration_ms: 0,
				http_status: 200,
				user_agent: ctx.user_agent.clone(),
				client_ip: ctx.client_ip.clone(),
				sse_event_id: event.id.clone(),
				sse_event_type: event.event.clone(),
				..Default::default()
			},
			request: None,
			response: None,
			sse_event: serde_json::to_value(event).ok(),
		};
		self.write(record).await;
	}

	/// Record a JSON-RPC frame extracted from an SSE stream. Response frames
	/// are correlated through the tracker exactly like unary responses.
	pub async fn sse_json_rpc(
		&self,
		server_name: &str,
		session_id: &str,
		message: &JsonRpcMessage,
		event: &SseEvent,
		ctx: &HttpContext,
	) {
		let (method, id, duration_ms, request, response) = match message {
			JsonRpcMessage::Request(r) => (
				r.method.clone(),
				r.id.clone(),
				0,
				Some(r.raw.clone()),
				None,
			),
			JsonRpcMessage::Response(r) => {
				let (method, duration_ms) = self.resolve_response(server_name, session_id, r).await;
				(method, r.id.clone(), duration_ms, None, Some(r.raw.clone()))
			},
		};
		let record = CaptureRecord {
			timestamp: Utc::now(),
			method,
			id,
			direction: Direction::SseJsonrpc,
			metadata: CaptureMetadata {
				server_name: server_name.to_string(),
				session_id: session_id.to_string(),
				duration_ms,
				http_status: 200,
				client: self.client_info.get(session_id).await,
				server: self.server_info.get(session_id).await,
				user_agent: ctx.user_agent.clone(),
				client_ip: ctx.client_ip.clone(),
				sse_event_id: event.id.clone(),
				sse_event_type: event.event.clone(),
				..Default::default()
			},
			request,
			response,
			// The enclosing frame, minus the payload already stored above.
			sse_event: serde_json::to_value(SseEvent {
				data: None,
				..event.clone()
			})
			.ok()
			.filter(|v| v.as_object().is_some_and(|o| !o.is_empty())),
		};
		self.write(record).await;
	}

	/// Shared response-side bookkeeping: duration lookup, and the
	/// `initialize` backfill once the upstream reveals its identity.
	async fn resolve_response(
		&self,
		server_name: &str,
		session_id: &str,
		response: &JsonRpcResponse,
	) -> (String, u64) {
		let Some(id) = &response.id else {
			return ("unknown".to_string(), 0);
		};
		let key = PendingKey::new(server_name, session_id, id);
		let method = self.tracker.get_method(&key);
		let duration_ms = self.tracker.calculate_duration(&key);
		let method = method.unwrap_or_else(|| "unknown".to_string());
		if method == "initialize"
			&& let Some(info) = extract_peer(response.result(), "serverInfo")
		{
			self.server_info.store(session_id, info.clone());
			if let Err(e) = self
				.storage
				.update_server_info_for_initialize_request(server_name, session_id, id, &info)
				.await
			{
				error!(server_name, "failed to backfill server info: {e}");
			}
		}
		(method, duration_ms)
	}

	async fn write(&self, record: CaptureRecord) {
		if let Err(e) = self.storage.write(&record).await {
			error!(
				server_name = %record.metadata.server_name,
				direction = record.direction.as_str(),
				"failed to persist capture record: {e}"
			);
		}
	}
}

/// Pull `clientInfo`/`serverInfo` out of a handshake payload. Values that do
/// not match the schema are discarded, not trusted.
fn extract_peer(container: Option<&Value>, field: &str) -> Option<PeerInfo> {
	let raw = container?.get(field)?;
	match serde_json::from_value::<PeerInfo>(raw.clone()) {
		Ok(info) => Some(info),
		Err(e) => {
			debug!("discarding malformed {field}: {e}");
			None
		},
	}
}

fn method_detail(request: &JsonRpcRequest) -> Option<String> {
	let params = request.params()?;
	let detail = match request.method.as_str() {
		"tools/call" | "prompts/get" => params.get("name")?.as_str()?,
		"resources/read" => params.get("uri")?.as_str()?,
		_ => return None,
	};
	Some(detail.to_string())
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::jsonrpc::RequestId;

/// The sentinel session for traffic observed before an `Mcp-Session-Id` is
/// assigned by the upstream.
pub const STATELESS_SESSION: &str = "stateless";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
	Request,
	Response,
	SseEvent,
	SseJsonrpc,
}

impl Direction {
	pub fn as_str(&self) -> &'static str {
		match self {
			Direction::Request => "request",
			Direction::Response => "response",
			Direction::SseEvent => "sse-event",
			Direction::SseJsonrpc => "sse-jsonrpc",
		}
	}
}

impl std::str::FromStr for Direction {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"request" => Ok(Direction::Request),
			"response" => Ok(Direction::Response),
			"sse-event" => Ok(Direction::SseEvent),
			"sse-jsonrpc" => Ok(Direction::SseJsonrpc),
			other => Err(format!("unknown direction {other:?}")),
		}
	}
}

/// Client or server identity, as revealed by the MCP `initialize` handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
	pub name: String,
	pub version: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
	pub server_name: String,
	pub session_id: String,
	/// 0 means "not measured" (notification, or a response whose request was
	/// never tracked).
	pub duration_ms: u64,
	pub http_status: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client: Option<PeerInfo>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub server: Option<PeerInfo>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_agent: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_ip: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sse_event_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sse_event_type: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub input_tokens: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output_tokens: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub method_detail: Option<String>,
}

/// One observed message: a request, response, raw SSE event, or SSE-embedded
/// JSON-RPC frame. Append-only once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
	pub timestamp: DateTime<Utc>,
	pub method: String,
	#[serde(default)]
	pub id: Option<RequestId>,
	pub direction: Direction,
	pub metadata: CaptureMetadata,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sse_event: Option<Value>,
}

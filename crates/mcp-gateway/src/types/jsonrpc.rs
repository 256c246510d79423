use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used by the gateway itself. Upstream-originated codes
/// pass through untouched.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const UPSTREAM_ERROR: i64 = -32000;

#[derive(Error, Debug)]
pub enum ParseError {
	#[error("invalid JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("message must be a JSON object")]
	NotAnObject,
	#[error("jsonrpc field must be \"2.0\"")]
	Version,
	#[error("method must be a string")]
	MethodType,
	#[error("id must be a string, number, or null")]
	IdType,
	#[error("response must carry exactly one of result or error")]
	ResultXorError,
	#[error("response must carry an id")]
	MissingId,
	#[error("error member must be {{code:int, message:string}}")]
	ErrorShape,
	#[error("message carries neither method nor result/error")]
	NotAMessage,
	#[error("batch must not be empty")]
	EmptyBatch,
}

impl ParseError {
	/// The JSON-RPC error code a gateway-synthesized envelope should carry for
	/// this failure.
	pub fn code(&self) -> i64 {
		match self {
			ParseError::Json(_) => PARSE_ERROR,
			_ => INVALID_REQUEST,
		}
	}
}

/// A JSON-RPC request id. Absent and `null` ids are modeled as
/// `Option<RequestId>` by the containing message (both mean "notification" on
/// requests).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	Number(i64),
	String(String),
}

impl Display for RequestId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RequestId::Number(n) => write!(f, "{n}"),
			RequestId::String(s) => write!(f, "{s}"),
		}
	}
}

impl RequestId {
	fn from_value(v: &Value) -> Result<Option<RequestId>, ParseError> {
		match v {
			Value::Null => Ok(None),
			Value::Number(n) => n
				.as_i64()
				.map(|n| Some(RequestId::Number(n)))
				.ok_or(ParseError::IdType),
			Value::String(s) => Ok(Some(RequestId::String(s.clone()))),
			_ => Err(ParseError::IdType),
		}
	}

	pub fn to_value(id: &Option<RequestId>) -> Value {
		match id {
			None => Value::Null,
			Some(RequestId::Number(n)) => json!(n),
			Some(RequestId::String(s)) => json!(s),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
	pub code: i64,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

/// A validated inbound request (or notification, when `id` is None).
/// `raw` is the original object, forwarded and captured verbatim.
#[derive(Clone, Debug)]
pub struct JsonRpcRequest {
	pub method: String,
	pub id: Option<RequestId>,
	pub raw: Value,
}

impl JsonRpcRequest {
	pub fn is_notification(&self) -> bool {
		self.id.is_none()
	}

	pub fn params(&self) -> Option<&Value> {
		self.raw.get("params")
	}
}

/// A validated response. `result` stays inside `raw`; only the pieces the
/// capture pipeline inspects are lifted out.
#[derive(Clone, Debug)]
pub struct JsonRpcResponse {
	pub id: Option<RequestId>,
	pub error: Option<JsonRpcError>,
	pub raw: Value,
}

impl JsonRpcResponse {
	pub fn is_error(&self) -> bool {
		self.error.is_some()
	}

	pub fn result(&self) -> Option<&Value> {
		self.raw.get("result")
	}
}

#[derive(Clone, Debug)]
pub enum JsonRpcMessage {
	Request(JsonRpcRequest),
	Response(JsonRpcResponse),
}

impl JsonRpcMessage {
	pub fn raw(&self) -> &Value {
		match self {
			JsonRpcMessage::Request(r) => &r.raw,
			JsonRpcMessage::Response(r) => &r.raw,
		}
	}

	pub fn id(&self) -> Option<&RequestId> {
		match self {
			JsonRpcMessage::Request(r) => r.id.as_ref(),
			JsonRpcMessage::Response(r) => r.id.as_ref(),
		}
	}

	/// Validate a single JSON value as a JSON-RPC 2.0 message. A message is a
	/// request iff it has a `method` field; otherwise it must be a response
	/// with an `id` and exactly one of `result`/`error`.
	pub fn from_value(v: Value) -> Result<JsonRpcMessage, ParseError> {
		let Value::Object(obj) = &v else {
			return Err(ParseError::NotAnObject);
		};
		if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
			return Err(ParseError::Version);
		}
		if let Some(method) = obj.get("method") {
			let Some(method) = method.as_str() else {
				return Err(ParseError::MethodType);
			};
			let id = match obj.get("id") {
				None => None,
				Some(idv) => RequestId::from_value(idv)?,
			};
			return Ok(JsonRpcMessage::Request(JsonRpcRequest {
				method: method.to_string(),
				id,
				raw: v,
			}));
		}
		let has_result = obj.contains_key("result");
		let error = match obj.get("error") {
			None => None,
			Some(e) => Some(parse_error_member(e)?),
		};
		if !has_result && error.is_none() {
			return Err(ParseError::NotAMessage);
		}
		if has_result && error.is_some() {
			return Err(ParseError::ResultXorError);
		}
		let Some(idv) = obj.get("id") else {
			return Err(ParseError::MissingId);
		};
		let id = RequestId::from_value(idv)?;
		Ok(JsonRpcMessage::Response(JsonRpcResponse {
			id,
			error,
			raw: v,
		}))
	}
}

fn parse_error_member(v: &Value) -> Result<JsonRpcError, ParseError> {
	let Value::Object(obj) = v else {
		return Err(ParseError::ErrorShape);
	};
	let Some(code) = obj.get("code").and_then(Value::as_i64) else {
		return Err(ParseError::ErrorShape);
	};
	let Some(message) = obj.get("message").and_then(Value::as_str) else {
		return Err(ParseError::ErrorShape);
	};
	Ok(JsonRpcError {
		code,
		message: message.to_string(),
		data: obj.get("data").cloned(),
	})
}

/// Parse a proxied body as a single message or a batch. The returned list
/// preserves wire order.
pub fn parse_payload(bytes: &[u8]) -> Result<Vec<JsonRpcMessage>, ParseError> {
	let v: Value = serde_json::from_slice(bytes)?;
	match v {
		Value::Array(items) => {
			if items.is_empty() {
				return Err(ParseError::EmptyBatch);
			}
			items.into_iter().map(JsonRpcMessage::from_value).collect()
		},
		other => Ok(vec![JsonRpcMessage::from_value(other)?]),
	}
}

/// Build a gateway-synthesized error response envelope.
pub fn error_response(
	id: &Option<RequestId>,
	code: i64,
	message: &str,
	data: Option<Value>,
) -> Value {
	let mut error = Map::new();
	error.insert("code".to_string(), json!(code));
	error.insert("message".to_string(), json!(message));
	if let Some(data) = data {
		error.insert("data".to_string(), data);
	}
	json!({
		"jsonrpc": JSONRPC_VERSION,
		"id": RequestId::to_value(id),
		"error": Value::Object(error),
	})
}

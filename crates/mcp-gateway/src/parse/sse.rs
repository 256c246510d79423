use std::fmt::Write;

use bytes::BytesMut;
use serde::Serialize;
use tokio_util::codec::Decoder;

use crate::types::jsonrpc::JsonRpcMessage;

/// One Server-Sent Event. `data` joins multiple `data:` lines with `\n`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SseEvent {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub event: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub retry: Option<u64>,
}

impl SseEvent {
	fn is_empty(&self) -> bool {
		self.id.is_none() && self.event.is_none() && self.data.is_none() && self.retry.is_none()
	}

	/// Re-serialize to wire form. Parsing the output yields this event back.
	pub fn to_wire(&self) -> String {
		let mut out = String::new();
		if let Some(event) = &self.event {
			let _ = writeln!(out, "event: {event}");
		}
		if let Some(id) = &self.id {
			let _ = writeln!(out, "id: {id}");
		}
		if let Some(retry) = self.retry {
			let _ = writeln!(out, "retry: {retry}");
		}
		if let Some(data) = &self.data {
			for line in data.split('\n') {
				let _ = writeln!(out, "data: {line}");
			}
		}
		out.push('\n');
		out
	}

	/// A `data` payload that looks like JSON is attempted as JSON-RPC. A JSON
	/// array must parse as a whole batch to be surfaced; anything else stays a
	/// raw SSE event.
	pub fn json_rpc_frames(&self) -> Option<Vec<JsonRpcMessage>> {
		let data = self.data.as_deref()?.trim_start();
		if !data.starts_with('{') && !data.starts_with('[') {
			return None;
		}
		let value: serde_json::Value = serde_json::from_str(data).ok()?;
		match value {
			serde_json::Value::Array(items) => items
				.into_iter()
				.map(|v| JsonRpcMessage::from_value(v).ok())
				.collect(),
			other => Some(vec![JsonRpcMessage::from_value(other).ok()?]),
		}
	}
}

/// Incremental SSE frame decoder. Events terminate on a blank line; leftover
/// bytes stay in the buffer between calls, so arbitrarily-chunked TCP input
/// decodes to the same event sequence.
#[derive(Debug, Default)]
pub struct SseCodec {
	// Resume point for the terminator scan; avoids rescanning the whole
	// buffer on every partial chunk.
	scanned: usize,
}

impl SseCodec {
	pub fn new() -> SseCodec {
		SseCodec::default()
	}
}

impl Decoder for SseCodec {
	type Item = SseEvent;
	type Error = std::io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseEvent>, Self::Error> {
		loop {
			let Some(end) = find_event_end(&src[..], &mut self.scanned) else {
				return Ok(None);
			};
			let frame = src.split_to(end);
			self.scanned = 0;
			// Comment-only frames parse to nothing; keep scanning.
			if let Some(event) = parse_event(&frame) {
				return Ok(Some(event));
			}
		}
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<SseEvent>, Self::Error> {
		match self.decode(buf)? {
			Some(event) => Ok(Some(event)),
			None => {
				// An unterminated trailing event is discarded, per SSE.
				buf.clear();
				self.scanned = 0;
				Ok(None)
			},
		}
	}
}

/// Find the end (exclusive, including the terminator) of the first complete
/// event: a `\n` followed by an optional `\r` and another `\n`.
fn find_event_end(buf: &[u8], scanned: &mut usize) -> Option<usize> {
	let mut i = *scanned;
	while i < buf.len() {
		if buf[i] == b'\n' {
			let mut j = i + 1;
			if j < buf.len() && buf[j] == b'\r' {
				j += 1;
			}
			if j < buf.len() && buf[j] == b'\n' {
				return Some(j + 1);
			}
		}
		i += 1;
	}
	// The terminator may straddle the chunk boundary; keep the last bytes
	// rescannable.
	*scanned = buf.len().saturating_sub(2);
	None
}

fn parse_event(frame: &[u8]) -> Option<SseEvent> {
	let mut event = SseEvent::default();
	let mut data_lines: Vec<&str> = Vec::new();
	let text = String::from_utf8_lossy(frame);
	for line in text.split('\n') {
		let line = line.strip_suffix('\r').unwrap_or(line);
		if line.is_empty() || line.starts_with(':') {
			continue;
		}
		let (field, value) = match line.split_once(':') {
			Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
			None => (line, ""),
		};
		match field {
			"data" => data_lines.push(value),
			"event" => event.event = Some(value.to_string()),
			"id" => event.id = Some(value.to_string()),
			"retry" => {
				if let Ok(ms) = value.parse::<u64>() {
					event.retry = Some(ms);
				}
			},
			_ => {},
		}
	}
	if !data_lines.is_empty() {
		event.data = Some(data_lines.join("\n"));
	}
	if event.is_empty() { None } else { Some(event) }
}

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-z0-9_-]+$").expect("valid regex"));

#[derive(Error, Debug, PartialEq)]
pub enum InvalidServer {
	#[error("invalid server name {0:?}: must match [a-z0-9_-]+")]
	Name(String),
	#[error("invalid server url {0:?}: {1}")]
	Url(String, String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
	#[default]
	Http,
}

/// A registered upstream MCP server. `headers` may contain secrets and must
/// never appear on aggregate read paths.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
	pub name: String,
	pub url: String,
	#[serde(default, rename = "type")]
	pub server_type: ServerType,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub headers: BTreeMap<String, String>,
}

impl ServerConfig {
	/// Normalize and validate; persisted fields are the normalized ones.
	pub fn normalized(self) -> Result<ServerConfig, InvalidServer> {
		Ok(ServerConfig {
			name: normalize_name(&self.name)?,
			url: normalize_url(&self.url)?,
			server_type: self.server_type,
			headers: self.headers,
		})
	}
}

/// Lowercase, trim, and validate a server name.
pub fn normalize_name(raw: &str) -> Result<String, InvalidServer> {
	let name = raw.trim().to_lowercase();
	if !NAME_RE.is_match(&name) {
		return Err(InvalidServer::Name(raw.to_string()));
	}
	Ok(name)
}

/// Require an absolute http(s) URL; the trailing slash is stripped.
pub fn normalize_url(raw: &str) -> Result<String, InvalidServer> {
	let url =
		url::Url::parse(raw.trim()).map_err(|e| InvalidServer::Url(raw.to_string(), e.to_string()))?;
	match url.scheme() {
		"http" | "https" => {},
		other => {
			return Err(InvalidServer::Url(
				raw.to_string(),
				format!("unsupported scheme {other:?}"),
			));
		},
	}
	Ok(url.as_str().trim_end_matches('/').to_string())
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod capture;
pub mod client;
pub mod gateway;
pub mod health;
pub mod management;
pub mod oauth;
pub mod parse;
pub mod proxy;
pub mod sessions;
pub mod storage;
pub mod telemetry;
pub mod track;
pub mod types;

// Shared across the whole crate via `use crate::*`.
pub use tracing::{debug, error, info, trace, warn};

pub mod defaults {
	use std::time::Duration;

	pub const PORT: u16 = 3333;
	pub const STORAGE_DIR: &str = "~/.mcp-gateway/captures";

	pub fn health_check_interval() -> Duration {
		Duration::from_secs(30)
	}
	pub fn probe_timeout() -> Duration {
		Duration::from_secs(5)
	}
	pub fn shutdown_grace() -> Duration {
		Duration::from_secs(5)
	}
}

/// RawConfig represents the inputs a user can pass in (flags, environment, or a
/// config file). Config is the validated internal representation of this.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	pub port: Option<u16>,
	pub storage_dir: Option<String>,
	pub log_level: Option<String>,
	pub token: Option<String>,
	pub health_check_interval_ms: Option<u64>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub bind: SocketAddr,
	pub storage_dir: PathBuf,
	pub log_level: String,
	/// Management plane bearer token. When None, the app generates one at
	/// startup and prints it.
	#[serde(skip_serializing)]
	pub token: Option<String>,
	#[serde(skip_serializing)]
	pub health_check_interval: Duration,
	#[serde(skip_serializing)]
	pub probe_timeout: Duration,
	#[serde(skip_serializing)]
	pub shutdown_grace: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("invalid storage dir {0:?}: {1}")]
	StorageDir(String, String),
	#[error("invalid log level {0:?}")]
	LogLevel(String),
}

impl Config {
	pub fn from_raw(raw: RawConfig) -> Result<Config, ConfigError> {
		let port = raw.port.unwrap_or(defaults::PORT);
		let storage_dir = raw
			.storage_dir
			.unwrap_or_else(|| defaults::STORAGE_DIR.to_string());
		let storage_dir = shellexpand::tilde(&storage_dir).to_string();
		if storage_dir.is_empty() {
			return Err(ConfigError::StorageDir(
				storage_dir,
				"must not be empty".to_string(),
			));
		}
		let log_level = raw.log_level.unwrap_or_else(|| "info".to_string());
		if !matches!(log_level.as_str(), "debug" | "info" | "warn" | "error") {
			return Err(ConfigError::LogLevel(log_level));
		}
		Ok(Config {
			bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
			storage_dir: PathBuf::from(storage_dir),
			log_level,
			token: raw.token,
			health_check_interval: raw
				.health_check_interval_ms
				.map(Duration::from_millis)
				.unwrap_or_else(defaults::health_check_interval),
			probe_timeout: defaults::probe_timeout(),
			shutdown_grace: defaults::shutdown_grace(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn config_defaults() {
		let c = Config::from_raw(RawConfig::default()).unwrap();
		assert_eq!(c.bind.port(), 3333);
		assert_eq!(c.log_level, "info");
		assert!(c.storage_dir.ends_with(".mcp-gateway/captures"));
	}

	#[test]
	fn config_rejects_unknown_level() {
		let raw = RawConfig {
			log_level: Some("verbose".to_string()),
			..Default::default()
		};
		assert!(matches!(
			Config::from_raw(raw),
			Err(ConfigError::LogLevel(_))
		));
	}
}

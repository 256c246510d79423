use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;

use crate::types::capture::{
	CaptureMetadata, CaptureRecord, Direction, PeerInfo, STATELESS_SESSION,
};
use crate::types::jsonrpc::RequestId;
use crate::types::registry::{ServerConfig, ServerType, normalize_url};
use crate::*;

mod import;

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;

const DB_FILE: &str = "captures.db";

/// Forward-only migrations; `PRAGMA user_version` tracks the applied count.
const MIGRATIONS: &[&str] = &[
	r#"
CREATE TABLE IF NOT EXISTS logs (
	timestamp TEXT NOT NULL,
	server_name TEXT NOT NULL,
	session_id TEXT NOT NULL,
	method TEXT NOT NULL,
	direction TEXT NOT NULL,
	id TEXT,
	client_name TEXT,
	client_version TEXT,
	user_agent TEXT,
	client_ip TEXT,
	http_status INTEGER NOT NULL DEFAULT 200,
	duration_ms INTEGER NOT NULL DEFAULT 0,
	input_tokens INTEGER,
	output_tokens INTEGER,
	method_detail TEXT,
	request_json TEXT,
	response_json TEXT,
	sse_event_json TEXT,
	client_json TEXT,
	server_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_server_ts ON logs(server_name, timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_session_ts ON logs(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_method ON logs(method);
CREATE INDEX IF NOT EXISTS idx_logs_ts ON logs(timestamp);
CREATE TABLE IF NOT EXISTS sessions (
	session_id TEXT PRIMARY KEY,
	server_name TEXT NOT NULL,
	client_json TEXT,
	server_json TEXT,
	first_seen TEXT NOT NULL,
	last_seen TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS servers (
	name TEXT PRIMARY KEY,
	url TEXT NOT NULL,
	headers_json TEXT NOT NULL DEFAULT '{}',
	type TEXT NOT NULL DEFAULT 'http'
);
CREATE TABLE IF NOT EXISTS server_health (
	name TEXT PRIMARY KEY,
	health TEXT NOT NULL,
	last_check_time INTEGER,
	last_healthy_time INTEGER,
	last_error_time INTEGER,
	error_code TEXT,
	error_message TEXT,
	response_time_ms INTEGER
);
"#,
];

// One initialization per storage root at a time; concurrent opens of the same
// directory would otherwise race the migration scripts.
static MIGRATE_LATCH: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

#[derive(Error, Debug)]
pub enum StorageError {
	#[error("server {0:?} already exists")]
	ServerAlreadyExists(String),
	#[error("server {0:?} not found")]
	ServerNotFound(String),
	#[error("invalid query range: {0}")]
	InvalidRange(String),
	#[error("invalid server config: {0}")]
	Invalid(String),
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("storage io: {0}")]
	Io(#[from] std::io::Error),
	#[error("corrupt row: {0}")]
	Corrupt(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	#[default]
	Unknown,
	Up,
	Down,
}

impl HealthStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			HealthStatus::Unknown => "unknown",
			HealthStatus::Up => "up",
			HealthStatus::Down => "down",
		}
	}
}

impl FromStr for HealthStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"unknown" => Ok(HealthStatus::Unknown),
			"up" => Ok(HealthStatus::Up),
			"down" => Ok(HealthStatus::Down),
			other => Err(format!("unknown health status {other:?}")),
		}
	}
}

/// One probe result to persist. Millisecond epoch times; `last_healthy_ms`
/// is only set on `up` and `last_error_ms` only on `down`, which keeps the
/// persisted columns monotonic.
#[derive(Clone, Debug)]
pub struct HealthUpdate {
	pub name: String,
	pub health: HealthStatus,
	pub last_check_ms: i64,
	pub last_healthy_ms: Option<i64>,
	pub last_error_ms: Option<i64>,
	pub error_code: Option<String>,
	pub error_message: Option<String>,
	pub response_time_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealthRow {
	pub name: String,
	pub health: HealthStatus,
	pub last_check_time: Option<i64>,
	pub last_healthy_time: Option<i64>,
	pub last_error_time: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_code: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_time_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
	Asc,
	#[default]
	Desc,
}

pub const MAX_LIMIT: u32 = 1000;
pub const DEFAULT_LIMIT: u32 = 100;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogQuery {
	pub server_name: Option<String>,
	pub session_id: Option<String>,
	pub method: Option<String>,
	pub client_name: Option<String>,
	pub client_version: Option<String>,
	pub client_ip: Option<String>,
	pub after: Option<String>,
	pub before: Option<String>,
	pub limit: Option<u32>,
	pub order: Option<Order>,
}

impl LogQuery {
	fn effective_limit(&self) -> u32 {
		self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
	}
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
	pub count: i64,
	pub limit: u32,
	pub has_more: bool,
	pub oldest_timestamp: Option<String>,
	pub newest_timestamp: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
	pub data: Vec<CaptureRecord>,
	pub pagination: Pagination,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAggregate {
	pub server_name: String,
	pub exchange_count: i64,
	pub session_count: i64,
	pub first_activity: Option<String>,
	pub last_activity: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAggregate {
	pub session_id: String,
	pub server_name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client: Option<PeerInfo>,
	pub first_seen: String,
	pub last_seen: String,
	pub exchange_count: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAggregate {
	pub client_name: String,
	pub client_version: Option<String>,
	pub exchange_count: i64,
	pub session_count: i64,
	pub last_activity: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodAggregate {
	pub method: String,
	pub count: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetrics {
	pub last_activity: Option<String>,
	pub exchange_count: i64,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client: Option<PeerInfo>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub server: Option<PeerInfo>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerUpdate {
	pub url: Option<String>,
	pub headers: Option<BTreeMap<String, String>>,
}

impl ServerUpdate {
	pub fn is_empty(&self) -> bool {
		self.url.is_none() && self.headers.is_none()
	}
}

/// Fixed-width ISO-8601 UTC with millisecond precision; lexicographic order
/// equals chronological order, which the timestamp indexes rely on.
pub fn iso_millis(dt: &DateTime<Utc>) -> String {
	dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn parse_iso(ts: &str) -> Result<DateTime<Utc>, StorageError> {
	DateTime::parse_from_rfc3339(ts)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| StorageError::InvalidRange(format!("{ts:?}: {e}")))
}

#[derive(Debug)]
pub struct Storage {
	pool: SqlitePool,
}

impl Storage {
	/// Open (and migrate) the capture database under `dir`. Historical JSONL
	/// shards in the directory are imported on first start.
	pub async fn open(dir: &Path) -> Result<Storage, StorageError> {
		std::fs::create_dir_all(dir)?;
		let options = SqliteConnectOptions::new()
			.filename(dir.join(DB_FILE))
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.busy_timeout(Duration::from_secs(5))
			.foreign_keys(true);
		let pool = SqlitePoolOptions::new()
			.max_connections(8)
			.connect_with(options)
			.await?;
		let storage = Storage { pool };
		{
			let _latch = MIGRATE_LATCH.lock().await;
			storage.migrate().await?;
			import::import_jsonl_shards(&storage, dir).await;
		}
		Ok(storage)
	}

	pub async fn close(&self) {
		self.pool.close().await;
	}

	async fn migrate(&self) -> Result<(), StorageError> {
		let version: i64 = sqlx::query_scalar("PRAGMA user_version")
			.fetch_one(&self.pool)
			.await?;
		for (i, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
			sqlx::raw_sql(migration).execute(&self.pool).await?;
			sqlx::raw_sql(&format!("PRAGMA user_version = {}", i + 1))
				.execute(&self.pool)
				.await?;
			debug!(version = i + 1, "applied storage migration");
		}
		Ok(())
	}

	/// Append one capture row and upsert the owning session. Both run in a
	/// single transaction so a crash cannot leave a log row without a session.
	pub async fn write(&self, record: &CaptureRecord) -> Result<(), StorageError> {
		let mut tx = self.pool.begin().await?;
		let ts = iso_millis(&record.timestamp);
		let md = &record.metadata;
		let id_text = record
			.id
			.as_ref()
			.map(|id| serde_json::to_string(id).unwrap_or_default());
		let client_json = md
			.client
			.as_ref()
			.map(|c| serde_json::to_string(c).unwrap_or_default());
		let server_json = md
			.server
			.as_ref()
			.map(|s| serde_json::to_string(s).unwrap_or_default());
		sqlx::query(
			r#"INSERT INTO logs (
				timestamp, server_name, session_id, method, direction, id,
				client_name, client_version, user_agent, client_ip,
				http_status, duration_ms, input_tokens, output_tokens, method_detail,
				request_json, response_json, sse_event_json, client_json, server_json
			) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"#,
		)
		.bind(&ts)
		.bind(&md.server_name)
		.bind(&md.session_id)
		.bind(&record.method)
		.bind(record.direction.as_str())
		.bind(&id_text)
		.bind(md.client.as_ref().map(|c| c.name.clone()))
		.bind(md.client.as_ref().map(|c| c.version.clone()))
		.bind(&md.user_agent)
		.bind(&md.client_ip)
		.bind(md.http_status as i64)
		.bind(md.duration_ms as i64)
		.bind(md.input_tokens)
		.bind(md.output_tokens)
		.bind(&md.method_detail)
		.bind(record.request.as_ref().map(|v| v.to_string()))
		.bind(record.response.as_ref().map(|v| v.to_string()))
		.bind(record.sse_event.as_ref().map(|v| v.to_string()))
		.bind(&client_json)
		.bind(&server_json)
		.execute(&mut *tx)
		.await?;
		sqlx::query(
			r#"INSERT INTO sessions (session_id, server_name, client_json, server_json, first_seen, last_seen)
			VALUES (?,?,?,?,?,?)
			ON CONFLICT(session_id) DO UPDATE SET
				server_name = excluded.server_name,
				client_json = COALESCE(excluded.client_json, sessions.client_json),
				server_json = COALESCE(excluded.server_json, sessions.server_json),
				last_seen = excluded.last_seen"#,
		)
		.bind(&md.session_id)
		.bind(&md.server_name)
		.bind(&client_json)
		.bind(&server_json)
		.bind(&ts)
		.bind(&ts)
		.execute(&mut *tx)
		.await?;
		tx.commit().await?;
		Ok(())
	}

	fn push_log_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, q: &'a LogQuery) {
		qb.push(" WHERE 1=1");
		if let Some(v) = &q.server_name {
			qb.push(" AND server_name = ").push_bind(v.as_str());
		}
		if let Some(v) = &q.session_id {
			qb.push(" AND session_id = ").push_bind(v.as_str());
		}
		if let Some(v) = &q.method {
			qb.push(" AND method = ").push_bind(v.as_str());
		}
		if let Some(v) = &q.client_name {
			qb.push(" AND client_name = ").push_bind(v.as_str());
		}
		if let Some(v) = &q.client_version {
			qb.push(" AND client_version = ").push_bind(v.as_str());
		}
		if let Some(v) = &q.client_ip {
			qb.push(" AND client_ip = ").push_bind(v.as_str());
		}
		if let Some(v) = &q.after {
			qb.push(" AND timestamp > ").push_bind(v.as_str());
		}
		if let Some(v) = &q.before {
			qb.push(" AND timestamp < ").push_bind(v.as_str());
		}
	}

	pub async fn query_logs(&self, q: &LogQuery) -> Result<LogPage, StorageError> {
		// Bad ranges are a caller error (HTTP 400), not a database error.
		if let Some(a) = &q.after {
			parse_iso(a)?;
		}
		if let Some(b) = &q.before {
			parse_iso(b)?;
		}
		let limit = q.effective_limit();
		let order = q.order.unwrap_or_default();

		let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM logs");
		Self::push_log_filters(&mut count_qb, q);
		let count: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

		let mut qb = QueryBuilder::new("SELECT * FROM logs");
		Self::push_log_filters(&mut qb, q);
		match order {
			Order::Asc => qb.push(" ORDER BY timestamp ASC, rowid ASC"),
			Order::Desc => qb.push(" ORDER BY timestamp DESC, rowid DESC"),
		};
		qb.push(" LIMIT ").push_bind(limit as i64 + 1);
		let mut rows = qb.build().fetch_all(&self.pool).await?;
		let has_more = rows.len() > limit as usize;
		rows.truncate(limit as usize);

		let data = rows
			.iter()
			.map(row_to_record)
			.collect::<Result<Vec<_>, _>>()?;
		let (oldest, newest) = match order {
			Order::Asc => (data.first(), data.last()),
			Order::Desc => (data.last(), data.first()),
		};
		Ok(LogPage {
			pagination: Pagination {
				count,
				limit,
				has_more,
				oldest_timestamp: oldest.map(|r| iso_millis(&r.timestamp)),
				newest_timestamp: newest.map(|r| iso_millis(&r.timestamp)),
			},
			data,
		})
	}

	pub async fn get_servers(&self) -> Result<Vec<ServerAggregate>, StorageError> {
		let rows = sqlx::query(
			r#"SELECT server_name, COUNT(*) AS exchange_count,
				COUNT(DISTINCT session_id) AS session_count,
				MIN(timestamp) AS first_activity, MAX(timestamp) AS last_activity
			FROM logs GROUP BY server_name ORDER BY server_name"#,
		)
		.fetch_all(&self.pool)
		.await?;
		rows
			.iter()
			.map(|row| {
				Ok(ServerAggregate {
					server_name: row.try_get("server_name")?,
					exchange_count: row.try_get("exchange_count")?,
					session_count: row.try_get("session_count")?,
					first_activity: row.try_get("first_activity")?,
					last_activity: row.try_get("last_activity")?,
				})
			})
			.collect()
	}

	pub async fn get_sessions(
		&self,
		server_name: Option<&str>,
	) -> Result<Vec<SessionAggregate>, StorageError> {
		let mut qb = QueryBuilder::new(
			r#"SELECT s.session_id, s.server_name, s.client_json, s.first_seen, s.last_seen,
				(SELECT COUNT(*) FROM logs l WHERE l.session_id = s.session_id) AS exchange_count
			FROM sessions s"#,
		);
		if let Some(server) = server_name {
			qb.push(" WHERE s.server_name = ").push_bind(server);
		}
		qb.push(" ORDER BY s.last_seen DESC");
		let rows = qb.build().fetch_all(&self.pool).await?;
		rows
			.iter()
			.map(|row| {
				Ok(SessionAggregate {
					session_id: row.try_get("session_id")?,
					server_name: row.try_get("server_name")?,
					client: parse_peer(row.try_get::<Option<String>, _>("client_json")?),
					first_seen: row.try_get("first_seen")?,
					last_seen: row.try_get("last_seen")?,
					exchange_count: row.try_get("exchange_count")?,
				})
			})
			.collect()
	}

	pub async fn get_clients(&self) -> Result<Vec<ClientAggregate>, StorageError> {
		let rows = sqlx::query(
			r#"SELECT client_name, client_version, COUNT(*) AS exchange_count,
				COUNT(DISTINCT session_id) AS session_count, MAX(timestamp) AS last_activity
			FROM logs WHERE client_name IS NOT NULL
			GROUP BY client_name, client_version ORDER BY client_name"#,
		)
		.fetch_all(&self.pool)
		.await?;
		rows
			.iter()
			.map(|row| {
				Ok(ClientAggregate {
					client_name: row.try_get("client_name")?,
					client_version: row.try_get("client_version")?,
					exchange_count: row.try_get("exchange_count")?,
					session_count: row.try_get("session_count")?,
					last_activity: row.try_get("last_activity")?,
				})
			})
			.collect()
	}

	pub async fn get_methods(
		&self,
		server_name: Option<&str>,
	) -> Result<Vec<MethodAggregate>, StorageError> {
		let mut qb = QueryBuilder::new("SELECT method, COUNT(*) AS count FROM logs");
		if let Some(server) = server_name {
			qb.push(" WHERE server_name = ").push_bind(server);
		}
		qb.push(" GROUP BY method ORDER BY count DESC");
		let rows = qb.build().fetch_all(&self.pool).await?;
		rows
			.iter()
			.map(|row| {
				Ok(MethodAggregate {
					method: row.try_get("method")?,
					count: row.try_get("count")?,
				})
			})
			.collect()
	}

	pub async fn get_server_metrics(&self, name: &str) -> Result<ServerMetrics, StorageError> {
		let row = sqlx::query(
			"SELECT MAX(timestamp) AS last_activity, COUNT(*) AS exchange_count FROM logs WHERE server_name = ?",
		)
		.bind(name)
		.fetch_one(&self.pool)
		.await?;
		Ok(ServerMetrics {
			last_activity: row.try_get("last_activity")?,
			exchange_count: row.try_get("exchange_count")?,
		})
	}

	pub async fn add_server(&self, cfg: &ServerConfig) -> Result<(), StorageError> {
		let headers = serde_json::to_string(&cfg.headers).unwrap_or_else(|_| "{}".to_string());
		let res = sqlx::query("INSERT INTO servers (name, url, headers_json, type) VALUES (?,?,?,?)")
			.bind(&cfg.name)
			.bind(&cfg.url)
			.bind(&headers)
			.bind("http")
			.execute(&self.pool)
			.await;
		match res {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => Err(StorageError::ServerAlreadyExists(cfg.name.clone())),
			Err(e) => Err(e.into()),
		}
	}

	pub async fn remove_server(&self, name: &str) -> Result<(), StorageError> {
		let res = sqlx::query("DELETE FROM servers WHERE name = ?")
			.bind(name)
			.execute(&self.pool)
			.await?;
		if res.rows_affected() == 0 {
			return Err(StorageError::ServerNotFound(name.to_string()));
		}
		Ok(())
	}

	/// Partial update; an empty update is a no-op that still validates the
	/// server exists.
	pub async fn update_server(
		&self,
		name: &str,
		update: &ServerUpdate,
	) -> Result<ServerConfig, StorageError> {
		let mut cfg = self.get_server(name).await?;
		if update.is_empty() {
			return Ok(cfg);
		}
		if let Some(url) = &update.url {
			cfg.url = normalize_url(url).map_err(|e| StorageError::Invalid(e.to_string()))?;
		}
		if let Some(headers) = &update.headers {
			cfg.headers = headers.clone();
		}
		let headers = serde_json::to_string(&cfg.headers).unwrap_or_else(|_| "{}".to_string());
		sqlx::query("UPDATE servers SET url = ?, headers_json = ? WHERE name = ?")
			.bind(&cfg.url)
			.bind(&headers)
			.bind(name)
			.execute(&self.pool)
			.await?;
		Ok(cfg)
	}

	pub async fn get_registered_servers(&self) -> Result<Vec<ServerConfig>, StorageError> {
		let rows = sqlx::query("SELECT name, url, headers_json, type FROM servers ORDER BY name")
			.fetch_all(&self.pool)
			.await?;
		rows.iter().map(row_to_server).collect()
	}

	pub async fn get_server(&self, name: &str) -> Result<ServerConfig, StorageError> {
		let row = sqlx::query("SELECT name, url, headers_json, type FROM servers WHERE name = ?")
			.bind(name)
			.fetch_optional(&self.pool)
			.await?;
		match row {
			Some(row) => row_to_server(&row),
			None => Err(StorageError::ServerNotFound(name.to_string())),
		}
	}

	pub async fn upsert_server_health(&self, h: &HealthUpdate) -> Result<(), StorageError> {
		sqlx::query(
			r#"INSERT INTO server_health (
				name, health, last_check_time, last_healthy_time, last_error_time,
				error_code, error_message, response_time_ms
			) VALUES (?,?,?,?,?,?,?,?)
			ON CONFLICT(name) DO UPDATE SET
				health = excluded.health,
				last_check_time = excluded.last_check_time,
				last_healthy_time = COALESCE(excluded.last_healthy_time, server_health.last_healthy_time),
				last_error_time = COALESCE(excluded.last_error_time, server_health.last_error_time),
				error_code = excluded.error_code,
				error_message = excluded.error_message,
				response_time_ms = excluded.response_time_ms"#,
		)
		.bind(&h.name)
		.bind(h.health.as_str())
		.bind(h.last_check_ms)
		.bind(h.last_healthy_ms)
		.bind(h.last_error_ms)
		.bind(&h.error_code)
		.bind(&h.error_message)
		.bind(h.response_time_ms)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn get_server_health(&self) -> Result<Vec<ServerHealthRow>, StorageError> {
		let rows = sqlx::query("SELECT * FROM server_health ORDER BY name")
			.fetch_all(&self.pool)
			.await?;
		rows
			.iter()
			.map(|row| {
				let health: String = row.try_get("health")?;
				Ok(ServerHealthRow {
					name: row.try_get("name")?,
					health: health.parse().map_err(StorageError::Corrupt)?,
					last_check_time: row.try_get("last_check_time")?,
					last_healthy_time: row.try_get("last_healthy_time")?,
					last_error_time: row.try_get("last_error_time")?,
					error_code: row.try_get("error_code")?,
					error_message: row.try_get("error_message")?,
					response_time_ms: row.try_get("response_time_ms")?,
				})
			})
			.collect()
	}

	/// Identity for a session, falling back to the `"stateless"` sentinel for
	/// sessions whose handshake predates their session id.
	pub async fn get_session_metadata(
		&self,
		session_id: &str,
	) -> Result<SessionMetadata, StorageError> {
		if let Some(meta) = self.session_metadata_exact(session_id).await? {
			return Ok(meta);
		}
		if session_id != STATELESS_SESSION {
			if let Some(meta) = self.session_metadata_exact(STATELESS_SESSION).await? {
				return Ok(meta);
			}
		}
		Ok(SessionMetadata::default())
	}

	pub(crate) async fn session_metadata_exact(
		&self,
		session_id: &str,
	) -> Result<Option<SessionMetadata>, StorageError> {
		let row = sqlx::query("SELECT client_json, server_json FROM sessions WHERE session_id = ?")
			.bind(session_id)
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.map(|row| SessionMetadata {
			client: parse_peer(row.try_get::<Option<String>, _>("client_json").ok().flatten()),
			server: parse_peer(row.try_get::<Option<String>, _>("server_json").ok().flatten()),
		}))
	}

	/// The `initialize` request row is captured before the response reveals
	/// the server identity; backfill it once known.
	pub async fn update_server_info_for_initialize_request(
		&self,
		server_name: &str,
		session_id: &str,
		request_id: &RequestId,
		server_info: &PeerInfo,
	) -> Result<(), StorageError> {
		let id_text = serde_json::to_string(request_id).unwrap_or_default();
		let info = serde_json::to_string(server_info).unwrap_or_default();
		sqlx::query(
			r#"UPDATE logs SET server_json = ?
			WHERE server_name = ? AND session_id = ? AND id = ?
				AND method = 'initialize' AND direction = 'request'"#,
		)
		.bind(&info)
		.bind(server_name)
		.bind(session_id)
		.bind(&id_text)
		.execute(&self.pool)
		.await?;
		sqlx::query("UPDATE sessions SET server_json = ? WHERE session_id = ?")
			.bind(&info)
			.bind(session_id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Truncate capture history. The server registry and health table survive.
	pub async fn clear_all(&self) -> Result<(), StorageError> {
		let mut tx = self.pool.begin().await?;
		sqlx::query("DELETE FROM logs").execute(&mut *tx).await?;
		sqlx::query("DELETE FROM sessions").execute(&mut *tx).await?;
		tx.commit().await?;
		Ok(())
	}
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
	e.as_database_error()
		.is_some_and(|d| d.is_unique_violation())
}

fn parse_peer(json: Option<String>) -> Option<PeerInfo> {
	let json = json?;
	match serde_json::from_str(&json) {
		Ok(peer) => Some(peer),
		Err(e) => {
			debug!("discarding malformed peer info: {e}");
			None
		},
	}
}

fn row_to_server(row: &SqliteRow) -> Result<ServerConfig, StorageError> {
	let headers_json: String = row.try_get("headers_json")?;
	let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json)
		.map_err(|e| StorageError::Corrupt(format!("headers_json: {e}")))?;
	Ok(ServerConfig {
		name: row.try_get("name")?,
		url: row.try_get("url")?,
		server_type: ServerType::Http,
		headers,
	})
}

fn row_to_record(row: &SqliteRow) -> Result<CaptureRecord, StorageError> {
	let ts: String = row.try_get("timestamp")?;
	let timestamp = parse_iso(&ts).map_err(|e| StorageError::Corrupt(e.to_string()))?;
	let direction: String = row.try_get("direction")?;
	let direction: Direction = direction.parse().map_err(StorageError::Corrupt)?;
	let id = row
		.try_get::<Option<String>, _>("id")?
		.and_then(|raw| serde_json::from_str::<RequestId>(&raw).ok());
	let client = parse_peer(row.try_get::<Option<String>, _>("client_json")?);
	let parse_json = |field: &str| -> Result<Option<serde_json::Value>, StorageError> {
		Ok(row
			.try_get::<Option<String>, _>(field)?
			.and_then(|raw| serde_json::from_str(&raw).ok()))
	};
	let sse_event = parse_json("sse_event_json")?;
	let sse_str = |field: &str| {
		sse_event
			.as_ref()
			.and_then(|v| v.get(field))
			.and_then(|v| v.as_str())
			.map(|s| s.to_string())
	};
	Ok(CaptureRecord {
		timestamp,
		method: row.try_get("method")?,
		id,
		direction,
		metadata: CaptureMetadata {
			server_name: row.try_get("server_name")?,
			session_id: row.try_get("session_id")?,
			duration_ms: row.try_get::<i64, _>("duration_ms")?.max(0) as u64,
			http_status: row.try_get::<i64, _>("http_status")? as u16,
			client,
			server: parse_peer(row.try_get::<Option<String>, _>("server_json")?),
			user_agent: row.try_get("user_agent")?,
			client_ip: row.try_get("client_ip")?,
			sse_event_id: sse_str("id"),
			sse_event_type: sse_str("event"),
			input_tokens: row.try_get("input_tokens")?,
			output_tokens: row.try_get("output_tokens")?,
			method_detail: row.try_get("method_detail")?,
		},
		request: parse_json("request_json")?,
		response: parse_json("response_json")?,
		sse_event,
	})
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::client::ClientPool;
use crate::storage::{HealthStatus, HealthUpdate, Storage, StorageError};
use crate::*;

/// Fires on a health state transition: `(server_name, old, new)`.
pub type UpdateCallback = Arc<dyn Fn(&str, HealthStatus, HealthStatus) + Send + Sync>;

/// Periodically probes every registered upstream with an `OPTIONS` request
/// and persists rich status. Probes of different servers run concurrently; a
/// single server is probed at most once at a time.
pub struct HealthScheduler {
	storage: Arc<Storage>,
	clients: Arc<ClientPool>,
	probe_timeout: Duration,
	state: Mutex<HashMap<String, HealthStatus>>,
	inflight: Mutex<HashSet<String>>,
	task: Mutex<Option<JoinHandle<()>>>,
	on_update: Mutex<Option<UpdateCallback>>,
}

impl std::fmt::Debug for HealthScheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HealthScheduler").finish()
	}
}

impl HealthScheduler {
	pub fn new(
		storage: Arc<Storage>,
		clients: Arc<ClientPool>,
		probe_timeout: Duration,
	) -> HealthScheduler {
		HealthScheduler {
			storage,
			clients,
			probe_timeout,
			state: Mutex::new(HashMap::new()),
			inflight: Mutex::new(HashSet::new()),
			task: Mutex::new(None),
			on_update: Mutex::new(None),
		}
	}

	/// Start the periodic probe loop. The first cycle runs immediately.
	pub fn start(self: &Arc<Self>, interval: Duration, on_update: Option<UpdateCallback>) {
		*self.on_update.lock() = on_update;
		let scheduler = self.clone();
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				scheduler.check_all().await;
			}
		});
		if let Some(old) = self.task.lock().replace(handle) {
			old.abort();
		}
	}

	pub fn stop(&self) {
		if let Some(task) = self.task.lock().take() {
			task.abort();
		}
	}

	/// Probe every registered server, one task per server, joined.
	pub async fn check_all(self: &Arc<Self>) {
		let servers = match self.storage.get_registered_servers().await {
			Ok(servers) => servers,
			Err(e) => {
				warn!("health cycle skipped, registry unavailable: {e}");
				return;
			},
		};
		let tasks: Vec<JoinHandle<()>> = servers
			.into_iter()
			.map(|cfg| {
				let scheduler = self.clone();
				tokio::spawn(async move { scheduler.probe(&cfg.name, &cfg.url).await })
			})
			.collect();
		for task in tasks {
			let _ = task.await;
		}
	}

	/// On-demand probe of one server; `ServerNotFound` for unknown names.
	pub async fn check_one(self: &Arc<Self>, name: &str) -> Result<(), StorageError> {
		let cfg = self.storage.get_server(name).await?;
		self.probe(&cfg.name, &cfg.url).await;
		Ok(())
	}

	/// Drop in-memory probe state for a removed server.
	pub fn forget(&self, name: &str) {
		self.state.lock().remove(name);
	}

	async fn probe(&self, name: &str, url: &str) {
		// Single-flight per server.
		if !self.inflight.lock().insert(name.to_string()) {
			debug!(server_name = name, "probe already in flight, skipping");
			return;
		}
		let outcome = self.probe_inner(name, url).await;
		self.inflight.lock().remove(name);

		let new = outcome.health;
		let old = self
			.state
			.lock()
			.insert(name.to_string(), new)
			.unwrap_or_default();
		if old != new {
			info!(server_name = name, from = old.as_str(), to = new.as_str(), "server health changed");
			if let Some(cb) = self.on_update.lock().clone() {
				cb(name, old, new);
			}
		}
		// Persistence failure must not stop probing.
		if let Err(e) = self.storage.upsert_server_health(&outcome).await {
			warn!(server_name = name, "failed to persist health: {e}");
		}
	}

	async fn probe_inner(&self, name: &str, url: &str) -> HealthUpdate {
		let now_ms = Utc::now().timestamp_millis();
		let mut update = HealthUpdate {
			name: name.to_string(),
			health: HealthStatus::Unknown,
			last_check_ms: now_ms,
			last_healthy_ms: None,
			last_error_ms: None,
			error_code: None,
			error_message: None,
			response_time_ms: None,
		};
		let client = match self.clients.get(name) {
			Ok(client) => client,
			Err(e) => {
				update.health = HealthStatus::Down;
				update.last_error_ms = Some(now_ms);
				update.error_code = Some("ECONNRESET".to_string());
				update.error_message = Some(e.to_string());
				return update;
			},
		};
		let started = Instant::now();
		let result = tokio::time::timeout(
			self.probe_timeout,
			client.request(http::Method::OPTIONS, url).send(),
		)
		.await;
		match result {
			Ok(Ok(resp)) if resp.status().as_u16() < 500 => {
				update.health = HealthStatus::Up;
				update.last_healthy_ms = Some(now_ms);
				update.response_time_ms = Some(started.elapsed().as_millis() as i64);
			},
			Ok(Ok(resp)) => {
				update.health = HealthStatus::Down;
				update.last_error_ms = Some(now_ms);
				update.error_code = Some("HTTP_ERROR".to_string());
				update.error_message = Some(format!("HTTP {}", resp.status().as_u16()));
			},
			Ok(Err(e)) => {
				update.health = HealthStatus::Down;
				update.last_error_ms = Some(now_ms);
				update.error_code = Some(classify_transport_error(&e).to_string());
				update.error_message = Some(e.to_string());
			},
			Err(_) => {
				update.health = HealthStatus::Down;
				update.last_error_ms = Some(now_ms);
				update.error_code = Some("TIMEOUT".to_string());
				update.error_message = Some(format!(
					"probe timed out after {}ms",
					self.probe_timeout.as_millis()
				));
			},
		}
		update
	}
}

/// Map a transport error onto the classic errno-style codes the status table
/// uses.
fn classify_transport_error(e: &reqwest::Error) -> &'static str {
	let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
	while let Some(err) = source {
		if let Some(io) = err.downcast_ref::<std::io::Error>() {
			match io.kind() {
				std::io::ErrorKind::ConnectionRefused => return "ECONNREFUSED",
				std::io::ErrorKind::ConnectionReset => return "ECONNRESET",
				std::io::ErrorKind::TimedOut => return "ETIMEDOUT",
				_ => {},
			}
		}
		source = err.source();
	}
	if e.is_timeout() {
		return "ETIMEDOUT";
	}
	let text = e.to_string();
	if text.contains("dns") || text.contains("lookup") {
		return "ENOTFOUND";
	}
	if e.is_connect() {
		return "ECONNREFUSED";
	}
	"ECONNRESET"
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use tempfile::TempDir;
	use wiremock::matchers::method;
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;
	use crate::types::registry::{ServerConfig, ServerType};

	async fn scheduler() -> (TempDir, Arc<Storage>, Arc<HealthScheduler>) {
		let dir = TempDir::new().unwrap();
		let storage = Arc::new(Storage::open(dir.path()).await.unwrap());
		let scheduler = Arc::new(HealthScheduler::new(
			storage.clone(),
			Arc::new(ClientPool::new()),
			Duration::from_secs(2),
		));
		(dir, storage, scheduler)
	}

	fn server(name: &str, url: &str) -> ServerConfig {
		ServerConfig {
			name: name.to_string(),
			url: url.to_string(),
			server_type: ServerType::Http,
			headers: Default::default(),
		}
	}

	#[tokio::test]
	async fn probe_up_then_refused_keeps_last_healthy() {
		let (_dir, storage, scheduler) = scheduler().await;
		let mock = MockServer::start().await;
		Mock::given(method("OPTIONS"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&mock)
			.await;
		storage.add_server(&server("x", &mock.uri())).await.unwrap();

		scheduler.check_one("x").await.unwrap();
		let rows = storage.get_server_health().await.unwrap();
		assert_eq!(rows[0].health, HealthStatus::Up);
		assert!(rows[0].response_time_ms.is_some());
		let healthy_at = rows[0].last_healthy_time.unwrap();

		// tear the upstream down: connection refused
		let addr = mock.uri();
		drop(mock);
		storage
			.update_server(
				"x",
				&crate::storage::ServerUpdate {
					url: Some(addr),
					headers: None,
				},
			)
			.await
			.unwrap();
		scheduler.check_one("x").await.unwrap();

		let rows = storage.get_server_health().await.unwrap();
		let row = &rows[0];
		assert_eq!(row.health, HealthStatus::Down);
		assert_eq!(row.error_code.as_deref(), Some("ECONNREFUSED"));
		assert_eq!(row.last_healthy_time, Some(healthy_at));
		assert!(row.last_error_time.unwrap() >= healthy_at);
	}

	#[tokio::test]
	async fn http_5xx_is_down_with_http_error() {
		let (_dir, storage, scheduler) = scheduler().await;
		let mock = MockServer::start().await;
		Mock::given(method("OPTIONS"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&mock)
			.await;
		storage.add_server(&server("x", &mock.uri())).await.unwrap();

		scheduler.check_one("x").await.unwrap();
		let rows = storage.get_server_health().await.unwrap();
		assert_eq!(rows[0].health, HealthStatus::Down);
		assert_eq!(rows[0].error_code.as_deref(), Some("HTTP_ERROR"));
		assert_eq!(rows[0].error_message.as_deref(), Some("HTTP 503"));
	}

	#[tokio::test]
	async fn unknown_server_is_not_found() {
		let (_dir, _storage, scheduler) = scheduler().await;
		assert!(matches!(
			scheduler.check_one("ghost").await,
			Err(StorageError::ServerNotFound(_))
		));
	}

	#[tokio::test]
	async fn transition_fires_update_callback() {
		let (_dir, storage, scheduler) = scheduler().await;
		let mock = MockServer::start().await;
		Mock::given(method("OPTIONS"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&mock)
			.await;
		storage.add_server(&server("x", &mock.uri())).await.unwrap();

		let fired = Arc::new(AtomicUsize::new(0));
		let counter = fired.clone();
		*scheduler.on_update.lock() = Some(Arc::new(move |_, _, _| {
			counter.fetch_add(1, Ordering::SeqCst);
		}));

		scheduler.check_one("x").await.unwrap(); // unknown -> up
		scheduler.check_one("x").await.unwrap(); // up -> up, no transition
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn check_all_probes_every_registered_server() {
		let (_dir, storage, scheduler) = scheduler().await;
		let mock = MockServer::start().await;
		Mock::given(method("OPTIONS"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&mock)
			.await;
		storage.add_server(&server("a", &mock.uri())).await.unwrap();
		storage.add_server(&server("b", &mock.uri())).await.unwrap();

		scheduler.check_all().await;
		assert_eq!(storage.get_server_health().await.unwrap().len(), 2);
	}
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::task::TaskTracker;

use crate::capture::CaptureEngine;
use crate::client::ClientPool;
use crate::health::{HealthScheduler, UpdateCallback};
use crate::sessions::{PeerKind, SessionStore};
use crate::storage::{Storage, StorageError};
use crate::track::RequestTracker;
use crate::{management, oauth, proxy};
use crate::*;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
	pub storage_dir: PathBuf,
	pub probe_timeout: Duration,
	pub health_check_interval: Duration,
	pub shutdown_grace: Duration,
}

impl GatewayConfig {
	pub fn new(storage_dir: impl Into<PathBuf>) -> GatewayConfig {
		GatewayConfig {
			storage_dir: storage_dir.into(),
			probe_timeout: defaults::probe_timeout(),
			health_check_interval: defaults::health_check_interval(),
			shutdown_grace: defaults::shutdown_grace(),
		}
	}
}

impl From<&Config> for GatewayConfig {
	fn from(cfg: &Config) -> GatewayConfig {
		GatewayConfig {
			storage_dir: cfg.storage_dir.clone(),
			probe_timeout: cfg.probe_timeout,
			health_check_interval: cfg.health_check_interval,
			shutdown_grace: cfg.shutdown_grace,
		}
	}
}

/// The facade composing storage, tracker, session stores, capture, upstream
/// client pools, and the health scheduler. Owns the storage handle and closes
/// it on shutdown; scoped to one storage root, no process-wide singleton.
#[derive(Debug)]
pub struct Gateway {
	pub storage: Arc<Storage>,
	pub tracker: Arc<RequestTracker>,
	pub client_info: Arc<SessionStore>,
	pub server_info: Arc<SessionStore>,
	pub capture: Arc<CaptureEngine>,
	pub clients: Arc<ClientPool>,
	pub health: Arc<HealthScheduler>,
	/// Per-connection capture tasks, drained with a bounded grace period on
	/// shutdown.
	pub(crate) tasks: TaskTracker,
	health_check_interval: Duration,
	shutdown_grace: Duration,
}

impl Gateway {
	pub async fn new(cfg: GatewayConfig) -> Result<Arc<Gateway>, StorageError> {
		let storage = Arc::new(Storage::open(&cfg.storage_dir).await?);
		let tracker = Arc::new(RequestTracker::new());
		let client_info = Arc::new(SessionStore::new(PeerKind::Client, storage.clone()));
		let server_info = Arc::new(SessionStore::new(PeerKind::Server, storage.clone()));
		let capture = Arc::new(CaptureEngine::new(
			storage.clone(),
			tracker.clone(),
			client_info.clone(),
			server_info.clone(),
		));
		let clients = Arc::new(ClientPool::new());
		let health = Arc::new(HealthScheduler::new(
			storage.clone(),
			clients.clone(),
			cfg.probe_timeout,
		));
		Ok(Arc::new(Gateway {
			storage,
			tracker,
			client_info,
			server_info,
			capture,
			clients,
			health,
			tasks: TaskTracker::new(),
			health_check_interval: cfg.health_check_interval,
			shutdown_grace: cfg.shutdown_grace,
		}))
	}

	/// Assemble the full HTTP application: wire proxy, OAuth discovery, and
	/// the token-guarded management plane under `/api`.
	pub fn app(self: &Arc<Self>, token: &str) -> Router {
		Router::new()
			.merge(proxy::router(self.clone()))
			.merge(oauth::router(self.clone()))
			.nest("/api", management::router(self.clone(), token))
	}

	/// Begin periodic health probing at the configured interval.
	pub fn start_health(self: &Arc<Self>, on_update: Option<UpdateCallback>) {
		self.health.start(self.health_check_interval, on_update);
	}

	/// The upstream assigned a session id on a response; carry the cached
	/// handshake identity over so later requests on the new id resolve it.
	pub async fn migrate_session(&self, old: &str, new: &str) {
		if let Some(info) = self.client_info.get(old).await {
			self.client_info.store(new, info);
		}
		if let Some(info) = self.server_info.get(old).await {
			self.server_info.store(new, info);
		}
		debug!(from = old, to = new, "session id assigned by upstream");
	}

	/// Stop probing, drain in-flight captures, close storage.
	pub async fn close(&self) {
		self.health.stop();
		self.tasks.close();
		if tokio::time::timeout(self.shutdown_grace, self.tasks.wait())
			.await
			.is_err()
		{
			warn!("capture drain exceeded grace period, abandoning tasks");
		}
		self.storage.close().await;
	}
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;
	use crate::types::capture::PeerInfo;

	#[tokio::test]
	async fn close_drains_capture_tasks_and_shuts_storage() {
		let dir = TempDir::new().unwrap();
		let gateway = Gateway::new(GatewayConfig::new(dir.path())).await.unwrap();
		gateway.start_health(None);
		gateway.tasks.spawn(async {
			tokio::time::sleep(Duration::from_millis(10)).await;
		});
		gateway.close().await;
		// storage refuses work after close
		assert!(gateway.storage.get_registered_servers().await.is_err());
	}

	#[tokio::test]
	async fn migrate_session_carries_cached_identity() {
		let dir = TempDir::new().unwrap();
		let gateway = Gateway::new(GatewayConfig::new(dir.path())).await.unwrap();
		gateway.client_info.store(
			"stateless",
			PeerInfo {
				name: "inspector".to_string(),
				version: "1.0".to_string(),
				title: None,
			},
		);
		gateway.migrate_session("stateless", "sess-1").await;
		let sessions = gateway.client_info.active_sessions();
		assert!(sessions.contains(&"sess-1".to_string()));
		gateway.close().await;
	}
}

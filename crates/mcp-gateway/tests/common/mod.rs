use std::net::SocketAddr;
use std::sync::Arc;

use mcp_gateway::gateway::{Gateway, GatewayConfig};
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub const TOKEN: &str = "test-token";

/// A gateway listening on an ephemeral port, driven over real TCP.
pub struct TestGateway {
	// Held so the storage dir outlives the test
	pub _dir: TempDir,
	pub addr: SocketAddr,
	pub gateway: Arc<Gateway>,
	pub client: reqwest::Client,
	task: JoinHandle<()>,
}

impl TestGateway {
	pub async fn start() -> TestGateway {
		mcp_gateway::telemetry::log::testing::setup_test_logging();
		let dir = TempDir::new().unwrap();
		let gateway = Gateway::new(GatewayConfig::new(dir.path())).await.unwrap();
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let app = gateway
			.app(TOKEN)
			.into_make_service_with_connect_info::<SocketAddr>();
		let task = tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});
		TestGateway {
			_dir: dir,
			addr,
			gateway,
			client: reqwest::Client::new(),
			task,
		}
	}

	pub fn url(&self, path: &str) -> String {
		format!("http://{}{path}", self.addr)
	}

	/// Management call with the bearer token attached.
	pub fn api(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
		self
			.client
			.request(method, self.url(path))
			.bearer_auth(TOKEN)
	}

	pub async fn register(&self, name: &str, url: &str) {
		let resp = self
			.api(reqwest::Method::POST, "/api/servers/config")
			.json(&serde_json::json!({"name": name, "url": url}))
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status(), 201, "failed to register {name}");
	}

	pub async fn proxy_post(&self, server: &str, body: Value) -> reqwest::Response {
		self
			.client
			.post(self.url(&format!("/s/{server}/mcp")))
			.header("content-type", "application/json")
			.json(&body)
			.send()
			.await
			.unwrap()
	}

	pub async fn shutdown(self) {
		self.task.abort();
		self.gateway.close().await;
	}
}

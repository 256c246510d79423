use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::*;

/// One HTTP client (with its own connection pool) per registered server,
/// created lazily and dropped on server removal.
#[derive(Debug, Default)]
pub struct ClientPool {
	clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ClientPool {
	pub fn new() -> ClientPool {
		ClientPool::default()
	}

	pub fn get(&self, server_name: &str) -> Result<reqwest::Client, reqwest::Error> {
		if let Some(client) = self.clients.lock().get(server_name) {
			return Ok(client.clone());
		}
		// No overall timeout: SSE streams are long-lived. Only the connect is
		// bounded.
		let client = reqwest::Client::builder()
			.connect_timeout(Duration::from_secs(10))
			.pool_max_idle_per_host(10)
			.pool_idle_timeout(Duration::from_secs(90))
			.tcp_keepalive(Duration::from_secs(30))
			.tcp_nodelay(true)
			.build()?;
		self
			.clients
			.lock()
			.insert(server_name.to_string(), client.clone());
		debug!(server_name, "created upstream client pool");
		Ok(client)
	}

	pub fn remove(&self, server_name: &str) {
		if self.clients.lock().remove(server_name).is_some() {
			debug!(server_name, "dropped upstream client pool");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pools_are_cached_per_server_and_dropped_on_removal() {
		let pool = ClientPool::new();
		let _a = pool.get("a").unwrap();
		let _b = pool.get("b").unwrap();
		assert_eq!(pool.clients.lock().len(), 2);
		pool.remove("a");
		assert_eq!(pool.clients.lock().len(), 1);
		pool.remove("a");
		assert_eq!(pool.clients.lock().len(), 1);
	}
}

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::types::jsonrpc::RequestId;

/// A pending request is scoped to its server and session; ids are only unique
/// within that pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PendingKey {
	pub server_name: String,
	pub session_id: String,
	pub id: RequestId,
}

impl PendingKey {
	pub fn new(server_name: &str, session_id: &str, id: &RequestId) -> PendingKey {
		PendingKey {
			server_name: server_name.to_string(),
			session_id: session_id.to_string(),
			id: id.clone(),
		}
	}
}

#[derive(Debug)]
struct Pending {
	method: String,
	started: Instant,
}

/// In-memory map of in-flight JSON-RPC requests, used to compute response
/// durations. Entries outlive responses the upstream never sends.
#[derive(Debug, Default)]
pub struct RequestTracker {
	pending: Mutex<HashMap<PendingKey, Pending>>,
}

impl RequestTracker {
	pub fn new() -> RequestTracker {
		RequestTracker::default()
	}

	pub fn track_request(&self, key: PendingKey, method: &str) {
		self.pending.lock().insert(
			key,
			Pending {
				method: method.to_string(),
				started: Instant::now(),
			},
		);
	}

	/// Single-shot: removes the entry on a hit, so a second response for the
	/// same id measures 0.
	pub fn calculate_duration(&self, key: &PendingKey) -> u64 {
		match self.pending.lock().remove(key) {
			Some(p) => p.started.elapsed().as_millis() as u64,
			None => 0,
		}
	}

	pub fn get_method(&self, key: &PendingKey) -> Option<String> {
		self.pending.lock().get(key).map(|p| p.method.clone())
	}

	pub fn has_request(&self, key: &PendingKey) -> bool {
		self.pending.lock().contains_key(key)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(id: i64) -> PendingKey {
		PendingKey::new("srv", "sess", &RequestId::Number(id))
	}

	#[test]
	fn duration_is_single_shot() {
		let tracker = RequestTracker::new();
		tracker.track_request(key(1), "tools/list");
		assert!(tracker.has_request(&key(1)));
		assert_eq!(tracker.get_method(&key(1)).as_deref(), Some("tools/list"));

		let _ = tracker.calculate_duration(&key(1));
		assert!(!tracker.has_request(&key(1)));
		// second response for the same id measures nothing
		assert_eq!(tracker.calculate_duration(&key(1)), 0);
	}

	#[test]
	fn unknown_id_measures_zero() {
		let tracker = RequestTracker::new();
		assert_eq!(tracker.calculate_duration(&key(999)), 0);
		assert_eq!(tracker.get_method(&key(999)), None);
	}

	#[test]
	fn keys_are_scoped_per_session() {
		let tracker = RequestTracker::new();
		tracker.track_request(PendingKey::new("srv", "a", &RequestId::Number(1)), "x");
		assert!(!tracker.has_request(&PendingKey::new("srv", "b", &RequestId::Number(1))));
		assert!(tracker.has_request(&PendingKey::new("srv", "a", &RequestId::Number(1))));
	}

	#[test]
	fn string_and_number_ids_do_not_collide() {
		let tracker = RequestTracker::new();
		tracker.track_request(
			PendingKey::new("srv", "sess", &RequestId::String("1".to_string())),
			"x",
		);
		assert!(!tracker.has_request(&key(1)));
	}
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::Storage;
use crate::types::capture::{PeerInfo, STATELESS_SESSION};
use crate::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
	Client,
	Server,
}

/// In-memory identity cache for one side of the MCP handshake, with a storage
/// fallback. Lookup order: memory, storage, then both again under the
/// `"stateless"` sentinel, since the handshake may have happened before the
/// upstream assigned a real session id.
#[derive(Debug)]
pub struct SessionStore {
	kind: PeerKind,
	storage: Arc<Storage>,
	cache: Mutex<HashMap<String, PeerInfo>>,
}

impl SessionStore {
	pub fn new(kind: PeerKind, storage: Arc<Storage>) -> SessionStore {
		SessionStore {
			kind,
			storage,
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub fn store(&self, session_id: &str, info: PeerInfo) {
		self.cache.lock().insert(session_id.to_string(), info);
	}

	pub async fn get(&self, session_id: &str) -> Option<PeerInfo> {
		if let Some(info) = self.cache.lock().get(session_id) {
			return Some(info.clone());
		}
		if let Some(info) = self.lookup_storage(session_id).await {
			// Only exact hits are cached; a fallback hit must not pin the
			// stateless identity onto a real session id.
			self.cache.lock().insert(session_id.to_string(), info.clone());
			return Some(info);
		}
		if session_id != STATELESS_SESSION {
			if let Some(info) = self.cache.lock().get(STATELESS_SESSION) {
				return Some(info.clone());
			}
			if let Some(info) = self.lookup_storage(STATELESS_SESSION).await {
				return Some(info);
			}
		}
		None
	}

	async fn lookup_storage(&self, session_id: &str) -> Option<PeerInfo> {
		let meta = match self.storage.session_metadata_exact(session_id).await {
			Ok(meta) => meta?,
			Err(e) => {
				debug!(session_id, "session metadata lookup failed: {e}");
				return None;
			},
		};
		match self.kind {
			PeerKind::Client => meta.client,
			PeerKind::Server => meta.server,
		}
	}

	pub fn clear(&self, session_id: &str) {
		self.cache.lock().remove(session_id);
	}

	pub fn clear_all(&self) {
		self.cache.lock().clear();
	}

	/// Sessions whose identity is currently cached in memory.
	pub fn active_sessions(&self) -> Vec<String> {
		self.cache.lock().keys().cloned().collect()
	}
}

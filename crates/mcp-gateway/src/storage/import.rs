use std::path::Path;

use crate::storage::Storage;
use crate::types::capture::CaptureRecord;
use crate::*;

/// Import historical JSONL capture shards left behind by older gateways.
/// Each shard holds one record per line; imported shards are renamed with an
/// `.imported` suffix so a restart does not double-import them.
pub(super) async fn import_jsonl_shards(storage: &Storage, dir: &Path) {
	let Ok(entries) = std::fs::read_dir(dir) else {
		return;
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
			continue;
		}
		match import_shard(storage, &path).await {
			Ok(count) => {
				info!(shard = %path.display(), count, "imported JSONL shard");
				let renamed = path.with_extension("jsonl.imported");
				if let Err(e) = std::fs::rename(&path, &renamed) {
					warn!(shard = %path.display(), "failed to rename imported shard: {e}");
				}
			},
			Err(e) => {
				warn!(shard = %path.display(), "failed to import shard: {e}");
			},
		}
	}
}

async fn import_shard(storage: &Storage, path: &Path) -> anyhow::Result<usize> {
	let content = std::fs::read_to_string(path)?;
	let mut count = 0;
	for (lineno, line) in content.lines().enumerate() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		let record: CaptureRecord = match serde_json::from_str(line) {
			Ok(r) => r,
			Err(e) => {
				debug!(shard = %path.display(), line = lineno + 1, "skipping malformed record: {e}");
				continue;
			},
		};
		storage.write(&record).await?;
		count += 1;
	}
	Ok(count)
}

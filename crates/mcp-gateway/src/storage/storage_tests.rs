use std::collections::BTreeMap;

use chrono::TimeZone;
use serde_json::json;
use tempfile::TempDir;

use super::*;

async fn open_temp() -> (TempDir, Storage) {
	let dir = TempDir::new().unwrap();
	let storage = Storage::open(dir.path()).await.unwrap();
	(dir, storage)
}

fn record(server: &str, session: &str, method: &str, n: i64) -> CaptureRecord {
	CaptureRecord {
		timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + n).unwrap(),
		method: method.to_string(),
		id: Some(RequestId::Number(n)),
		direction: Direction::Request,
		metadata: CaptureMetadata {
			server_name: server.to_string(),
			session_id: session.to_string(),
			duration_ms: 0,
			http_status: 200,
			..Default::default()
		},
		request: Some(json!({"jsonrpc":"2.0","id":n,"method":method})),
		response: None,
		sse_event: None,
	}
}

fn server(name: &str) -> ServerConfig {
	ServerConfig {
		name: name.to_string(),
		url: format!("http://{name}.example/mcp"),
		server_type: ServerType::Http,
		headers: BTreeMap::new(),
	}
}

#[tokio::test]
async fn write_then_query_roundtrip() {
	let (_dir, storage) = open_temp().await;
	storage.write(&record("weather", "s1", "tools/list", 1)).await.unwrap();
	let page = storage.query_logs(&LogQuery::default()).await.unwrap();
	assert_eq!(page.data.len(), 1);
	assert_eq!(page.pagination.count, 1);
	assert!(!page.pagination.has_more);
	let rec = &page.data[0];
	assert_eq!(rec.method, "tools/list");
	assert_eq!(rec.id, Some(RequestId::Number(1)));
	assert_eq!(rec.metadata.server_name, "weather");
	assert_eq!(rec.request.as_ref().unwrap()["method"], json!("tools/list"));
}

#[tokio::test]
async fn query_filters_by_server_session_and_method() {
	let (_dir, storage) = open_temp().await;
	storage.write(&record("a", "s1", "tools/list", 1)).await.unwrap();
	storage.write(&record("a", "s2", "tools/call", 2)).await.unwrap();
	storage.write(&record("b", "s1", "tools/list", 3)).await.unwrap();

	let q = LogQuery {
		server_name: Some("a".to_string()),
		..Default::default()
	};
	assert_eq!(storage.query_logs(&q).await.unwrap().data.len(), 2);

	let q = LogQuery {
		server_name: Some("a".to_string()),
		method: Some("tools/call".to_string()),
		..Default::default()
	};
	let page = storage.query_logs(&q).await.unwrap();
	assert_eq!(page.data.len(), 1);
	assert_eq!(page.data[0].metadata.session_id, "s2");

	let q = LogQuery {
		session_id: Some("s1".to_string()),
		..Default::default()
	};
	assert_eq!(storage.query_logs(&q).await.unwrap().data.len(), 2);
}

#[tokio::test]
async fn pagination_pages_never_overlap() {
	let (_dir, storage) = open_temp().await;
	for n in 0..10 {
		storage.write(&record("a", "s1", "m", n)).await.unwrap();
	}
	let q = LogQuery {
		limit: Some(4),
		..Default::default()
	};
	let first = storage.query_logs(&q).await.unwrap();
	assert_eq!(first.data.len(), 4);
	assert!(first.pagination.has_more);
	assert_eq!(first.pagination.count, 10);

	let q2 = LogQuery {
		limit: Some(4),
		before: first.pagination.oldest_timestamp.clone(),
		..Default::default()
	};
	let second = storage.query_logs(&q2).await.unwrap();
	assert_eq!(second.data.len(), 4);
	let first_ids: Vec<_> = first.data.iter().map(|r| r.id.clone()).collect();
	for rec in &second.data {
		assert!(!first_ids.contains(&rec.id), "pages overlap at {:?}", rec.id);
	}
}

#[tokio::test]
async fn query_rejects_bad_range() {
	let (_dir, storage) = open_temp().await;
	let q = LogQuery {
		after: Some("yesterday".to_string()),
		..Default::default()
	};
	assert!(matches!(
		storage.query_logs(&q).await,
		Err(StorageError::InvalidRange(_))
	));
}

#[tokio::test]
async fn order_asc_and_desc() {
	let (_dir, storage) = open_temp().await;
	for n in 0..3 {
		storage.write(&record("a", "s1", "m", n)).await.unwrap();
	}
	let page = storage
		.query_logs(&LogQuery {
			order: Some(Order::Asc),
			..Default::default()
		})
		.await
		.unwrap();
	assert_eq!(page.data[0].id, Some(RequestId::Number(0)));
	let page = storage.query_logs(&LogQuery::default()).await.unwrap();
	assert_eq!(page.data[0].id, Some(RequestId::Number(2)));
}

#[tokio::test]
async fn registry_roundtrip_and_conflicts() {
	let (_dir, storage) = open_temp().await;
	let mut cfg = server("x");
	cfg.headers.insert("authorization".to_string(), "Bearer shh".to_string());
	storage.add_server(&cfg).await.unwrap();
	let got = storage.get_server("x").await.unwrap();
	assert_eq!(got, cfg);

	// duplicate insert must not mutate the row
	let mut dupe = server("x");
	dupe.url = "http://other.example".to_string();
	assert!(matches!(
		storage.add_server(&dupe).await,
		Err(StorageError::ServerAlreadyExists(_))
	));
	assert_eq!(storage.get_server("x").await.unwrap().url, cfg.url);

	assert!(matches!(
		storage.get_server("nope").await,
		Err(StorageError::ServerNotFound(_))
	));
	assert!(matches!(
		storage.remove_server("nope").await,
		Err(StorageError::ServerNotFound(_))
	));
	storage.remove_server("x").await.unwrap();
	assert!(storage.get_registered_servers().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_update_is_a_noop() {
	let (_dir, storage) = open_temp().await;
	let cfg = server("x");
	storage.add_server(&cfg).await.unwrap();
	let out = storage.update_server("x", &ServerUpdate::default()).await.unwrap();
	assert_eq!(out, cfg);

	let out = storage
		.update_server(
			"x",
			&ServerUpdate {
				url: Some("http://moved.example/mcp/".to_string()),
				headers: None,
			},
		)
		.await
		.unwrap();
	assert_eq!(out.url, "http://moved.example/mcp");
	assert_eq!(storage.get_server("x").await.unwrap().url, "http://moved.example/mcp");
}

#[tokio::test]
async fn clear_all_preserves_servers_and_health() {
	let (_dir, storage) = open_temp().await;
	storage.add_server(&server("x")).await.unwrap();
	storage.write(&record("x", "s1", "m", 1)).await.unwrap();
	storage
		.upsert_server_health(&HealthUpdate {
			name: "x".to_string(),
			health: HealthStatus::Up,
			last_check_ms: 1000,
			last_healthy_ms: Some(1000),
			last_error_ms: None,
			error_code: None,
			error_message: None,
			response_time_ms: Some(12),
		})
		.await
		.unwrap();

	storage.clear_all().await.unwrap();

	assert!(storage.query_logs(&LogQuery::default()).await.unwrap().data.is_empty());
	assert!(storage.get_sessions(None).await.unwrap().is_empty());
	assert_eq!(storage.get_registered_servers().await.unwrap().len(), 1);
	assert_eq!(storage.get_server_health().await.unwrap().len(), 1);
}

#[tokio::test]
async fn health_flap_keeps_last_healthy_time() {
	let (_dir, storage) = open_temp().await;
	storage
		.upsert_server_health(&HealthUpdate {
			name: "x".to_string(),
			health: HealthStatus::Up,
			last_check_ms: 1000,
			last_healthy_ms: Some(1000),
			last_error_ms: None,
			error_code: None,
			error_message: None,
			response_time_ms: Some(8),
		})
		.await
		.unwrap();
	storage
		.upsert_server_health(&HealthUpdate {
			name: "x".to_string(),
			health: HealthStatus::Down,
			last_check_ms: 2000,
			last_healthy_ms: None,
			last_error_ms: Some(2000),
			error_code: Some("ECONNREFUSED".to_string()),
			error_message: Some("connection refused".to_string()),
			response_time_ms: None,
		})
		.await
		.unwrap();

	let rows = storage.get_server_health().await.unwrap();
	assert_eq!(rows.len(), 1);
	let row = &rows[0];
	assert_eq!(row.health, HealthStatus::Down);
	assert_eq!(row.last_healthy_time, Some(1000));
	assert_eq!(row.last_error_time, Some(2000));
	assert_eq!(row.error_code.as_deref(), Some("ECONNREFUSED"));
	// both bounded by the check time
	assert!(row.last_healthy_time.unwrap() <= row.last_check_time.unwrap());
	assert!(row.last_error_time.unwrap() <= row.last_check_time.unwrap());
}

#[tokio::test]
async fn session_metadata_falls_back_to_stateless() {
	let (_dir, storage) = open_temp().await;
	let mut rec = record("a", STATELESS_SESSION, "initialize", 1);
	rec.metadata.client = Some(PeerInfo {
		name: "inspector".to_string(),
		version: "1.0".to_string(),
		title: None,
	});
	storage.write(&rec).await.unwrap();

	let meta = storage.get_session_metadata("sess-42").await.unwrap();
	assert_eq!(meta.client.unwrap().name, "inspector");

	let meta = storage.get_session_metadata(STATELESS_SESSION).await.unwrap();
	assert_eq!(meta.client.unwrap().name, "inspector");
}

#[tokio::test]
async fn initialize_backfill_updates_request_row() {
	let (_dir, storage) = open_temp().await;
	storage.write(&record("a", "s1", "initialize", 7)).await.unwrap();
	let info = PeerInfo {
		name: "weather-server".to_string(),
		version: "2.1".to_string(),
		title: Some("Weather".to_string()),
	};
	storage
		.update_server_info_for_initialize_request("a", "s1", &RequestId::Number(7), &info)
		.await
		.unwrap();
	let page = storage.query_logs(&LogQuery::default()).await.unwrap();
	assert_eq!(page.data[0].metadata.server.as_ref().unwrap().name, "weather-server");
}

#[tokio::test]
async fn aggregations_group_by_server_and_method() {
	let (_dir, storage) = open_temp().await;
	storage.write(&record("a", "s1", "tools/list", 1)).await.unwrap();
	storage.write(&record("a", "s1", "tools/list", 2)).await.unwrap();
	storage.write(&record("a", "s2", "tools/call", 3)).await.unwrap();
	storage.write(&record("b", "s3", "ping", 4)).await.unwrap();

	let servers = storage.get_servers().await.unwrap();
	assert_eq!(servers.len(), 2);
	let a = servers.iter().find(|s| s.server_name == "a").unwrap();
	assert_eq!(a.exchange_count, 3);
	assert_eq!(a.session_count, 2);

	let methods = storage.get_methods(Some("a")).await.unwrap();
	assert_eq!(methods[0].method, "tools/list");
	assert_eq!(methods[0].count, 2);

	let metrics = storage.get_server_metrics("a").await.unwrap();
	assert_eq!(metrics.exchange_count, 3);
	assert!(metrics.last_activity.is_some());

	let sessions = storage.get_sessions(Some("a")).await.unwrap();
	assert_eq!(sessions.len(), 2);
}

#[tokio::test]
async fn client_identity_round_trips_with_title() {
	let (_dir, storage) = open_temp().await;
	let mut rec = record("a", "s1", "tools/list", 1);
	rec.metadata.client = Some(PeerInfo {
		name: "inspector".to_string(),
		version: "0.9".to_string(),
		title: Some("MCP Inspector".to_string()),
	});
	storage.write(&rec).await.unwrap();

	let page = storage.query_logs(&LogQuery::default()).await.unwrap();
	let client = page.data[0].metadata.client.as_ref().unwrap();
	assert_eq!(client.name, "inspector");
	assert_eq!(client.version, "0.9");
	assert_eq!(client.title.as_deref(), Some("MCP Inspector"));
}

#[tokio::test]
async fn clients_aggregate_by_name_and_version() {
	let (_dir, storage) = open_temp().await;
	let mut with_client = record("a", "s1", "tools/list", 1);
	with_client.metadata.client = Some(PeerInfo {
		name: "inspector".to_string(),
		version: "0.9".to_string(),
		title: None,
	});
	storage.write(&with_client).await.unwrap();
	// anonymous traffic does not show up as a client
	storage.write(&record("a", "s2", "ping", 2)).await.unwrap();

	let clients = storage.get_clients().await.unwrap();
	assert_eq!(clients.len(), 1);
	assert_eq!(clients[0].client_name, "inspector");
	assert_eq!(clients[0].client_version.as_deref(), Some("0.9"));
	assert_eq!(clients[0].exchange_count, 1);
	assert_eq!(clients[0].session_count, 1);
}

#[tokio::test]
async fn imports_jsonl_shards_once() {
	let dir = TempDir::new().unwrap();
	let rec = record("a", "s1", "tools/list", 1);
	let shard = dir.path().join("2024-01-01.jsonl");
	std::fs::write(&shard, format!("{}\nnot json\n", serde_json::to_string(&rec).unwrap())).unwrap();

	let storage = Storage::open(dir.path()).await.unwrap();
	let page = storage.query_logs(&LogQuery::default()).await.unwrap();
	assert_eq!(page.data.len(), 1);
	assert!(!shard.exists());
	assert!(dir.path().join("2024-01-01.jsonl.imported").exists());
	storage.close().await;

	// a second open must not re-import
	let storage = Storage::open(dir.path()).await.unwrap();
	let page = storage.query_logs(&LogQuery::default()).await.unwrap();
	assert_eq!(page.data.len(), 1);
}

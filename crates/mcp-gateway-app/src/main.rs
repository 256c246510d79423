use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use mcp_gateway::gateway::Gateway;
use mcp_gateway::{Config, RawConfig, telemetry};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
	name = "mcp-gateway",
	about = "Observability gateway for the Model Context Protocol",
	version
)]
struct Args {
	/// Port to listen on
	#[arg(long, env = "PORT")]
	port: Option<u16>,

	/// Directory holding the capture database
	#[arg(long, env = "STORAGE_DIR")]
	storage_dir: Option<String>,

	/// Log level: debug, info, warn, or error
	#[arg(long, env = "LOG_LEVEL")]
	log_level: Option<String>,

	/// Management bearer token; generated and printed when unset
	#[arg(long, env = "MCP_GATEWAY_TOKEN")]
	token: Option<String>,

	/// Emit logs as JSON lines
	#[arg(long)]
	log_json: bool,

	/// Health probe interval in milliseconds
	#[arg(long, env = "HEALTH_CHECK_INTERVAL_MS")]
	health_check_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() {
	std::process::exit(run().await);
}

async fn run() -> i32 {
	let args = Args::parse();
	let raw = RawConfig {
		port: args.port,
		storage_dir: args.storage_dir,
		log_level: args.log_level,
		token: args.token,
		health_check_interval_ms: args.health_check_interval_ms,
	};
	let config = match Config::from_raw(raw) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("invalid configuration: {e}");
			return 1;
		},
	};
	telemetry::log::setup(&config.log_level, args.log_json);

	let (token, generated) = match &config.token {
		Some(token) => (token.clone(), false),
		None => (generate_token(), true),
	};

	let gateway = match Gateway::new((&config).into()).await {
		Ok(gateway) => gateway,
		Err(e) => {
			error!("failed to initialize storage: {e}");
			return 1;
		},
	};

	let listener = match tokio::net::TcpListener::bind(config.bind).await {
		Ok(listener) => listener,
		Err(e) => {
			error!("failed to bind {}: {e}", config.bind);
			gateway.close().await;
			return 2;
		},
	};

	gateway.start_health(None);
	info!(
		version = env!("CARGO_PKG_VERSION"),
		listen = %config.bind,
		storage_dir = %config.storage_dir.display(),
		"mcp-gateway up"
	);
	if generated {
		info!("management token (auto-generated): {token}");
	}

	let interrupted = Arc::new(AtomicBool::new(false));
	let flag = interrupted.clone();
	let app = gateway
		.app(&token)
		.into_make_service_with_connect_info::<SocketAddr>();
	let result = axum::serve(listener, app)
		.with_graceful_shutdown(async move {
			let _ = tokio::signal::ctrl_c().await;
			flag.store(true, Ordering::SeqCst);
			info!("interrupt received, shutting down");
		})
		.await;

	gateway.close().await;
	match result {
		Err(e) => {
			error!("server error: {e}");
			1
		},
		Ok(()) if interrupted.load(Ordering::SeqCst) => 130,
		Ok(()) => 0,
	}
}

fn generate_token() -> String {
	use rand::RngExt;
	format!("{:032x}", rand::rng().random::<u128>())
}

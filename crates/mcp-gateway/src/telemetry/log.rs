use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global subscriber. `RUST_LOG` wins over the configured
/// level; `json` switches to machine-readable lines.
pub fn setup(level: &str, json: bool) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(format!("mcp_gateway={level},{level}")));
	let registry = tracing_subscriber::registry().with(filter);
	if json {
		registry
			.with(tracing_subscriber::fmt::layer().json())
			.init();
	} else {
		registry.with(tracing_subscriber::fmt::layer()).init();
	}
}

pub mod testing {
	use std::sync::Once;

	static INIT: Once = Once::new();

	/// Best-effort logging for tests; safe to call from every test.
	pub fn setup_test_logging() {
		INIT.call_once(|| {
			let _ = tracing_subscriber::fmt()
				.with_env_filter(
					super::EnvFilter::try_from_default_env()
						.unwrap_or_else(|_| super::EnvFilter::new("info")),
				)
				.with_test_writer()
				.try_init();
		});
	}
}

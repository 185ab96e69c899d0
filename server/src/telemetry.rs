use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_FILTER: &str = "schemaforge=info,schemaforge_server=info,tower_http=info";

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to bridge log records: {0}")]
    Log(#[from] tracing_log::log::SetLoggerError),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Installs the global subscriber.
///
/// Filtering follows `RUST_LOG` (falling back to [`DEFAULT_FILTER`]);
/// `LOG_FORMAT=json` switches to JSON lines. Records emitted through the
/// `log` facade by the storage layer are forwarded into tracing.
pub fn init_tracing() -> Result<(), TelemetryError> {
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    if json_requested(std::env::var("LOG_FORMAT").ok().as_deref()) {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))?;
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer()))?;
    }
    Ok(())
}

fn json_requested(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

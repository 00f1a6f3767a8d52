use tracing::Subscriber;
use tracing::subscriber::set_global_default;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// Log an error using the alternate selector, which emits the full source
/// chain (useful for `StoreError::Database` wrappers).
pub fn log_error(e: impl Into<anyhow::Error>) {
    let e: anyhow::Error = e.into();
    tracing::error!("{e:#}");
}

/// Build the ledger's subscriber.
///
/// `RUST_LOG` takes precedence; `default_filter` applies otherwise. Output
/// goes to stderr, with span close events so instrumented ledger
/// operations report their timing.
pub fn get_subscriber(
    default_filter: &str,
) -> impl Subscriber + Sync + Send {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    Registry::default().with(env_filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .pretty()
            .with_span_events(FmtSpan::CLOSE),
    )
}

/// Register a subscriber as global default to process span data, bridging
/// `log` records into tracing.
///
/// It should only be called once!
pub fn init_subscriber(subscriber: impl Subscriber + Sync + Send) {
    LogTracer::init().expect("Failed to set logger");
    set_global_default(subscriber).expect("Failed to set subscriber");
}

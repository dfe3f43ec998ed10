use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};
use tracing_tree::HierarchicalLayer;

/// Install the global tracing subscriber. `RUST_LOG` wins over the default
/// filter.
pub fn setup_tracing(crate_name: &str) -> color_eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{crate_name}=debug,tower_http=debug")));

    let tree = HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(tree)
        .try_init()?;

    Ok(())
}

/// Start Sentry when `SENTRY_DSN` is set. Keep the guard alive for the life
/// of the process.
pub fn setup_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

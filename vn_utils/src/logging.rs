use eyre::Result;
use tracing_subscriber::{
    self, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, FmtSubscriber,
};

/// Level used when RUST_LOG says nothing. Lifecycle phases log every
/// host state change at info, which is what operators want captured.
const DEFAULT_DIRECTIVES: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

pub fn setup_logging() {
    FmtSubscriber::builder()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .finish()
        .init();
}

/// Journald variant for the long-running daemons. `identifier` becomes
/// the syslog tag, so the fabric manager host can filter per daemon.
pub fn setup_logging_with_journald(identifier: &str) -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .finish()
        .with(tracing_journald::layer()?.with_syslog_identifier(identifier.to_string()))
        .init();

    Ok(())
}

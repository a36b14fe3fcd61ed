//! Logging infrastructure.

#[cfg(feature = "trace")]
pub(crate) mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

    /// Installs the global subscriber.
    ///
    /// Logs always go to stderr so the report printed on stdout stays machine readable.
    /// `MRK_LOG_FORMAT=json` switches to JSON lines and `MRK_DISABLE_LOGS` turns logging off.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var("MRK_DISABLE_LOGS").is_ok() {
            return Ok(());
        }

        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::WARN
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy()
            .add_directive("mio=warn".parse()?);

        let use_json = std::env::var("MRK_LOG_FORMAT")
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);

        let fmt_layer = if use_json {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_thread_names(true)
                .with_writer(std::io::stderr)
                .json()
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_thread_names(true)
                .with_writer(std::io::stderr)
                .boxed()
        };

        tracing_subscriber::registry()
            .with(fmt_layer.with_filter(filter_layer))
            .try_init()?;
        Ok(())
    }
}

/// Installs a `tracing` subscriber reading `RUST_LOG` for its filter directives, unless the
/// `tracing-subscriber` feature is disabled (e.g. when embedding the bus in a host that installs
/// its own subscriber).
pub fn init() {
    #[cfg(feature = "tracing-subscriber")]
    {
        use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

        FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish()
            .init();
    }
}

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Development helper: initialize tracing subscriber when `RUST_LOG` is set.
///
/// Tests and examples can call `capstan::dev_tracing::init_tracing()` to
/// enable structured logging for debugging. This is a no-op when `RUST_LOG`
/// is not set or when a global subscriber is already installed.
pub fn init_tracing() {
    use std::env;

    if env::var("RUST_LOG").is_ok() {
        INIT.get_or_init(|| {
            // Best-effort: try to init a fmt subscriber from env filter.
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        });
    }
}

/// Development helper: initialize tracing subscriber when `RUST_LOG` is set.
///
/// Tests and demos can call `relay::dev_tracing::init_tracing()` to see the
/// `[Loop]`, `[Stream]`, `[Pipe]` ... lifecycle logs. This is a no-op when
/// `RUST_LOG` is not set or when a global subscriber is already installed.
pub fn init_tracing() {
    use std::env;

    if let Ok(filter) = env::var("RUST_LOG") {
        // Best-effort: tests call this once per test binary thread.
        let installed = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();
        if installed.is_ok() {
            tracing::debug!(%filter, "[Tracing] subscriber installed");
        }
    }
}

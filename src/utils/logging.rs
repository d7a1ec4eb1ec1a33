/// Initialize tracing for a binary or a test.
///
/// `default_level` picks the max level by name; anything unrecognized
/// falls back to `info`. Uses `try_init` so repeated calls (tests, the
/// embedded broker inside another process) are harmless.
pub fn init(default_level: &str) {
    let level = match default_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

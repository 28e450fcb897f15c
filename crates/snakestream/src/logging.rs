//! Tracing subscriber setup for the broker binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level applied to the snakestream targets when `RUST_LOG` is not set.
fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn wants_json(log_format: Option<&str>) -> bool {
    log_format.is_some_and(|format| format.eq_ignore_ascii_case("json"))
}

fn filter_directives(level: &str) -> String {
    format!("snakestream={level},snakestream_bridge={level}")
}

/// Install the global subscriber. Output goes to stderr; `LOG_FORMAT=json`
/// switches to the JSON formatter. Later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("SNAKESTREAM_LOG").ok().as_deref());
        EnvFilter::new(filter_directives(level))
    };

    let json = wants_json(std::env::var("LOG_FORMAT").ok().as_deref());

    // Exactly one of the two formatters is present.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}

//! Tracing setup for the demo binaries. The library itself only emits events.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `IPCLINK_LOG` picks the level for this
/// crate (default `info`). `LOG_FORMAT=json` switches to JSON lines.
/// Calling it twice is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("IPCLINK_LOG").ok().as_deref());
        EnvFilter::new(format!("ipclink={level},ipclink::bridge::codec=warn"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn base_level(requested: Option<&str>) -> &'static str {
    match requested {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(base_level(None), "info");
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("debug")), "debug");
        assert_eq!(base_level(Some("loud")), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}

//! Tracing setup shared by the host and worker binaries.
//!
//! Logs always go to stderr: the worker's stdout is the protocol channel.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV;

/// Map an `OVERSEER_LOG` value to a filter level.
pub fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_for(level: &str) -> String {
    format!(
        "overseer={level},overseer_worker={level},overseer::bridge::codec={codec}",
        codec = if level == "trace" { "trace" } else { "warn" }
    )
}

/// Initialize tracing. `RUST_LOG` wins; otherwise `OVERSEER_LOG` picks the
/// level. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var(LOG_ENV).ok().as_deref());
        EnvFilter::new(filter_for(level))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(level_from(None), "info");
        assert_eq!(level_from(Some("warning")), "warn");
        assert_eq!(level_from(Some("debug")), "debug");
        assert_eq!(level_from(Some("loud")), "info");
    }

    #[test]
    fn codec_noise_only_at_trace() {
        assert!(filter_for("debug").contains("overseer::bridge::codec=warn"));
        assert!(filter_for("trace").contains("overseer::bridge::codec=trace"));
    }
}

//! Tracing setup shared by both processes.
//!
//! Logs always go to stderr: in a worker, stdout is the session channel.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level names accepted by `SESSION_LOG`.
pub const LOG_LEVEL_ENV: &str = "SESSION_LOG";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Per-frame codec traces stay off unless `RUST_LOG` asks for them.
const QUIET_TARGETS: &[&str] = &["resilient_session::bridge::codec"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Initialise the global subscriber. `RUST_LOG` wins when set; otherwise
/// `SESSION_LOG` picks the level for the session crates and `extra_targets`.
/// Calling it twice is harmless.
pub fn init_tracing(extra_targets: &[&str]) {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(session_directives(
            session_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref()),
            extra_targets,
        )),
    };
    let format = LogFormat::from_env_value(std::env::var(LOG_FORMAT_ENV).ok().as_deref());

    let (json, text) = match format {
        LogFormat::Json => (Some(fmt::layer().json().with_writer(std::io::stderr)), None),
        LogFormat::Text => (None, Some(fmt::layer().with_writer(std::io::stderr))),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init();
}

fn session_level(value: Option<&str>) -> LevelFilter {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("trace") => LevelFilter::TRACE,
        Some("debug") => LevelFilter::DEBUG,
        Some("warn" | "warning") => LevelFilter::WARN,
        Some("error") => LevelFilter::ERROR,
        Some("off") => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

fn session_directives(level: LevelFilter, extra_targets: &[&str]) -> String {
    std::iter::once(format!("resilient_session={level}"))
        .chain(QUIET_TARGETS.iter().map(|target| format!("{target}=off")))
        .chain(extra_targets.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(session_level(None), LevelFilter::INFO);
        assert_eq!(session_level(Some("verbose")), LevelFilter::INFO);
        assert_eq!(session_level(Some("Warning")), LevelFilter::WARN);
        assert_eq!(session_level(Some("off")), LevelFilter::OFF);
    }

    #[test]
    fn host_targets_share_the_level() {
        assert_eq!(
            session_directives(LevelFilter::WARN, &["session_host"]),
            "resilient_session=warn,resilient_session::bridge::codec=off,session_host=warn"
        );
        assert_eq!(
            session_directives(LevelFilter::INFO, &[]),
            "resilient_session=info,resilient_session::bridge::codec=off"
        );
    }

    #[test]
    fn json_format_is_opt_in() {
        assert_eq!(LogFormat::from_env_value(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some("pretty")), LogFormat::Text);
        assert_eq!(LogFormat::from_env_value(None), LogFormat::Text);
    }
}

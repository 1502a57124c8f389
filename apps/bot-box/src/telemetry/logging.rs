use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

// Holding the guard keeps the background writer alive for the whole process.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Calls after the first successful one are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let directives = match std::env::var("BOT_BOX_LOG_FILTER") {
        Ok(custom) => Directives {
            filter: custom,
            throttled: false,
        },
        Err(_) => Directives::for_level(config.level.to_filter(), allow_dependency_traces()),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&directives.filter))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);

    if directives.throttled {
        tracing::info!(
            "webrtc and websocket internals capped at info; set BOT_BOX_TRACE_DEPS=1 or BOT_BOX_LOG_FILTER to see them"
        );
    }
    Ok(())
}

// Crates that flood the log at trace level during ICE and DTLS setup.
const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_mdns",
    "webrtc_srtp",
    "tokio_tungstenite",
    "tungstenite",
    "zeromq",
    "mio",
];

#[derive(Debug, PartialEq, Eq)]
struct Directives {
    filter: String,
    throttled: bool,
}

impl Directives {
    fn for_level(level: LevelFilter, allow_deps: bool) -> Self {
        let ours = match level {
            LevelFilter::TRACE => "info,bot_box=trace,arena_proto=trace",
            LevelFilter::DEBUG => "info,bot_box=debug,arena_proto=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        let throttled = level >= LevelFilter::DEBUG && !allow_deps;
        let mut filter = ours.to_owned();
        if throttled {
            for target in NOISY_DEPENDENCIES {
                filter.push_str(&format!(",{target}=info"));
            }
        }
        Self { filter, throttled }
    }
}

fn allow_dependency_traces() -> bool {
    super::env_truthy("BOT_BOX_TRACE_DEPS").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_levels_throttle_dependencies_by_default() {
        let directives = Directives::for_level(LevelFilter::TRACE, false);
        assert!(directives.throttled);
        assert!(directives.filter.starts_with("info,bot_box=trace"));
        assert!(directives.filter.contains("webrtc_ice=info"));
        assert!(directives.filter.contains("zeromq=info"));
    }

    #[test]
    fn dependency_traces_can_be_allowed() {
        assert_eq!(
            Directives::for_level(LevelFilter::DEBUG, true),
            Directives {
                filter: "info,bot_box=debug,arena_proto=debug".into(),
                throttled: false,
            }
        );
    }

    #[test]
    fn quiet_levels_pass_through() {
        let directives = Directives::for_level(LevelFilter::WARN, false);
        assert_eq!(directives.filter, "warn");
        assert!(!directives.throttled);
        assert_eq!(LogLevel::default().to_filter(), LevelFilter::INFO);
    }
}

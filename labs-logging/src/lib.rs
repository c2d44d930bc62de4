use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter, Layer};

/// Where log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// The `logging:` section of `labs.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            file_path: PathBuf::from("/tmp/labsd.log"),
        }
    }
}

impl LoggingConfig {
    fn writes_console(&self) -> bool {
        matches!(self.output, LogOutput::Console | LogOutput::Both)
    }

    fn writes_file(&self) -> bool {
        matches!(self.output, LogOutput::File | LogOutput::Both)
    }
}

/// Build the level filter. `RUST_LOG` takes precedence over the configured level.
pub fn build_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    for directive in ["tokio=warn", "sqlx=warn", "hyper=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

fn fmt_layer<S, W>(writer: W, format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_target(true);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Human => layer.boxed(),
    }
}

/// Initializes the global tracing subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process. Calling this twice is harmless, the second
/// initialization is ignored.
pub fn init_subscriber(config: &LoggingConfig) -> Option<WorkerGuard> {
    let mut guard = None;
    let mut layers = Vec::new();

    if config.writes_console() {
        layers.push(fmt_layer(std::io::stdout, config.format));
    }

    if config.writes_file() {
        let log_dir = config
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("/tmp"));
        let log_filename = config
            .file_path
            .file_name()
            .unwrap_or_else(|| "labsd.log".as_ref());

        let appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        layers.push(fmt_layer(non_blocking, config.format));
    }

    let _ = registry()
        .with(build_filter(&config.level))
        .with(layers)
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_logs_to_console() {
        let config = LoggingConfig::default();
        assert!(config.writes_console());
        assert!(!config.writes_file());
    }

    #[test]
    fn both_writes_everywhere() {
        let config = LoggingConfig {
            output: LogOutput::Both,
            ..Default::default()
        };
        assert!(config.writes_console());
        assert!(config.writes_file());
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LoggingConfig {
            output: LogOutput::None,
            ..Default::default()
        };
        assert!(init_subscriber(&config).is_none());
        assert!(init_subscriber(&config).is_none());
    }
}

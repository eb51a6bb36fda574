use std::fmt;
use std::path::Path;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{Directive, EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::Config;

/// Environment variable overriding `Config::log_level`.
pub const LOG_ENV: &str = "ZQ_LOG";

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> FmtLevel<'a> {
    fn new(level: &'a Level, ansi: bool) -> Self {
        Self { level, ansi }
    }
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self.level {
            Level::TRACE => TRACE_STR,
            Level::DEBUG => DEBUG_STR,
            Level::INFO => INFO_STR,
            Level::WARN => WARN_STR,
            Level::ERROR => ERROR_STR,
        };
        if !self.ansi {
            return f.pad(s);
        }
        let colour = match *self.level {
            Level::TRACE => Colour::Purple,
            Level::DEBUG => Colour::Blue,
            Level::INFO => Colour::Green,
            Level::WARN => Colour::Yellow,
            Level::ERROR => Colour::Red,
        };
        write!(f, "{}", colour.paint(s))
    }
}

/// `[<utc time> <level> <file>:<line>] <fields>`
struct QueueFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for QueueFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let fmt_level = FmtLevel::new(metadata.level(), self.ansi && writer.has_ansi_escapes());

        write!(
            writer,
            "[{} {} {}:{}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            fmt_level,
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    let directive = default_level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    EnvFilter::builder()
        .with_default_directive(directive)
        .with_env_var(LOG_ENV)
        .from_env_lossy()
}

/// Installs the global subscriber. Returns the file writer's guard when `log_file` is set; keep
/// it alive for as long as events should be flushed to the file.
///
/// Calling this when a subscriber is already installed leaves the existing one in place.
pub fn init_log(config: &Config, ansi: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .event_format(QueueFormatter { ansi })
        .with_writer(std::io::stderr)
        .with_filter(env_filter(&config.log_level));

    let registry = tracing_subscriber::registry().with(stderr_layer);

    match config.log_file.as_deref() {
        Some(log_file) => {
            let path = Path::new(log_file);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().unwrap_or(path.as_os_str());
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(QueueFormatter { ansi: false })
                .with_writer(non_blocking)
                .with_filter(env_filter(&config.log_level));
            if registry.with(file_layer).try_init().is_ok() {
                tracing::info!("tracing-log initialized, writing to {}", log_file);
            }
            Some(guard)
        }
        None => {
            if registry.try_init().is_ok() {
                tracing::info!("tracing-log initialized");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_padding_without_ansi() {
        let level = Level::INFO;
        assert_eq!(format!("{}", FmtLevel::new(&level, false)), " INFO");
        let level = Level::ERROR;
        assert_eq!(format!("{:>5}", FmtLevel::new(&level, false)), "ERROR");
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = Config::default();
        assert!(init_log(&config, false).is_none());
        assert!(init_log(&config, false).is_none());
    }
}

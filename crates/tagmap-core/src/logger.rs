//! Run logging for the map builder and the CLI.
//!
//! [`init_with_level`] installs a `log` backend writing to stderr:
//!
//! ```text
//! [   0.153s  INFO builder::driver] added viewpoint `3`
//! ```
//!
//! Targets inside this workspace drop their `tagmap_` prefix. With the
//! `tracing` feature, [`init_tracing`] installs a subscriber that also reports
//! span timings of the refinement stages.

use std::fmt::Arguments;
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record};

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::util::SubscriberInitExt;
#[cfg(feature = "tracing")]
use tracing_subscriber::{fmt, EnvFilter};

const WORKSPACE_PREFIX: &str = "tagmap_";

fn short_target(target: &str) -> &str {
    target.strip_prefix(WORKSPACE_PREFIX).unwrap_or(target)
}

fn render(elapsed: f64, level: Level, target: &str, args: &Arguments<'_>) -> String {
    format!(
        "[{elapsed:8.3}s {level:>5} {}] {args}",
        short_target(target)
    )
}

struct RunLogger {
    level: LevelFilter,
    started: Instant,
}

impl Log for RunLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = render(
            self.started.elapsed().as_secs_f64(),
            record.level(),
            record.target(),
            record.args(),
        );
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<RunLogger> = OnceLock::new();

/// Install the stderr logger. The first call fixes the level.
///
/// Fails only if another `log` backend is already installed.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = LOGGER.get_or_init(|| RunLogger {
        level,
        started: Instant::now(),
    });
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

/// Install a `tracing` subscriber; `RUST_LOG` overrides `default_directive`.
///
/// Span close events carry the time spent in each solver stage. A subscriber
/// installed earlier is left in place.
#[cfg(feature = "tracing")]
pub fn init_tracing(default_directive: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE);
    let _ = if json {
        builder.json().flatten_event(true).finish().try_init()
    } else {
        builder
            .with_timer(fmt::time::Uptime::default())
            .with_target(true)
            .finish()
            .try_init()
    };
}

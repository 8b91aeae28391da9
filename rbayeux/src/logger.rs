use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::anyhow;
use slog::{o, Drain};
pub use slog::Logger;
pub use slog_scope::GlobalLoggerGuard;

use crate::conf::logging::{Log, To};
use crate::Result;

/// Installs the configured logger as the global `slog` logger and routes the
/// `log` facade into it. Keep the returned guard alive for the process lifetime.
pub fn logger_init(cfg: &Log) -> Result<GlobalLoggerGuard> {
    let logger = config_logger(cfg)?;
    let guard = slog_scope::set_global_logger(logger);
    let level = cfg.level.level_filter().to_level().unwrap_or(log::Level::Info);
    slog_stdlog::init_with_level(level).map_err(|e| anyhow!("logger init failed, {}", e))?;
    log::set_max_level(cfg.level.level_filter());
    Ok(guard)
}

pub fn config_logger(cfg: &Log) -> Result<Logger> {
    if cfg.to.off() {
        return Ok(Logger::root(slog::Discard, o!()));
    }
    let out = WriteFilter::new(&cfg.filename(), cfg.to)?;
    let decorator = slog_term::PlainSyncDecorator::new(out);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, cfg.level.inner()).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Ok(Logger::root(drain, o!()))
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: &str, to: To) -> Result<Self> {
        let file = if to.file() { Some(open_file(filename)?) } else { None };
        Ok(Self { to, file, console: io::stdout() })
    }
}

impl Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow!("logger file config error, filename: {}, {:?}", filename, e).into())
}

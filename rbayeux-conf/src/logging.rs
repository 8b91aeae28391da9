use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    #[inline]
    fn to_default() -> To {
        To::Console
    }
    #[inline]
    fn level_default() -> Level {
        Level { inner: slog::Level::Info }
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/rbayeux".into()
    }
    #[inline]
    fn file_default() -> String {
        "rbayeux.log".into()
    }

    /// Full path of the log file, `dir` joined with `file`
    #[inline]
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return String::new();
        }
        let dir = self.dir.trim_end_matches(['/', '\\']);
        if dir.is_empty() {
            self.file.clone()
        } else {
            format!("{dir}/{}", self.file)
        }
    }
}

/// Where log records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "String")]
pub struct Level {
    inner: slog::Level,
}

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.inner
    }

    /// The matching `log` crate filter, used to configure the `log` facade
    #[inline]
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.inner {
            slog::Level::Critical | slog::Level::Error => log::LevelFilter::Error,
            slog::Level::Warning => log::LevelFilter::Warn,
            slog::Level::Info => log::LevelFilter::Info,
            slog::Level::Debug => log::LevelFilter::Debug,
            slog::Level::Trace => log::LevelFilter::Trace,
        }
    }
}

impl TryFrom<String> for Level {
    type Error = String;

    fn try_from(level: String) -> Result<Self, Self::Error> {
        slog::Level::from_str(&level)
            .map(|inner| Level { inner })
            .map_err(|_| format!("invalid log level `{level}`"))
    }
}

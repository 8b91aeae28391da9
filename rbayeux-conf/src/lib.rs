#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File, Source};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use rbayeux_utils::deserialize_duration;

use self::logging::Log;

pub mod logging;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

/// The five protocol meta channels.
pub const META_CHANNELS: [&str; 5] =
    ["/meta/handshake", "/meta/connect", "/meta/subscribe", "/meta/unsubscribe", "/meta/disconnect"];

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub bayeux: Bayeux,
    #[serde(default)]
    pub plugins: Plugins,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    /// Loads `/etc/rbayeux/rbayeux.toml`, `./rbayeux.toml`, the optional `cfg_name`
    /// file and finally `RBAYEUX_*` environment variables, later sources winning.
    pub fn load(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rbayeux/rbayeux").required(false))
            .add_source(File::with_name("rbayeux").required(false));

        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("rbayeux")
                .separator("__")
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("bayeux.extension_meta_channels"),
        );

        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    /// Parses settings from a TOML document, used by embedders and tests.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let inner: Inner = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(cfg_name: Option<&str>) -> Result<&'static Self> {
        SETTINGS.set(Settings::load(cfg_name)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("log config is: {:?}", self.log);
        log::info!("bayeux config is: {:?}", self.bayeux);
        log::info!("plugins dir is {}", self.plugins.dir);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bayeux {
    //Retry interval advised to clients after handshake and connect.
    #[serde(default = "Bayeux::handshake_interval_default", deserialize_with = "deserialize_duration")]
    pub handshake_interval: Duration,
    //Long-poll hold time advised to clients on /meta/connect.
    #[serde(default = "Bayeux::connect_timeout_default", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    //Remote sessions idle longer than this are removed as expired.
    #[serde(default = "Bayeux::max_session_idle_default", deserialize_with = "deserialize_duration")]
    pub max_session_idle: Duration,
    #[serde(default = "Bayeux::sweep_interval_default", deserialize_with = "deserialize_duration")]
    pub sweep_interval: Duration,
    //Upper bound for a single security policy decision; elapsing means deny.
    #[serde(default = "Bayeux::security_timeout_default", deserialize_with = "deserialize_duration")]
    pub security_timeout: Duration,
    //Deliver a publish back to the publishing session when it is subscribed.
    #[serde(default)]
    pub broadcast_to_publisher: bool,
    //Per remote session outbound queue bound, 0 is unbounded.
    #[serde(default = "Bayeux::max_queue_default")]
    pub max_queue: usize,
    //Meta channels that go through the extension pipeline.
    #[serde(default = "Bayeux::extension_meta_channels_default")]
    pub extension_meta_channels: Vec<String>,
}

impl Default for Bayeux {
    #[inline]
    fn default() -> Self {
        Self {
            handshake_interval: Self::handshake_interval_default(),
            connect_timeout: Self::connect_timeout_default(),
            max_session_idle: Self::max_session_idle_default(),
            sweep_interval: Self::sweep_interval_default(),
            security_timeout: Self::security_timeout_default(),
            broadcast_to_publisher: false,
            max_queue: Self::max_queue_default(),
            extension_meta_channels: Self::extension_meta_channels_default(),
        }
    }
}

impl Bayeux {
    fn handshake_interval_default() -> Duration {
        Duration::ZERO
    }
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn max_session_idle_default() -> Duration {
        Duration::from_secs(60)
    }
    fn sweep_interval_default() -> Duration {
        Duration::from_secs(1)
    }
    fn security_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn max_queue_default() -> usize {
        10_000
    }
    fn extension_meta_channels_default() -> Vec<String> {
        META_CHANNELS.iter().map(|c| c.to_string()).collect()
    }

    /// Whether extensions run for the given meta channel.
    #[inline]
    pub fn extensions_apply_to_meta(&self, channel: &str) -> bool {
        self.extension_meta_channels.iter().any(|c| c == channel)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Plugins {
    #[serde(default = "Plugins::dir_default")]
    pub dir: String,
}

impl Default for Plugins {
    fn default() -> Self {
        Self { dir: Self::dir_default() }
    }
}

impl Plugins {
    fn dir_default() -> String {
        "./rbayeux-plugins/".into()
    }

    /// Loads `<dir>/<name>.toml`; the file must exist.
    pub fn load_config<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let (cfg, _) = self.load_config_with_required(name, true)?;
        Ok(cfg)
    }

    /// Like [`Plugins::load_config`], falling back to serde defaults when nothing is configured.
    pub fn load_config_default<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let (cfg, def) = self.load_config_with_required(name, false)?;
        if def {
            log::warn!("The configuration for plugin '{name}' does not exist, default values will be used!");
        }
        Ok(cfg)
    }

    fn load_config_with_required<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        required: bool,
    ) -> Result<(T, bool)> {
        let dir = self.dir.trim_end_matches(['/', '\\']);
        let s = Config::builder()
            .add_source(File::with_name(&format!("{dir}/{name}")).required(required))
            .add_source(
                config::Environment::with_prefix(&format!("rbayeux_plugin_{}", name.replace('-', "_")))
                    .separator("__"),
            )
            .build()?;
        let count = s.collect()?.len();
        Ok((s.try_deserialize::<T>()?, count == 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.bayeux.max_session_idle, Duration::from_secs(60));
        assert_eq!(s.bayeux.security_timeout, Duration::from_secs(5));
        assert!(!s.bayeux.broadcast_to_publisher);
        for c in META_CHANNELS {
            assert!(s.bayeux.extensions_apply_to_meta(c));
        }
        assert!(s.log.to.console());
        assert_eq!(s.log.filename(), "/var/log/rbayeux/rbayeux.log");
    }

    #[test]
    fn test_from_toml() {
        let s = Settings::from_toml(
            r#"
            [log]
            to = "both"
            level = "debug"
            dir = ""
            file = "bus.log"

            [bayeux]
            max_session_idle = "2m"
            security_timeout = "250ms"
            broadcast_to_publisher = true
            extension_meta_channels = ["/meta/handshake"]
            "#,
        )
        .expect("valid toml");
        assert!(s.log.to.file() && s.log.to.console());
        assert_eq!(s.log.level.level_filter(), log::LevelFilter::Debug);
        assert_eq!(s.log.filename(), "bus.log");
        assert_eq!(s.bayeux.max_session_idle, Duration::from_secs(120));
        assert_eq!(s.bayeux.security_timeout, Duration::from_millis(250));
        assert!(s.bayeux.broadcast_to_publisher);
        assert!(s.bayeux.extensions_apply_to_meta("/meta/handshake"));
        assert!(!s.bayeux.extensions_apply_to_meta("/meta/connect"));
        assert_eq!(s.bayeux.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_bad_log_target() {
        assert!(Settings::from_toml("[log]\nto = \"syslog\"\n").is_err());
    }
}

use std::sync::OnceLock;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;

use crate::types::Transport;

pub static CONFIG: OnceLock<RelayConfig> = OnceLock::new();

/// Loads configuration from `config.toml` (or `$RELAY_CONFIG`), layered with
/// `RELAY_`-prefixed environment variables, which win on conflict.
pub fn init() -> RelayConfig {
    let raw = Figment::new()
        .merge(Toml::file(
            Env::var("RELAY_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("RELAY_").global());

    match raw.extract::<RelayConfig>() {
        Ok(config) => {
            let _ = CONFIG.set(config.clone());
            config
        }
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    }
}

pub fn get() -> &'static RelayConfig {
    CONFIG.get().expect("config should be initialized before use")
}

#[derive(Deserialize, Clone, Debug)]
pub struct RelayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    #[serde(default = "default_target_width")]
    pub target_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u32,
    #[serde(default = "default_transport_order")]
    pub transport_order: Vec<Transport>,
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u64,
    #[serde(default = "default_freeze_threshold_seconds")]
    pub freeze_threshold_seconds: u64,
    #[serde(default = "default_terminate_timeout_seconds")]
    pub terminate_timeout_seconds: u64,
    #[serde(default = "default_splitter_max_buffer_bytes")]
    pub splitter_max_buffer_bytes: usize,
    #[serde(default)]
    pub log: LogConfig,
    /// Seed entries for the in-memory stream catalog. A real deployment would
    /// back the catalog with a database or discovery service instead.
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StreamConfig {
    pub id: String,
    pub url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            target_fps: default_target_fps(),
            target_width: default_target_width(),
            jpeg_quality: default_jpeg_quality(),
            transport_order: default_transport_order(),
            grace_period_seconds: default_grace_period_seconds(),
            freeze_threshold_seconds: default_freeze_threshold_seconds(),
            terminate_timeout_seconds: default_terminate_timeout_seconds(),
            splitter_max_buffer_bytes: default_splitter_max_buffer_bytes(),
            log: LogConfig::default(),
            streams: Vec::new(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".into()
}
fn default_target_fps() -> u32 {
    15
}
fn default_target_width() -> u32 {
    640
}
fn default_jpeg_quality() -> u32 {
    1
}
fn default_transport_order() -> Vec<Transport> {
    vec![Transport::Tcp]
}
fn default_grace_period_seconds() -> u64 {
    10
}
fn default_freeze_threshold_seconds() -> u64 {
    10
}
fn default_terminate_timeout_seconds() -> u64 {
    3
}
fn default_splitter_max_buffer_bytes() -> usize {
    1024 * 1024
}

const FORMAT_PRETTY: &str = "pretty";
const FORMAT_COMPACT: &str = "compact";

#[derive(Deserialize, Clone, Debug)]
pub struct LogConfig {
    #[serde(default = "default_filter_level")]
    pub filter_level: String,
    #[serde(default = "default_true")]
    pub with_ansi: bool,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            with_ansi: true,
            format: default_format(),
        }
    }
}

fn default_filter_level() -> String {
    "info".into()
}
fn default_format() -> String {
    "full".into()
}
fn default_true() -> bool {
    true
}

impl LogConfig {
    /// Initializes the global tracing subscriber. Caller must hold the
    /// returned guard for the lifetime of the process, or buffered log lines
    /// are lost on exit.
    pub fn init_tracing(&self) -> WorkerGuard {
        let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.filter_level)),
            )
            .with_ansi(self.with_ansi)
            .with_writer(non_blocking);

        match &*self.format {
            FORMAT_PRETTY => subscriber.pretty().init(),
            FORMAT_COMPACT => subscriber.compact().init(),
            _ => subscriber.init(),
        }

        guard
    }
}

//! YAML configuration and the rules for merging command line flags into it.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration: one UDP receiver on port 10110 writing to standard out.

use std::{collections::HashMap, path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    chunker::{ChunkMode, ChunkerKind},
    error::ConfigError,
    listener::{ReceiverProtocol, TcpClientOptions},
    monitor::ExceptionPolicy,
    packet::DEFAULT_DELIMITER,
    sink::{DataFormat, SinkConfig},
    transmitter::TransmitterProtocol,
};

pub const DEFAULT_PORT: u16 = 10110;

/// Converts a number of seconds from the config into a `Duration`.
pub(crate) fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        ConfigError::invalid(field, format!("{value} is not a non-negative number of seconds"))
    })
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub receivers: Vec<ReceiverConfig>,
    pub sinks: Vec<SinkConfig>,
    pub transmitter: TransmitterConfig,
    pub monitor: MonitorConfig,
    /// Provider name per source host.
    pub source_names: HashMap<String, String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for receiver in &self.receivers {
            receiver.validate()?;
        }
        for sink in &self.sinks {
            sink.validate()?;
        }
        self.transmitter.validate()?;
        self.monitor.validate()
    }

    /// The receivers to run once command line flags are applied.
    ///
    /// Flags address a single receiver, so they are rejected when the file declares several.
    pub fn resolve_receivers(
        &self,
        overrides: &ReceiverOverrides,
    ) -> Result<Vec<ReceiverConfig>, ConfigError> {
        let mut receivers = self.receivers.clone();
        match receivers.len() {
            0 => receivers.push(ReceiverConfig::default()),
            1 => {}
            _ if overrides.is_empty() => return Ok(receivers),
            n => {
                return Err(ConfigError::invalid(
                    "receivers",
                    format!("{n} receivers configured, command line flags cannot pick one"),
                ))
            }
        }
        for receiver in &mut receivers {
            overrides.apply(receiver);
            receiver.validate()?;
        }
        Ok(receivers)
    }

    /// File sinks plus sinks requested on the command line; stdout when none are given.
    pub fn resolve_sinks(&self, overrides: &SinkOverrides) -> Result<Vec<SinkConfig>, ConfigError> {
        let mut sinks = self.sinks.clone();
        let data_format = overrides.data_format.unwrap_or_default();
        if overrides.stdout {
            sinks.push(SinkConfig::Stdout { data_format });
        }
        if let Some(endpoint) = &overrides.upload_endpoint {
            sinks.push(SinkConfig::Http {
                endpoint: endpoint.clone(),
                auth_token: overrides.auth_token.clone(),
                data_format,
                queue_capacity: 1000,
                recycle_interval: 55.0,
            });
        }
        if sinks.is_empty() {
            sinks.push(SinkConfig::Stdout { data_format });
        }
        for sink in &sinks {
            sink.validate()?;
        }
        Ok(sinks)
    }

    pub fn resolve_transmitter(
        &self,
        overrides: &TransmitterOverrides,
    ) -> Result<TransmitterConfig, ConfigError> {
        let mut transmitter = self.transmitter.clone();
        overrides.apply(&mut transmitter);
        transmitter.validate()?;
        Ok(transmitter)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiverConfig {
    pub protocol: ReceiverProtocol,
    pub host: String,
    pub port: u16,
    pub source_name: Option<String>,
    pub max_packet_size: usize,
    pub delimiter: String,
    pub connect_string: Option<String>,
    /// Reconnect attempts after the first failed connect. Unbounded when absent.
    pub max_retries: Option<u32>,
    pub init_retry_delay: f64,
    pub max_retry_delay: f64,
    /// Seconds a TCP client waits for the connection to be established.
    pub connect_timeout: f64,
    /// Seconds of silence after which a TCP client reconnects.
    pub read_timeout: f64,
    pub queue_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            protocol: ReceiverProtocol::Udp,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            source_name: None,
            max_packet_size: 4096,
            delimiter: DEFAULT_DELIMITER.to_string(),
            connect_string: None,
            max_retries: None,
            init_retry_delay: 1.0,
            max_retry_delay: 60.0,
            connect_timeout: 10.0,
            read_timeout: 60.0,
            queue_capacity: 1024,
        }
    }
}

impl ReceiverConfig {
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::invalid("max_packet_size", "must be at least 1"));
        }
        if self.delimiter.is_empty() {
            return Err(ConfigError::invalid("delimiter", "must not be empty"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        let init = seconds("init_retry_delay", self.init_retry_delay)?;
        let max = seconds("max_retry_delay", self.max_retry_delay)?;
        if init > max {
            return Err(ConfigError::invalid(
                "init_retry_delay",
                format!("{init:?} is larger than max_retry_delay {max:?}"),
            ));
        }
        for (field, value) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
        ] {
            if seconds(field, value)?.is_zero() {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        Ok(())
    }

    pub fn tcp_client_options(&self) -> Result<TcpClientOptions, ConfigError> {
        Ok(TcpClientOptions {
            max_packet_size: self.max_packet_size,
            connect_string: self.connect_string.clone(),
            max_retries: self.max_retries,
            init_retry_delay: seconds("init_retry_delay", self.init_retry_delay)?,
            max_retry_delay: seconds("max_retry_delay", self.max_retry_delay)?,
            connect_timeout: seconds("connect_timeout", self.connect_timeout)?,
            read_timeout: seconds("read_timeout", self.read_timeout)?,
            queue_capacity: self.queue_capacity,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransmitterConfig {
    pub protocol: TransmitterProtocol,
    /// Destination for UDP, bind address for TCP_server.
    pub host: String,
    pub port: u16,
    /// Seconds between two chunks.
    pub delay: f64,
    pub chunk_size: usize,
    pub chunker: ChunkerKind,
    pub lenient: bool,
    /// Only send this many lines of every file.
    pub first_n: Option<usize>,
    /// Replay the source from the start after the last file.
    pub repeat: bool,
    pub delimiter: String,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        TransmitterConfig {
            protocol: TransmitterProtocol::Udp,
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            delay: 1.0,
            chunk_size: 50,
            chunker: ChunkerKind::Multipart,
            lenient: false,
            first_n: None,
            repeat: false,
            delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }
}

impl TransmitterConfig {
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    pub fn chunk_mode(&self) -> ChunkMode {
        if self.lenient {
            ChunkMode::Lenient
        } else {
            ChunkMode::Strict
        }
    }

    pub fn delay(&self) -> Result<Duration, ConfigError> {
        seconds("delay", self.delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size", "must be at least 1"));
        }
        if self.delimiter.is_empty() {
            return Err(ConfigError::invalid("delimiter", "must not be empty"));
        }
        self.delay()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Seconds between two checks.
    pub interval: f64,
    pub exception_policy: ExceptionPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            enabled: true,
            interval: 5.0,
            exception_policy: ExceptionPolicy::Any,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        let interval = seconds("monitor.interval", self.interval)?;
        if interval.is_zero() {
            return Err(ConfigError::invalid("monitor.interval", "must be positive"));
        }
        Ok(interval)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interval().map(|_| ())
    }
}

/// Receiver settings given on the command line. `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct ReceiverOverrides {
    pub protocol: Option<ReceiverProtocol>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub source_name: Option<String>,
    pub max_packet_size: Option<usize>,
    pub delimiter: Option<String>,
    pub connect_string: Option<String>,
    pub max_retries: Option<u32>,
    pub init_retry_delay: Option<f64>,
    pub max_retry_delay: Option<f64>,
    pub connect_timeout: Option<f64>,
    pub read_timeout: Option<f64>,
    pub queue_capacity: Option<usize>,
}

macro_rules! override_fields {
    ($overrides:expr, $target:expr, [$($field:ident),* $(,)?], [$($optional:ident),* $(,)?]) => {
        $(
            if let Some(value) = &$overrides.$field {
                $target.$field = value.clone();
            }
        )*
        $(
            if let Some(value) = &$overrides.$optional {
                $target.$optional = Some(value.clone());
            }
        )*
    };
}

impl ReceiverOverrides {
    pub fn is_empty(&self) -> bool {
        self.protocol.is_none()
            && self.host.is_none()
            && self.port.is_none()
            && self.source_name.is_none()
            && self.max_packet_size.is_none()
            && self.delimiter.is_none()
            && self.connect_string.is_none()
            && self.max_retries.is_none()
            && self.init_retry_delay.is_none()
            && self.max_retry_delay.is_none()
            && self.connect_timeout.is_none()
            && self.read_timeout.is_none()
            && self.queue_capacity.is_none()
    }

    pub fn apply(&self, config: &mut ReceiverConfig) {
        override_fields!(
            self,
            config,
            [
                protocol,
                host,
                port,
                max_packet_size,
                delimiter,
                init_retry_delay,
                max_retry_delay,
                connect_timeout,
                read_timeout,
                queue_capacity,
            ],
            [source_name, connect_string, max_retries]
        );
    }
}

/// Sinks requested on the command line.
#[derive(Debug, Clone, Default)]
pub struct SinkOverrides {
    pub stdout: bool,
    pub upload_endpoint: Option<String>,
    pub auth_token: Option<String>,
    pub data_format: Option<DataFormat>,
}

#[derive(Debug, Clone, Default)]
pub struct TransmitterOverrides {
    pub protocol: Option<TransmitterProtocol>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub delay: Option<f64>,
    pub chunk_size: Option<usize>,
    pub chunker: Option<ChunkerKind>,
    pub lenient: bool,
    pub first_n: Option<usize>,
    pub repeat: bool,
    pub delimiter: Option<String>,
}

impl TransmitterOverrides {
    pub fn apply(&self, config: &mut TransmitterConfig) {
        override_fields!(
            self,
            config,
            [protocol, host, port, delay, chunk_size, chunker, delimiter],
            [first_n]
        );
        config.lenient |= self.lenient;
        config.repeat |= self.repeat;
    }
}

//! Downstream destinations for received packets.

mod http;
mod stdout;

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub use http::HttpSink;
pub use stdout::StdoutSink;

use crate::{
    ais_reformatter::tag_messages,
    error::{ConfigError, SinkError},
    packet::Packet,
};

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, packet: &Packet) -> Result<(), SinkError>;
}

/// How a packet is laid out for a line-oriented sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum DataFormat {
    /// The payload exactly as received.
    #[default]
    Raw,
    /// One line per message.
    Split,
    /// One line per message, prefixed with a provenance tag block.
    Tagblock,
}

impl FromStr for DataFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(DataFormat::Raw),
            "split" => Ok(DataFormat::Split),
            "tagblock" => Ok(DataFormat::Tagblock),
            _ => Err(ConfigError::UnknownDataFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for DataFormat {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Raw => f.write_str("raw"),
            DataFormat::Split => f.write_str("split"),
            DataFormat::Tagblock => f.write_str("tagblock"),
        }
    }
}

/// Newline-terminated bytes for `packet` in the requested layout.
pub fn format_packet(packet: &Packet, format: DataFormat) -> Vec<u8> {
    match format {
        DataFormat::Raw => {
            let mut data = packet.data().to_vec();
            if !data.is_empty() && !data.ends_with(b"\n") {
                data.push(b'\n');
            }
            data
        }
        DataFormat::Split => {
            let mut data = Vec::with_capacity(packet.data().len() + 1);
            for message in packet.messages() {
                data.extend_from_slice(message);
                data.push(b'\n');
            }
            data
        }
        DataFormat::Tagblock => tag_messages(packet).concat(),
    }
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_recycle_interval() -> f64 {
    55.0
}

/// Sink declarations as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Stdout {
        #[serde(default)]
        data_format: DataFormat,
    },
    Http {
        endpoint: String,
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default)]
        data_format: DataFormat,
        #[serde(default = "default_queue_capacity")]
        queue_capacity: usize,
        #[serde(default = "default_recycle_interval")]
        recycle_interval: f64,
    },
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            SinkConfig::Stdout { .. } => Ok(()),
            SinkConfig::Http {
                endpoint,
                queue_capacity,
                recycle_interval,
                ..
            } => {
                Url::parse(endpoint)
                    .map_err(|e| ConfigError::invalid("endpoint", format!("{endpoint}: {e}")))?;
                if *queue_capacity == 0 {
                    return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
                }
                if crate::config::seconds("recycle_interval", *recycle_interval)?.is_zero() {
                    return Err(ConfigError::invalid("recycle_interval", "must be positive"));
                }
                Ok(())
            }
        }
    }

    /// Constructs the sink. HTTP sinks start their uploader on the current runtime.
    pub fn build(&self, shutdown_token: &CancellationToken) -> Result<Arc<dyn Sink>, ConfigError> {
        self.validate()?;
        Ok(match self {
            SinkConfig::Stdout { data_format } => Arc::new(StdoutSink::new(*data_format)),
            SinkConfig::Http {
                endpoint,
                auth_token,
                data_format,
                queue_capacity,
                recycle_interval,
            } => {
                let url = Url::parse(endpoint)
                    .map_err(|e| ConfigError::invalid("endpoint", e.to_string()))?;
                Arc::new(HttpSink::spawn(
                    url,
                    auth_token.as_deref().map(Arc::from),
                    *data_format,
                    *queue_capacity,
                    Duration::from_secs_f64(*recycle_interval),
                    shutdown_token.child_token(),
                ))
            }
        })
    }
}

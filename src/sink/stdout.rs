use std::io::Write;

use async_trait::async_trait;

use super::{format_packet, DataFormat, Sink};
use crate::{
    error::{SinkError, SinkErrorKind},
    packet::Packet,
};

/// Writes every packet to standard out.
pub struct StdoutSink {
    data_format: DataFormat,
}

impl StdoutSink {
    pub fn new(data_format: DataFormat) -> Self {
        StdoutSink { data_format }
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn publish(&self, packet: &Packet) -> Result<(), SinkError> {
        let data = format_packet(packet, self.data_format);
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(&data)
            .and_then(|_| stdout.flush())
            .map_err(|e| SinkError::new(self.name(), SinkErrorKind::Io, e.to_string()))
    }
}

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, error, info, trace};

use crate::{
    monitor::ErrorRegistry,
    packet::{Packet, Protocol, DEFAULT_DELIMITER, DEFAULT_SOURCE_NAME},
    sink::Sink,
};

/// Turns raw reads into Packets and hands them to every configured sink.
///
/// Sink failures are logged and recorded in the shared registry, never returned, so a
/// failing sink cannot stop the network loop that calls [`PacketHandler::handle`].
#[derive(Clone)]
pub struct PacketHandler {
    sinks: Vec<Arc<dyn Sink>>,
    errors: ErrorRegistry,
    delimiter: String,
    source_name: Option<String>,
    source_names: Arc<HashMap<String, String>>,
}

impl PacketHandler {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, errors: ErrorRegistry) -> Self {
        PacketHandler {
            sinks,
            errors,
            delimiter: DEFAULT_DELIMITER.to_string(),
            source_name: None,
            source_names: Arc::new(HashMap::new()),
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_source_name(mut self, source_name: Option<String>) -> Self {
        self.source_name = source_name;
        self
    }

    pub fn with_source_names(mut self, source_names: Arc<HashMap<String, String>>) -> Self {
        self.source_names = source_names;
        self
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Provider name for data coming from `host`.
    pub fn resolve_source_name(&self, host: &str) -> &str {
        self.source_names
            .get(host)
            .or(self.source_name.as_ref())
            .map(String::as_str)
            .unwrap_or(DEFAULT_SOURCE_NAME)
    }

    pub fn make_packet(
        &self,
        data: impl Into<Vec<u8>>,
        protocol: Protocol,
        host: &str,
        port: Option<u16>,
    ) -> Packet {
        let packet = Packet::new(data, protocol, host)
            .with_source_name(self.resolve_source_name(host))
            .with_delimiter(self.delimiter.as_str());
        match port {
            Some(port) => packet.with_source_port(port),
            None => packet,
        }
    }

    pub async fn handle(&self, packet: Packet) {
        if packet.is_empty() {
            return;
        }

        info!(
            "{}: received {} messages from {}",
            packet.protocol(),
            packet.size(),
            packet.address()
        );
        trace!("packet metadata: {:?}", packet.metadata().attributes());
        for message in packet.messages() {
            debug!("{}", String::from_utf8_lossy(message));
        }

        for sink in &self.sinks {
            if let Err(e) = sink.publish(&packet).await {
                error!("{}: could not publish to {}: {e}", packet.protocol(), sink.name());
                self.errors.record(e);
            }
        }
    }
}

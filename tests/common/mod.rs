//! Helpers shared by the integration tests.

use std::sync::Arc;

use ais_relay::{
    error::SinkError, monitor::ErrorRegistry, packet::Packet, sink::Sink, PacketHandler,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// What a sink saw of one packet.
#[derive(Debug, Clone)]
pub struct Received {
    pub messages: Vec<String>,
    pub source_host: String,
    pub source_name: String,
}

/// Forwards everything it is asked to publish into a channel.
pub struct ChannelSink {
    packet_tx: mpsc::UnboundedSender<Received>,
}

#[async_trait]
impl Sink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn publish(&self, packet: &Packet) -> Result<(), SinkError> {
        let received = Received {
            messages: packet
                .messages()
                .iter()
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .collect(),
            source_host: packet.source_host().to_string(),
            source_name: packet.source_name().to_string(),
        };
        _ = self.packet_tx.send(received);
        Ok(())
    }
}

pub fn channel_handler() -> (PacketHandler, mpsc::UnboundedReceiver<Received>) {
    let (packet_tx, packet_rx) = mpsc::unbounded_channel();
    let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(ChannelSink { packet_tx })];
    (PacketHandler::new(sinks, ErrorRegistry::default()), packet_rx)
}

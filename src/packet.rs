//! A single network read, plus the provenance needed to republish it.

use std::{fmt, sync::OnceLock};

use chrono::{DateTime, SecondsFormat, Utc};

pub const DEFAULT_SOURCE_NAME: &str = "Unknown";
pub const DEFAULT_DELIMITER: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

/// Received datagram or stream read.
///
/// The payload is never modified. Messages are derived from it on first access and
/// cached for the lifetime of the packet.
#[derive(Debug)]
pub struct Packet {
    data: Vec<u8>,
    protocol: Protocol,
    source_host: String,
    source_port: Option<u16>,
    source_name: String,
    delimiter: String,
    timestamp: DateTime<Utc>,
    messages: OnceLock<Vec<Vec<u8>>>,
}

impl Packet {
    pub fn new(
        data: impl Into<Vec<u8>>,
        protocol: Protocol,
        source_host: impl Into<String>,
    ) -> Self {
        Packet {
            data: data.into(),
            protocol,
            source_host: source_host.into(),
            source_port: None,
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            timestamp: Utc::now(),
            messages: OnceLock::new(),
        }
    }

    pub fn with_source_port(mut self, port: u16) -> Self {
        self.source_port = Some(port);
        self
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self.messages = OnceLock::new();
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn source_host(&self) -> &str {
        &self.source_host
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn address(&self) -> String {
        match self.source_port {
            Some(port) => format!("{}:{port}", self.source_host),
            None => self.source_host.clone(),
        }
    }

    /// Trimmed, non-empty messages split on the delimiter.
    ///
    /// A payload that is not valid UTF-8 yields itself as the only message.
    pub fn messages(&self) -> &[Vec<u8>] {
        self.messages.get_or_init(|| split_messages(&self.data, &self.delimiter))
    }

    pub fn size(&self) -> usize {
        self.messages().len()
    }

    /// Only a zero-length payload is empty; a payload of bare delimiters is not.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn metadata(&self) -> PacketMetadata {
        PacketMetadata {
            protocol: self.protocol,
            source_host: self.source_host.clone(),
            source_port: self.source_port,
            source_name: self.source_name.clone(),
            timestamp: self.timestamp,
        }
    }
}

fn split_messages(data: &[u8], delimiter: &str) -> Vec<Vec<u8>> {
    let Ok(text) = std::str::from_utf8(data) else {
        return vec![data.to_vec()];
    };

    let parts: Box<dyn Iterator<Item = &str>> = if delimiter.is_empty() {
        Box::new(std::iter::once(text))
    } else {
        Box::new(text.split(delimiter))
    };

    parts
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(|message| message.as_bytes().to_vec())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMetadata {
    pub protocol: Protocol,
    pub source_host: String,
    pub source_port: Option<u16>,
    pub source_name: String,
    pub timestamp: DateTime<Utc>,
}

impl PacketMetadata {
    /// Key/value view, for logging.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut attributes = vec![
            ("protocol", self.protocol.to_string()),
            ("source_host", self.source_host.clone()),
            ("source_name", self.source_name.clone()),
            (
                "timestamp",
                self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        ];
        if let Some(port) = self.source_port {
            attributes.push(("source_port", port.to_string()));
        }
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(data: &[u8]) -> Packet {
        Packet::new(data, Protocol::Udp, "127.0.0.1")
    }

    #[test]
    fn test_messages() {
        let p = packet(b"123 \n 456");

        assert_eq!(p.size(), 2);
        assert_eq!(p.messages()[0], b"123");
        assert_eq!(p.messages()[1], b"456");
    }

    #[test]
    fn test_messages_are_cached() {
        let p = packet(b"!AIVDM,1,1,,A,x,0\r\n!AIVDM,1,1,,B,y,0\r\n");

        let first = p.messages().as_ptr();
        assert_eq!(p.messages().as_ptr(), first);
        assert_eq!(p.size(), p.size());
        assert_eq!(p.size(), 2);
    }

    #[test]
    fn test_empty() {
        assert!(packet(b"").is_empty());
        assert_eq!(packet(b"").size(), 0);

        let only_delimiters = packet(b"\n\n");
        assert!(!only_delimiters.is_empty());
        assert_eq!(only_delimiters.size(), 0);
    }

    #[test]
    fn test_undecodable_payload_is_single_message() {
        let data = [0xff, 0xfe, b'\n', 0x80];
        let p = packet(&data);

        assert_eq!(p.size(), 1);
        assert_eq!(p.messages()[0], data);
    }

    #[test]
    fn test_custom_delimiter() {
        let p = packet(b"a|b||c ").with_delimiter("|");
        assert_eq!(p.messages(), &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_timestamps_are_ordered() {
        let p1 = packet(b"a");
        let p2 = packet(b"b");
        assert!(p2.timestamp() >= p1.timestamp());
    }

    #[test]
    fn test_metadata() {
        let p = packet(b"x").with_source_port(10110).with_source_name("spire");
        let attributes = p.metadata().attributes();

        assert!(attributes.contains(&("protocol", "UDP".to_string())));
        assert!(attributes.contains(&("source_host", "127.0.0.1".to_string())));
        assert!(attributes.contains(&("source_name", "spire".to_string())));
        assert!(attributes.contains(&("source_port", "10110".to_string())));
        let (_, timestamp) = attributes.iter().find(|(k, _)| *k == "timestamp").unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert_eq!(p.address(), "127.0.0.1:10110");
    }

    #[test]
    fn test_default_source_name() {
        assert_eq!(packet(b"x").source_name(), DEFAULT_SOURCE_NAME);
    }
}

//! Relays NMEA/AIS sentence feeds.
//!
//! Receivers accept sentences over UDP or TCP, wrap every read in a [`Packet`] and hand
//! it to a set of [`Sink`]s. Transmitters do the reverse for testing and replay: they
//! read recorded sentence files, cut them into chunks that never split a multipart
//! message and send them out at a fixed pace.

pub mod ais_reformatter;
pub mod chunker;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod monitor;
pub mod packet;
pub mod sink;
pub mod supervisor;
pub mod transmitter;

pub use chunker::{chunk, chunk_fixed, chunk_multipart, ChunkMode, ChunkerKind};
pub use config::FileConfig;
pub use error::{
    ChunkError, ConfigError, ReceiverError, RunError, SinkError, SinkErrorKind, TransmitterError,
};
pub use handler::PacketHandler;
pub use listener::{Receiver, ReceiverProtocol};
pub use monitor::{ErrorRegistry, ExceptionMonitor, TaskMonitor};
pub use packet::{Packet, Protocol};
pub use sink::{DataFormat, Sink, SinkConfig};
pub use supervisor::run_receivers;
pub use transmitter::{TransmitStats, Transmitter, TransmitterProtocol};

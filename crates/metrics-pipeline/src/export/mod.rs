//! Snapshot encoding, transmission and retry.

pub mod codec;
pub mod exporter;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::create_codec;
pub use codec::SnapshotCodec;
pub use exporter::ExportTask;
pub use exporter::Exporter;
pub use retry::Backoff;
pub use retry::RetryPolicy;
pub use transport::HttpTransport;
pub use transport::LogTransport;
pub use transport::Payload;
pub use transport::Transport;
pub use transport::TransportError;

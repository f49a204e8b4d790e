use crate::aggregation::Snapshot;
use crate::error::MetricsResult;

pub mod influx;
pub mod json;

/// Trait for encoding a drained window into a wire payload
pub trait SnapshotCodec: Send + Sync {
    /// Value of the `Content-Type` header sent with the payload
    fn content_type(&self) -> &'static str;

    /// Encode every series of the snapshot into one payload
    fn encode(&self, snapshot: &Snapshot) -> MetricsResult<Vec<u8>>;
}

/// Factory function to create codecs based on format string
pub fn create_codec(format: &str, service_name: &str) -> Box<dyn SnapshotCodec> {
    match format.to_lowercase().as_str() {
        "influx" | "influxdb" => Box::new(influx::InfluxCodec::new()),
        "json" | "otlp" | _ => Box::new(json::JsonCodec::new(service_name)),
    }
}

//! OTLP/JSON encoding of a snapshot.
//!
//! 64-bit integers and nanosecond timestamps are written as decimal strings as
//! required by the protobuf JSON mapping.

use chrono::DateTime;
use chrono::Utc;
use error_stack::ResultExt;
use serde_json::json;
use serde_json::Value;

use super::SnapshotCodec;
use crate::aggregation::Aggregate;
use crate::aggregation::SeriesSnapshot;
use crate::aggregation::Snapshot;
use crate::attributes::AttributeSet;
use crate::attributes::AttributeValue;
use crate::error::MetricsError;
use crate::error::MetricsResult;

/// AGGREGATION_TEMPORALITY_DELTA; every window carries only its own measurements.
const DELTA_TEMPORALITY: u8 = 1;

/// JSON encoder for metrics
pub struct JsonCodec {
    service_name: String,
}

impl JsonCodec {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn metric(&self, series: &[&SeriesSnapshot], snapshot: &Snapshot) -> Value {
        let instrument = &series[0].instrument;
        let start = nanos(snapshot.started_at());
        let end = nanos(snapshot.ended_at());

        let mut metric = json!({
            "name": instrument.name(),
            "unit": instrument.unit().unwrap_or_default(),
            "description": instrument.description().unwrap_or_default(),
        });

        let points: Vec<Value> = series
            .iter()
            .map(|s| {
                let attributes = attributes(&s.attributes);
                match &s.aggregate {
                    Aggregate::Sum { value } => json!({
                        "attributes": attributes,
                        "startTimeUnixNano": start,
                        "timeUnixNano": end,
                        "asDouble": value,
                    }),
                    Aggregate::LastValue { value, observed_at } => json!({
                        "attributes": attributes,
                        "startTimeUnixNano": start,
                        "timeUnixNano": nanos(*observed_at),
                        "asDouble": value,
                    }),
                    Aggregate::Histogram(data) => json!({
                        "attributes": attributes,
                        "startTimeUnixNano": start,
                        "timeUnixNano": end,
                        "count": data.count.to_string(),
                        "sum": data.sum,
                        "min": data.min,
                        "max": data.max,
                        "bucketCounts": data.bucket_counts.iter().map(u64::to_string).collect::<Vec<_>>(),
                        "explicitBounds": data.boundaries,
                    }),
                }
            })
            .collect();

        let data = match &series[0].aggregate {
            Aggregate::Sum { .. } => (
                "sum",
                json!({
                    "aggregationTemporality": DELTA_TEMPORALITY,
                    "isMonotonic": true,
                    "dataPoints": points,
                }),
            ),
            Aggregate::LastValue { .. } => ("gauge", json!({ "dataPoints": points })),
            Aggregate::Histogram(_) => (
                "histogram",
                json!({
                    "aggregationTemporality": DELTA_TEMPORALITY,
                    "dataPoints": points,
                }),
            ),
        };
        metric[data.0] = data.1;
        metric
    }
}

impl SnapshotCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, snapshot: &Snapshot) -> MetricsResult<Vec<u8>> {
        // series are sorted by instrument, so each run is one metric
        let mut metrics = Vec::new();
        let mut run: Vec<&SeriesSnapshot> = Vec::new();
        for series in snapshot.series() {
            if let Some(first) = run.first() {
                if first.instrument != series.instrument {
                    metrics.push(self.metric(&run, snapshot));
                    run.clear();
                }
            }
            run.push(series);
        }
        if !run.is_empty() {
            metrics.push(self.metric(&run, snapshot));
        }

        let document = json!({
            "resourceMetrics": [{
                "resource": {
                    "attributes": [{
                        "key": "service.name",
                        "value": { "stringValue": self.service_name },
                    }],
                },
                "scopeMetrics": [{
                    "scope": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "metrics": metrics,
                }],
            }],
        });

        serde_json::to_vec(&document).change_context(MetricsError::Encoding {
            message: "Failed to serialize OTLP/JSON document".into(),
        })
    }
}

fn nanos(at: DateTime<Utc>) -> String {
    at.timestamp_nanos_opt().unwrap_or_default().to_string()
}

fn attributes(set: &AttributeSet) -> Vec<Value> {
    set.iter()
        .map(|(key, value)| {
            let value = match value {
                AttributeValue::String(s) => json!({ "stringValue": s }),
                AttributeValue::Int(i) => json!({ "intValue": i.to_string() }),
                AttributeValue::Float(f) => json!({ "doubleValue": f }),
                AttributeValue::Bool(b) => json!({ "boolValue": b }),
            };
            json!({ "key": key, "value": value })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::instrument::InstrumentDescriptor;
    use crate::instrument::InstrumentKind;

    fn series(descriptor: &Arc<InstrumentDescriptor>, attrs: AttributeSet, values: &[f64]) -> SeriesSnapshot {
        let at = Utc.timestamp_opt(1_700_000_005, 0).single().expect("valid time");
        let mut aggregate = Aggregate::new(descriptor.kind(), &[0.0, 10.0]);
        for value in values {
            aggregate.update(*value, at);
        }
        SeriesSnapshot {
            instrument: Arc::clone(descriptor),
            attributes: attrs,
            aggregate,
        }
    }

    fn snapshot(series: Vec<SeriesSnapshot>) -> Snapshot {
        Snapshot::new(
            Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid time"),
            Utc.timestamp_opt(1_700_000_010, 0).single().expect("valid time"),
            series,
        )
    }

    fn encode(snapshot: &Snapshot) -> Value {
        let bytes = JsonCodec::new("otel-test")
            .encode(snapshot)
            .expect("should encode");
        serde_json::from_slice(&bytes).expect("Should be valid JSON")
    }

    #[test]
    fn test_encode_dummy_counter() {
        let counter = Arc::new(InstrumentDescriptor::counter("dummy_counter"));
        let doc = encode(&snapshot(vec![series(
            &counter,
            AttributeSet::from([("test", "curl")]),
            &[1.0],
        )]));

        let resource = &doc["resourceMetrics"][0];
        assert_eq!(resource["resource"]["attributes"][0]["key"], "service.name");
        assert_eq!(resource["resource"]["attributes"][0]["value"]["stringValue"], "otel-test");

        let metric = &resource["scopeMetrics"][0]["metrics"][0];
        assert_eq!(metric["name"], "dummy_counter");
        assert_eq!(metric["sum"]["aggregationTemporality"], 1);
        assert_eq!(metric["sum"]["isMonotonic"], true);

        let point = &metric["sum"]["dataPoints"][0];
        assert_eq!(point["asDouble"], 1.0);
        assert_eq!(point["startTimeUnixNano"], "1700000000000000000");
        assert_eq!(point["timeUnixNano"], "1700000010000000000");
        assert_eq!(point["attributes"][0]["key"], "test");
        assert_eq!(point["attributes"][0]["value"]["stringValue"], "curl");
    }

    #[test]
    fn test_series_of_one_instrument_share_a_metric() {
        let counter = Arc::new(InstrumentDescriptor::counter("requests"));
        let gauge = Arc::new(InstrumentDescriptor::gauge("temperature").with_unit("Cel"));
        let doc = encode(&snapshot(vec![
            series(&counter, AttributeSet::from([("code", 200)]), &[3.0]),
            series(&gauge, AttributeSet::empty(), &[21.5]),
            series(&counter, AttributeSet::from([("code", 500)]), &[1.0]),
        ]));

        let metrics = doc["resourceMetrics"][0]["scopeMetrics"][0]["metrics"]
            .as_array()
            .expect("metrics array");
        assert_eq!(metrics.len(), 2);

        assert_eq!(metrics[0]["name"], "requests");
        let points = metrics[0]["sum"]["dataPoints"].as_array().expect("points");
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["attributes"][0]["value"]["intValue"], "200");

        assert_eq!(metrics[1]["name"], "temperature");
        assert_eq!(metrics[1]["unit"], "Cel");
        assert_eq!(metrics[1]["gauge"]["dataPoints"][0]["asDouble"], 21.5);
        assert_eq!(metrics[1]["gauge"]["dataPoints"][0]["timeUnixNano"], "1700000005000000000");
    }

    #[test]
    fn test_encode_histogram() {
        let histogram = Arc::new(InstrumentDescriptor::new("latency", InstrumentKind::Histogram));
        let doc = encode(&snapshot(vec![series(
            &histogram,
            AttributeSet::empty(),
            &[5.0, 20.0, 7.0],
        )]));

        let point = &doc["resourceMetrics"][0]["scopeMetrics"][0]["metrics"][0]["histogram"]["dataPoints"][0];
        assert_eq!(point["count"], "3");
        assert_eq!(point["sum"], 32.0);
        assert_eq!(point["min"], 5.0);
        assert_eq!(point["max"], 20.0);
        assert_eq!(point["bucketCounts"], json!(["0", "2", "1"]));
        assert_eq!(point["explicitBounds"], json!([0.0, 10.0]));
    }

    #[test]
    fn test_encode_empty_snapshot() {
        let doc = encode(&snapshot(Vec::new()));
        assert_eq!(doc["resourceMetrics"][0]["scopeMetrics"][0]["metrics"], json!([]));
    }
}

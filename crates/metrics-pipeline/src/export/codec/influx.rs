use influxdb_line_protocol::LineProtocolBuilder;

use super::SnapshotCodec;
use crate::aggregation::Aggregate;
use crate::aggregation::SeriesSnapshot;
use crate::aggregation::Snapshot;
use crate::error::MetricsResult;

enum FieldValue {
    Float(f64),
    UnsignedInteger(u64),
}

/// InfluxDB line protocol encoder, one line per series
pub struct InfluxCodec;

impl InfluxCodec {
    pub fn new() -> Self {
        Self
    }

    fn fields(aggregate: &Aggregate) -> Vec<(String, FieldValue)> {
        match aggregate {
            Aggregate::Sum { value } => vec![("sum".to_string(), FieldValue::Float(*value))],
            Aggregate::LastValue { value, .. } => {
                vec![("value".to_string(), FieldValue::Float(*value))]
            }
            Aggregate::Histogram(data) => {
                let mut fields = vec![
                    ("count".to_string(), FieldValue::UnsignedInteger(data.count)),
                    ("sum".to_string(), FieldValue::Float(data.sum)),
                    ("min".to_string(), FieldValue::Float(data.min)),
                    ("max".to_string(), FieldValue::Float(data.max)),
                ];
                for (idx, count) in data.bucket_counts.iter().enumerate() {
                    let key = match data.boundaries.get(idx) {
                        Some(bound) => format!("le_{bound}"),
                        None => "le_inf".to_string(),
                    };
                    fields.push((key, FieldValue::UnsignedInteger(*count)));
                }
                fields
            }
        }
    }

    fn encode_series(series: &SeriesSnapshot, timestamp: i64) -> Vec<u8> {
        let mut builder = LineProtocolBuilder::new().measurement(series.instrument.name());

        for (key, value) in series.attributes.iter() {
            let value = value.to_string();
            // empty tag values are not representable
            if !value.is_empty() {
                builder = builder.tag(key, &value);
            }
        }

        let fields = Self::fields(&series.aggregate);
        let (first_key, first_value) = &fields[0];
        let mut after_first_field = match first_value {
            FieldValue::Float(f) => builder.field(first_key, *f),
            FieldValue::UnsignedInteger(u) => builder.field(first_key, *u),
        };
        for (key, value) in fields.iter().skip(1) {
            after_first_field = match value {
                FieldValue::Float(f) => after_first_field.field(key, *f),
                FieldValue::UnsignedInteger(u) => after_first_field.field(key, *u),
            };
        }

        after_first_field.timestamp(timestamp).close_line().build()
    }
}

impl Default for InfluxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCodec for InfluxCodec {
    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }

    fn encode(&self, snapshot: &Snapshot) -> MetricsResult<Vec<u8>> {
        let timestamp = snapshot.ended_at().timestamp_nanos_opt().unwrap_or_default();
        let mut payload = Vec::new();
        for series in snapshot.series() {
            payload.extend(Self::encode_series(series, timestamp));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use chrono::Utc;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::attributes::AttributeSet;
    use crate::instrument::InstrumentDescriptor;

    fn encode(series: Vec<SeriesSnapshot>) -> String {
        let snapshot = Snapshot::new(
            Utc.timestamp_opt(1_609_459_100, 0).single().expect("valid time"),
            Utc.timestamp_opt(1_609_459_200, 0).single().expect("valid time"),
            series,
        );
        let bytes = InfluxCodec::new().encode(&snapshot).expect("should encode");
        String::from_utf8(bytes).expect("line protocol is utf-8")
    }

    fn series(descriptor: InstrumentDescriptor, attrs: AttributeSet, values: &[f64]) -> SeriesSnapshot {
        let mut aggregate = Aggregate::new(descriptor.kind(), &[0.0, 10.0]);
        for value in values {
            aggregate.update(*value, Utc::now());
        }
        SeriesSnapshot {
            instrument: Arc::new(descriptor),
            attributes: attrs,
            aggregate,
        }
    }

    #[test]
    fn test_encode_dummy_counter() {
        let result = encode(vec![series(
            InstrumentDescriptor::counter("dummy_counter"),
            AttributeSet::from([("test", "curl")]),
            &[1.0],
        )]);

        assert_eq!(result, "dummy_counter,test=curl sum=1 1609459200000000000\n");
    }

    #[test]
    fn test_one_line_per_series() {
        let result = encode(vec![
            series(InstrumentDescriptor::counter("hits"), AttributeSet::from([("k", "a")]), &[1.0]),
            series(InstrumentDescriptor::counter("hits"), AttributeSet::from([("k", "b")]), &[2.0]),
            series(InstrumentDescriptor::gauge("load"), AttributeSet::empty(), &[0.5]),
        ]);

        let lines: Vec<_> = result.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("hits,k=a sum=1"));
        assert!(lines[1].starts_with("hits,k=b sum=2"));
        assert!(lines[2].starts_with("load value=0.5"));
    }

    #[test]
    fn test_encode_histogram_fields() {
        let result = encode(vec![series(
            InstrumentDescriptor::histogram("latency"),
            AttributeSet::empty(),
            &[5.0, 20.0],
        )]);

        assert!(result.starts_with("latency count=2u,sum=25,min=5,max=20"));
        assert!(result.contains("le_0=0u"));
        assert!(result.contains("le_10=1u"));
        assert!(result.contains("le_inf=1u"));
    }

    #[test]
    fn test_encode_empty_snapshot() {
        assert_eq!(encode(Vec::new()), "");
    }
}

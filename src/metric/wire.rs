use serde::{Deserialize, Serialize};

use super::{Metric, MetricError, MetricKind, MetricValue};

/// JSON shape of one metric on the agent/collector HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricJson {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MetricJson {
    /// Builds a value-less lookup request for `POST /value/`.
    pub fn lookup(kind: MetricKind, name: impl Into<String>) -> Self {
        Self {
            id: name.into(),
            kind: kind.as_str().to_string(),
            delta: None,
            value: None,
        }
    }

    /// Parses the `type` field.
    pub fn metric_kind(&self) -> Result<MetricKind, MetricError> {
        self.kind.parse()
    }
}

impl From<&Metric> for MetricJson {
    fn from(m: &Metric) -> Self {
        let (delta, value) = match m.value {
            MetricValue::Counter(d) => (Some(d), None),
            MetricValue::Gauge(v) => (None, Some(v)),
        };
        Self {
            id: m.name.clone(),
            kind: m.kind().as_str().to_string(),
            delta,
            value,
        }
    }
}

impl TryFrom<MetricJson> for Metric {
    type Error = MetricError;

    fn try_from(j: MetricJson) -> Result<Self, Self::Error> {
        let kind = j.metric_kind()?;
        let value = match kind {
            MetricKind::Counter => MetricValue::Counter(j.delta.ok_or_else(|| {
                MetricError::MissingValue {
                    name: j.id.clone(),
                    kind,
                    field: "delta",
                }
            })?),
            MetricKind::Gauge => MetricValue::Gauge(j.value.ok_or_else(|| {
                MetricError::MissingValue {
                    name: j.id.clone(),
                    kind,
                    field: "value",
                }
            })?),
        };

        let metric = Metric { name: j.id, value };
        metric.validate()?;
        Ok(metric)
    }
}

/// Serializes a batch as a JSON array.
pub fn encode_batch(batch: &[Metric]) -> Result<Vec<u8>, MetricError> {
    let items: Vec<MetricJson> = batch.iter().map(MetricJson::from).collect();
    serde_json::to_vec(&items).map_err(|e| MetricError::Malformed(e.to_string()))
}

/// Parses a JSON array into a batch. Any bad element rejects the whole batch.
pub fn decode_batch(body: &[u8]) -> Result<Vec<Metric>, MetricError> {
    let items: Vec<MetricJson> =
        serde_json::from_slice(body).map_err(|e| MetricError::Malformed(e.to_string()))?;
    items.into_iter().map(Metric::try_from).collect()
}

/// Parses a single JSON metric.
pub fn decode_one(body: &[u8]) -> Result<Metric, MetricError> {
    let item: MetricJson =
        serde_json::from_slice(body).map_err(|e| MetricError::Malformed(e.to_string()))?;
    Metric::try_from(item)
}

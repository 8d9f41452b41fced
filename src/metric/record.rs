use serde::{Deserialize, Serialize};

use super::{Metric, MetricError, MetricKind, MetricValue};

/// One line of the file-backed store's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(rename = "mName")]
    pub name: String,
    #[serde(rename = "mType")]
    pub kind: MetricKind,
    #[serde(rename = "mVal", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(rename = "mDelta", default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

impl From<&Metric> for MetricRecord {
    fn from(m: &Metric) -> Self {
        let (value, delta) = match m.value {
            MetricValue::Counter(d) => (None, Some(d)),
            MetricValue::Gauge(v) => (Some(v), None),
        };
        Self {
            name: m.name.clone(),
            kind: m.kind(),
            value,
            delta,
        }
    }
}

impl TryFrom<MetricRecord> for Metric {
    type Error = MetricError;

    fn try_from(r: MetricRecord) -> Result<Self, Self::Error> {
        let value = match r.kind {
            MetricKind::Counter => r.delta.map(MetricValue::Counter),
            MetricKind::Gauge => r.value.map(MetricValue::Gauge),
        };
        let value = value.ok_or_else(|| MetricError::MissingValue {
            name: r.name.clone(),
            kind: r.kind,
            field: match r.kind {
                MetricKind::Counter => "mDelta",
                MetricKind::Gauge => "mVal",
            },
        })?;

        let metric = Metric {
            name: r.name,
            value,
        };
        metric.validate()?;
        Ok(metric)
    }
}

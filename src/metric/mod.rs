pub mod record;
pub mod wire;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Aggregation kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Additive: updates sum into the stored value.
    Counter,
    /// Overwrite: updates replace the stored value.
    Gauge,
}

impl MetricKind {
    /// Returns the lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            other => Err(MetricError::UnknownKind(other.to_string())),
        }
    }
}

/// Value of a metric. The variant determines the kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(i64),
    Gauge(f64),
}

impl MetricValue {
    /// Returns the kind implied by this value.
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Parses a textual value for the given kind.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, MetricError> {
        let invalid = || MetricError::InvalidValue {
            kind,
            raw: raw.to_string(),
        };

        match kind {
            MetricKind::Counter => raw.parse().map(Self::Counter).map_err(|_| invalid()),
            MetricKind::Gauge => raw.parse().map(Self::Gauge).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter(v) => write!(f, "{v}"),
            Self::Gauge(v) => write!(f, "{v}"),
        }
    }
}

/// Identity of a stored metric. Ordered by kind, then name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricId {
    pub kind: MetricKind,
    pub name: String,
}

impl MetricId {
    pub fn new(kind: MetricKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// A single observation or stored current value.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
}

/// Ordered list of metrics produced by one tick or carried by one request.
pub type MetricBatch = Vec<Metric>;

impl Metric {
    /// Creates a counter observation carrying `delta`.
    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Counter(delta),
        }
    }

    /// Creates a gauge observation carrying `value`.
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    pub fn id(&self) -> MetricId {
        MetricId::new(self.kind(), self.name.clone())
    }

    /// Computes the value to store when this update meets `existing`.
    ///
    /// Counters add their delta to the existing value (missing counts as
    /// zero). Gauges replace it.
    pub fn apply(&self, existing: Option<MetricValue>) -> Result<MetricValue, MetricError> {
        match (self.value, existing) {
            (MetricValue::Counter(delta), None) => Ok(MetricValue::Counter(delta)),
            (MetricValue::Counter(delta), Some(MetricValue::Counter(current))) => current
                .checked_add(delta)
                .map(MetricValue::Counter)
                .ok_or_else(|| MetricError::Overflow {
                    name: self.name.clone(),
                    current,
                    delta,
                }),
            (MetricValue::Gauge(value), None | Some(MetricValue::Gauge(_))) => {
                Ok(MetricValue::Gauge(value))
            }
            (incoming, Some(stored)) => Err(MetricError::KindMismatch {
                name: self.name.clone(),
                stored: stored.kind(),
                incoming: incoming.kind(),
            }),
        }
    }

    /// Rejects metrics that can never be stored.
    pub fn validate(&self) -> Result<(), MetricError> {
        if self.name.is_empty() {
            return Err(MetricError::EmptyName);
        }
        Ok(())
    }
}

/// Aggregation and type failures. Never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("unknown metric kind {0:?}")]
    UnknownKind(String),

    #[error("metric name must not be empty")]
    EmptyName,

    #[error("{kind} {name:?} is missing its {field} field")]
    MissingValue {
        name: String,
        kind: MetricKind,
        field: &'static str,
    },

    #[error("invalid {kind} value {raw:?}")]
    InvalidValue { kind: MetricKind, raw: String },

    #[error("counter {name:?} overflowed: {current} + {delta}")]
    Overflow {
        name: String,
        current: i64,
        delta: i64,
    },

    #[error("{name:?} is stored as {stored}, cannot apply {incoming} update")]
    KindMismatch {
        name: String,
        stored: MetricKind,
        incoming: MetricKind,
    },

    #[error("malformed metric payload: {0}")]
    Malformed(String),
}

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{Storage, StorageError};
use crate::metric::{Metric, MetricId, MetricKind, MetricValue};

/// Volatile store. One lock guards the whole map so a batch is never
/// observed half-applied.
#[derive(Debug, Default)]
pub struct MemStorage {
    metrics: Mutex<BTreeMap<MetricId, MetricValue>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.lock().is_empty()
    }
}

fn apply_locked(
    metrics: &mut BTreeMap<MetricId, MetricValue>,
    update: &Metric,
) -> Result<Metric, StorageError> {
    update.validate()?;

    let id = update.id();
    let next = update.apply(metrics.get(&id).copied())?;
    metrics.insert(id, next);

    Ok(Metric {
        name: update.name.clone(),
        value: next,
    })
}

impl Storage for MemStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, name: &str, kind: MetricKind) -> Result<Metric, StorageError> {
        let id = MetricId::new(kind, name);
        let metrics = self.metrics.lock();

        metrics
            .get(&id)
            .map(|value| Metric {
                name: id.name.clone(),
                value: *value,
            })
            .ok_or_else(|| StorageError::NotFound {
                name: id.name.clone(),
                kind,
            })
    }

    async fn update(&self, metric: &Metric) -> Result<Metric, StorageError> {
        apply_locked(&mut self.metrics.lock(), metric)
    }

    async fn add_batch(&self, batch: &[Metric]) -> Result<(), StorageError> {
        let mut metrics = self.metrics.lock();

        for (applied, update) in batch.iter().enumerate() {
            if let Err(e) = apply_locked(&mut metrics, update) {
                return Err(StorageError::PartialBatch {
                    applied,
                    total: batch.len(),
                    source: Box::new(e),
                });
            }
        }

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Metric>, StorageError> {
        let metrics = self.metrics.lock();

        Ok(metrics
            .iter()
            .map(|(id, value)| Metric {
                name: id.name.clone(),
                value: *value,
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

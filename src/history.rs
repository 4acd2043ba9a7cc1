use std::collections::BTreeMap;

use ml_core::{Elapsed, LogValue, Logs};

/// Scalar log values committed at one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub elapsed: Elapsed,
    pub values: BTreeMap<String, f32>,
}

/// Records scalar logs over the lifetime of a loop.
///
/// Entries are flattened by name across categories; a later category wins when two
/// categories log the same name.
#[derive(Debug, Clone, Default)]
pub struct History {
    records: Vec<Record>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores every single-element tensor in `logs` under its entry name.
    ///
    /// Metric accumulators and larger tensors are skipped. Nothing is stored when
    /// `logs` holds no scalar.
    pub fn commit_logs(&mut self, elapsed: &Elapsed, logs: &Logs) {
        let values: BTreeMap<String, f32> = logs
            .iter()
            .flat_map(|(_, group)| group.iter())
            .filter_map(|(name, value)| match value {
                LogValue::Tensor(t) => ml_core::tensor::item(t).map(|v| (name.clone(), v)),
                LogValue::Metric(_) => None,
            })
            .collect();

        if values.is_empty() {
            return;
        }

        self.records.push(Record {
            elapsed: *elapsed,
            values,
        });
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Collects one series per key, over the records that hold every key.
    ///
    /// `steps` and `samples` are always available and read from the record's progress.
    pub fn collect(&self, keys: &[&str]) -> Vec<Vec<f32>> {
        let mut series = vec![Vec::new(); keys.len()];

        for record in &self.records {
            let row: Option<Vec<f32>> = keys.iter().map(|key| lookup(record, key)).collect();
            if let Some(row) = row {
                series.iter_mut().zip(row).for_each(|(s, v)| s.push(v));
            }
        }

        series
    }
}

fn lookup(record: &Record, key: &str) -> Option<f32> {
    match key {
        "steps" => Some(record.elapsed.steps as f32),
        "samples" => Some(record.elapsed.samples as f32),
        _ => record.values.get(key).copied(),
    }
}

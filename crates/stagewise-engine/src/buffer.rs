//! Rolling per-key metric history.
//!
//! Every key keeps at most `max_length` recent `(value, iteration)` pairs and
//! a running mean over everything ever pushed, evicted values included.
//! Evaluation outputs under `_out` are exempt from the cap: they are drained
//! whole once per evaluation epoch.

use crate::engine::OUTPUT_KEY;
use crate::error::{EngineError, Result};
use stagewise_abstraction::Value;
use std::collections::{BTreeMap, VecDeque};

/// Default number of entries retained per key.
pub const DEFAULT_BUFFER_SIZE: usize = 100_000;

/// History of a single metric key.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    data: VecDeque<(Value, u64)>,
    count: u64,
    global_avg: f64,
}

impl BufferEntry {
    fn new() -> Self {
        Self { data: VecDeque::new(), count: 0, global_avg: 0.0 }
    }

    /// Retained `(value, iteration)` pairs, oldest first.
    pub fn values(&self) -> &VecDeque<(Value, u64)> {
        &self.data
    }

    /// Total number of values ever pushed.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn global_avg(&self) -> f64 {
        self.global_avg
    }

    fn window(&self, window: usize) -> impl Iterator<Item = f64> + '_ {
        let n = window.clamp(1, self.data.len().max(1));
        self.data.iter().skip(self.data.len().saturating_sub(n)).map(|(v, _)| v.mean())
    }
}

/// Bounded metric buffer keyed by metric name.
#[derive(Debug, Clone)]
pub struct Buffer {
    max_length: usize,
    entries: BTreeMap<String, BufferEntry>,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl Buffer {
    /// Create a buffer retaining at most `max_length` values per key.
    ///
    /// A zero capacity is treated as one.
    pub fn new(max_length: usize) -> Self {
        Self { max_length: max_length.max(1), entries: BTreeMap::new() }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Push a value for `key`.
    ///
    /// `iteration` defaults to the number of values pushed to this key so far.
    pub fn update(&mut self, key: impl Into<String>, value: impl Into<Value>, iteration: Option<u64>) {
        let key = key.into();
        let capped = key != OUTPUT_KEY;
        let max_length = self.max_length;
        let entry = self.entries.entry(key).or_insert_with(BufferEntry::new);
        let value = value.into();

        let iteration = iteration.unwrap_or(entry.count);
        if capped && entry.data.len() >= max_length {
            entry.data.pop_front();
        }

        entry.count += 1;
        entry.global_avg += (value.mean() - entry.global_avg) / entry.count as f64;
        entry.data.push_back((value, iteration));
    }

    fn entry(&self, key: &str) -> Result<&BufferEntry> {
        self.entries
            .get(key)
            .filter(|e| !e.data.is_empty())
            .ok_or_else(|| EngineError::EmptyBuffer(key.to_string()))
    }

    /// The most recently pushed value.
    pub fn latest(&self, key: &str) -> Result<&Value> {
        self.entry(key)?
            .data
            .back()
            .map(|(v, _)| v)
            .ok_or_else(|| EngineError::EmptyBuffer(key.to_string()))
    }

    /// Median of the last `window` retained values.
    pub fn median(&self, key: &str, window: usize) -> Result<f64> {
        let mut values: Vec<f64> = self.entry(key)?.window(window).collect();
        values.sort_by(f64::total_cmp);

        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            Ok((values[mid - 1] + values[mid]) / 2.0)
        } else {
            Ok(values[mid])
        }
    }

    /// Mean of the last `window` retained values.
    pub fn avg(&self, key: &str, window: usize) -> Result<f64> {
        let values: Vec<f64> = self.entry(key)?.window(window).collect();
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Mean of every value ever pushed for `key`, evicted ones included.
    pub fn global_avg(&self, key: &str) -> Result<f64> {
        self.entries
            .get(key)
            .filter(|e| e.count > 0)
            .map(BufferEntry::global_avg)
            .ok_or_else(|| EngineError::EmptyBuffer(key.to_string()))
    }

    /// Retained pairs for `key`, oldest first.
    pub fn values(&self, key: &str) -> Result<&VecDeque<(Value, u64)>> {
        self.entries
            .get(key)
            .map(BufferEntry::values)
            .ok_or_else(|| EngineError::EmptyBuffer(key.to_string()))
    }

    /// Total number of values ever pushed for `key` (0 if unseen).
    pub fn count(&self, key: &str) -> u64 {
        self.entries.get(key).map_or(0, BufferEntry::count)
    }

    /// Remove `key` and return its retained pairs.
    pub fn pop(&mut self, key: &str) -> Result<Vec<(Value, u64)>> {
        self.entries
            .remove(key)
            .map(|e| e.data.into_iter().collect())
            .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))
    }

    /// Remove `key` and return its retained pairs, or `default` if absent.
    pub fn pop_or(&mut self, key: &str, default: Vec<(Value, u64)>) -> Vec<(Value, u64)> {
        self.pop(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

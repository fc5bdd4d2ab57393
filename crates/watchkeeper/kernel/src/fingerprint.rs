//! Content fingerprints for snapshots.
//!
//! The digest covers a canonical encoding of the snapshot payload: object
//! keys are sorted, every value carries a type tag and a length prefix, and
//! volatile keys are dropped at any depth. Two payloads that differ only in
//! key order or in volatile fields hash identically.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Number, Value};
use watchkeeper_types::{Fingerprint, Snapshot};

/// Computes stable fingerprints, ignoring a configured set of volatile keys.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    volatile: BTreeSet<String>,
}

impl Fingerprinter {
    pub fn new<I, S>(volatile_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            volatile: volatile_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Fingerprint of the snapshot payload. Envelope fields such as
    /// `fetched_at` are never part of the digest.
    pub fn fingerprint(&self, snapshot: &Snapshot) -> Fingerprint {
        self.fingerprint_value(&snapshot.data)
    }

    pub fn fingerprint_value(&self, value: &Value) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"watchkeeper-snapshot-v1:");
        self.feed(&mut hasher, value);
        Fingerprint::new(hasher.finalize().to_hex().to_string())
    }

    pub fn is_volatile(&self, key: &str) -> bool {
        self.volatile.contains(key)
    }

    /// Logical rows of a payload: object members, array elements keyed by
    /// index, or a single unnamed row for a scalar. Volatile members are
    /// not rows.
    pub fn rows<'a>(&self, data: &'a Value) -> Vec<(String, &'a Value)> {
        match data {
            Value::Object(map) => map
                .iter()
                .filter(|(key, _)| !self.is_volatile(key))
                .map(|(key, value)| (key.clone(), value))
                .collect(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(index, value)| (index.to_string(), value))
                .collect(),
            Value::Null => Vec::new(),
            scalar => vec![(String::new(), scalar)],
        }
    }

    /// Per-row fingerprints, used to count row-level changes between polls.
    pub fn row_fingerprints(&self, data: &Value) -> BTreeMap<String, Fingerprint> {
        self.rows(data)
            .into_iter()
            .map(|(key, value)| (key, self.fingerprint_value(value)))
            .collect()
    }

    fn feed(&self, hasher: &mut blake3::Hasher, value: &Value) {
        match value {
            Value::Null => {
                hasher.update(b"n");
            }
            Value::Bool(flag) => {
                hasher.update(if *flag { b"t" } else { b"f" });
            }
            Value::Number(number) => {
                hasher.update(b"d");
                feed_bytes(hasher, canonical_number(number).as_bytes());
            }
            Value::String(text) => {
                hasher.update(b"s");
                feed_bytes(hasher, text.as_bytes());
            }
            Value::Array(items) => {
                hasher.update(b"a");
                hasher.update(&(items.len() as u64).to_le_bytes());
                for item in items {
                    self.feed(hasher, item);
                }
            }
            Value::Object(map) => {
                let mut members: Vec<(&String, &Value)> = map
                    .iter()
                    .filter(|(key, _)| !self.is_volatile(key))
                    .collect();
                members.sort_by(|a, b| a.0.cmp(b.0));

                hasher.update(b"o");
                hasher.update(&(members.len() as u64).to_le_bytes());
                for (key, member) in members {
                    feed_bytes(hasher, key.as_bytes());
                    self.feed(hasher, member);
                }
            }
        }
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(["timestamp", "fetched_at", "polled_at", "last_polled"])
    }
}

fn feed_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

// Integral floats encode like integers so `1` and `1.0` compare equal.
fn canonical_number(number: &Number) -> String {
    if let Some(int) = number.as_i64() {
        return int.to_string();
    }
    if let Some(int) = number.as_u64() {
        return int.to_string();
    }
    match number.as_f64() {
        Some(float) if float.fract() == 0.0 && float.abs() < 9_007_199_254_740_992.0 => {
            (float as i64).to_string()
        }
        Some(float) => float.to_string(),
        None => number.to_string(),
    }
}

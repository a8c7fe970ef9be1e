//! Field values exchanged between components, buffers and sinks.
//!
//! A component sample is a map of named fields (`Fields`). A `Frame` groups the
//! fields of several streams captured in one tick, keyed by stream (component) name.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::{SystemTime, UNIX_EPOCH},
};

/// Field carrying the capture time of a sample, in nanoseconds.
pub const TIMESTAMP_FIELD: &str = "timestamp";

pub type Fields = BTreeMap<String, FieldValue>;
pub type Frame = BTreeMap<String, Fields>;

/// Stream name -> names of the fields observed for it.
pub type StreamMap = BTreeMap<String, BTreeSet<String>>;

/// One sampled value. Serialises untagged so containers read as plain JSON:
/// integers, floats, float arrays, and base64 strings for raw payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Array(Vec<f64>),
    Blob(Blob),
}

/// Opaque byte payload (image buffers and the like).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Blob)
            .map_err(serde::de::Error::custom)
    }
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Flattened numeric view; scalars become one-element vectors.
    pub fn numeric(&self) -> Vec<f64> {
        match self {
            FieldValue::Int(v) => vec![*v as f64],
            FieldValue::Float(v) => vec![*v],
            FieldValue::Array(v) => v.clone(),
            FieldValue::Blob(b) => b.0.iter().map(|&x| x as f64).collect(),
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, FieldValue::Blob(_))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(v: Vec<f64>) -> Self {
        FieldValue::Array(v)
    }
}

impl<const N: usize> From<[f64; N]> for FieldValue {
    fn from(v: [f64; N]) -> Self {
        FieldValue::Array(v.to_vec())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Blob(Blob(v))
    }
}

/// Wall-clock nanoseconds since the Unix epoch; 0 if the clock is before it.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Builds a `Fields` map from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FieldValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_reads_back_the_same_variants() {
        let original = fields([
            ("timestamp", FieldValue::Int(1_000)),
            ("gripper", FieldValue::Float(0.5)),
            ("joint", FieldValue::Array(vec![0.1, 0.2])),
            ("color", FieldValue::from(vec![1u8, 2, 3])),
        ]);
        let json = serde_json::to_string(&original).unwrap();
        let back: Fields = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn numeric_view_flattens_scalars() {
        assert_eq!(FieldValue::Int(3).numeric(), vec![3.0]);
        assert_eq!(FieldValue::from([1.0, 2.0]).numeric(), vec![1.0, 2.0]);
        assert_eq!(FieldValue::Float(2.5).as_i64(), None);
    }
}

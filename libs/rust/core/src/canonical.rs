//! Canonical string keys for positions and velocities.
//!
//! A key is compact JSON `[["X",3.0],["Y",-4.0]]` with entries ordered by
//! parameter name. Equal maps always produce the same key.

use std::collections::BTreeMap;

use serde_json::{json, Value};

pub type Position = BTreeMap<String, f64>;
pub type Velocity = BTreeMap<String, f64>;

pub fn canonical_key(values: &BTreeMap<String, f64>) -> String {
    // BTreeMap iteration is already name-ordered
    let pairs: Vec<Value> = values
        .iter()
        .map(|(name, v)| json!([name, normalize(*v)]))
        .collect();
    Value::Array(pairs).to_string()
}

pub fn decode_key(key: &str) -> Result<BTreeMap<String, f64>, serde_json::Error> {
    let pairs: Vec<(String, f64)> = serde_json::from_str(key)?;
    Ok(pairs.into_iter().collect())
}

fn normalize(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

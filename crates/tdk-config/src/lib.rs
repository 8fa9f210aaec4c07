//! Layered configuration for the transcript pipeline.
//!
//! YAML files merge in order (later overrides earlier), the merged document is
//! canonicalised (sorted keys, compact JSON) and SHA-256 hashed so two
//! processes can assert they run the same configuration, and a typed view is
//! deserialised from the merged JSON.
//!
//! Secrets never live in YAML: config stores env var NAMES only, resolved once
//! at startup (see [`secrets`]).

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub mod secrets;
pub mod typed;

pub use secrets::{resolve_secrets, ResolvedSecrets};
pub use typed::PipelineConfig;

/// Load + merge YAML files in order, canonicalise to JSON, hash, and
/// deserialise the typed pipeline view.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    let pipeline =
        PipelineConfig::from_value(&merged).context("typed pipeline config invalid")?;

    Ok(LoadedConfig {
        config_json: merged,
        canonical_json: canonical,
        config_hash: hash,
        pipeline,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Merged raw document (env var names, untyped extension sections).
    pub config_json: Value,
    /// Canonical compact JSON with sorted keys — the hashed bytes.
    pub canonical_json: String,
    /// Hex SHA-256 of `canonical_json`.
    pub config_hash: String,
    /// Typed view used by the daemon and workers.
    pub pipeline: PipelineConfig,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON. Key order is the only non-determinism in serde_json maps, so
/// sorting makes the hash stable across merge orders that produce the same
/// document.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

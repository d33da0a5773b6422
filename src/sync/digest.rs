// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SHA-256 digests of component state.
//!
//! Replicas are compared by digest, never by shipping full values around.
//! `serde_json` maps are ordered, so equal values always serialize to the
//! same bytes.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::component::StateComponent;

/// Digest of a component value alone (hex).
#[must_use]
pub fn value_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Digest binding a value digest to its component and version.
#[must_use]
pub fn state_digest(component: StateComponent, version: u64, value_digest: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(component.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(version.to_be_bytes());
    hasher.update(b":");
    hasher.update(value_digest.as_bytes());
    hasher.finalize().into()
}

/// Root over every component's state digest, in component order.
#[must_use]
pub fn world_digest(components: &BTreeMap<StateComponent, (u64, String)>) -> String {
    let mut hasher = Sha256::new();
    for (component, (version, digest)) in components {
        hasher.update(state_digest(*component, *version, digest));
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_digest_ignores_key_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(value_digest(&a), value_digest(&b));
        assert_ne!(value_digest(&a), value_digest(&json!({"a": 2, "b": 3})));
        assert_eq!(value_digest(&a).len(), 64);
    }

    #[test]
    fn test_world_digest_tracks_versions() {
        let d = value_digest(&json!({"weather": "rain"}));
        let mut map = BTreeMap::new();
        map.insert(StateComponent::World, (10, d.clone()));
        let before = world_digest(&map);

        map.insert(StateComponent::World, (11, d));
        assert_ne!(before, world_digest(&map));
    }
}

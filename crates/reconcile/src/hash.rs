//! Structural hashing of resolved attributes

use crate::resolve::{Resolved, ResolvedAttributes};

/// Token hashed in place of a value that is not known until apply.
pub const UNKNOWN_TOKEN: &str = "(known after apply)";

/// BLAKE3 hash of a resolved attribute set.
///
/// Keys are visited in sorted order and values are encoded as canonical
/// JSON, so equal attribute sets always hash equal. Unknown values hash as
/// [`UNKNOWN_TOKEN`] plus the reference they are waiting on.
pub fn attribute_hash(attributes: &ResolvedAttributes) -> String {
    let mut hasher = blake3::Hasher::new();
    for (name, value) in attributes {
        update_str(&mut hasher, name);
        match value {
            Resolved::Known(value) => {
                hasher.update(&[0]);
                update_str(&mut hasher, &value.to_string());
            }
            Resolved::Unknown(reference) => {
                hasher.update(&[1]);
                update_str(&mut hasher, UNKNOWN_TOKEN);
                update_str(&mut hasher, &reference.to_string());
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

/// Length-prefixed so that adjacent fields cannot run into each other.
fn update_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKey;
    use serde_json::json;

    fn known(pairs: &[(&str, serde_json::Value)]) -> ResolvedAttributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Resolved::Known(v.clone())))
            .collect()
    }

    #[test]
    fn test_hash_is_stable_and_order_independent() {
        let a = known(&[("cidr", json!("10.0.0.0/16")), ("tags", json!({"a": 1, "b": 2}))]);
        let b = known(&[("tags", json!({"b": 2, "a": 1})), ("cidr", json!("10.0.0.0/16"))]);
        assert_eq!(attribute_hash(&a), attribute_hash(&b));
    }

    #[test]
    fn test_hash_changes_with_values() {
        let a = known(&[("cidr", json!("10.0.0.0/16"))]);
        let b = known(&[("cidr", json!("10.1.0.0/16"))]);
        assert_ne!(attribute_hash(&a), attribute_hash(&b));
    }

    #[test]
    fn test_unknown_never_matches_a_known_value() {
        let reference = ResourceKey::new("network", "vpc1").attr("id");
        let mut pending = ResolvedAttributes::new();
        pending.insert("vpc_id".to_string(), Resolved::Unknown(reference));

        let stale = known(&[("vpc_id", json!(UNKNOWN_TOKEN))]);
        assert_ne!(attribute_hash(&pending), attribute_hash(&stale));
    }

    #[test]
    fn test_field_boundaries_matter() {
        let a = known(&[("ab", json!("c"))]);
        let b = known(&[("a", json!("bc"))]);
        assert_ne!(attribute_hash(&a), attribute_hash(&b));
    }
}

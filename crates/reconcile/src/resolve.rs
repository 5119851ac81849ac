//! Reference resolution
//!
//! References are resolved in a single pass in dependency order. At plan
//! time a reference to a resource that is about to change may not have a
//! value yet; it resolves to [`Resolved::Unknown`] and is filled in by the
//! scheduler once the referenced resource has been applied.

use crate::model::{AttrRef, Attributes, Resource, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An attribute value after reference substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Resolved {
    Known(serde_json::Value),
    Unknown(AttrRef),
}

impl Resolved {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// Attribute name -> resolved value.
pub type ResolvedAttributes = BTreeMap<String, Resolved>;

/// Substitute references using `lookup`; literals pass through.
pub fn resolve_attributes<F>(resource: &Resource, mut lookup: F) -> ResolvedAttributes
where
    F: FnMut(&AttrRef) -> Resolved,
{
    resource
        .attributes
        .iter()
        .map(|(name, value)| {
            let resolved = match value {
                Value::Literal(v) => Resolved::Known(v.clone()),
                Value::Reference(reference) => lookup(reference),
            };
            (name.clone(), resolved)
        })
        .collect()
}

/// Fill in every unknown value via `lookup`.
///
/// Returns the first reference that still has no value.
pub fn complete<F>(attributes: &ResolvedAttributes, mut lookup: F) -> Result<Attributes, AttrRef>
where
    F: FnMut(&AttrRef) -> Option<serde_json::Value>,
{
    attributes
        .iter()
        .map(|(name, value)| match value {
            Resolved::Known(v) => Ok((name.clone(), v.clone())),
            Resolved::Unknown(reference) => lookup(reference)
                .map(|v| (name.clone(), v))
                .ok_or_else(|| reference.clone()),
        })
        .collect()
}

/// Wrap concrete attributes as fully known.
pub fn known(attributes: &Attributes) -> ResolvedAttributes {
    attributes
        .iter()
        .map(|(name, value)| (name.clone(), Resolved::Known(value.clone())))
        .collect()
}

/// Names of attributes that differ between the applied inputs and the
/// desired values. Unknown values always count as changed.
pub fn changed_attributes(old: &Attributes, new: &ResolvedAttributes) -> Vec<String> {
    let mut changed: Vec<String> = new
        .iter()
        .filter(|(name, value)| match value {
            Resolved::Known(v) => old.get(*name) != Some(v),
            Resolved::Unknown(_) => true,
        })
        .map(|(name, _)| name.clone())
        .collect();

    changed.extend(old.keys().filter(|name| !new.contains_key(*name)).cloned());
    changed.sort();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKey;
    use serde_json::json;

    #[test]
    fn test_resolve_and_complete() {
        let vpc = ResourceKey::new("network", "vpc1");
        let subnet = Resource::new(ResourceKey::new("subnet", "sub1"))
            .with("vpc_id", vpc.attr("id"))
            .with("cidr", json!("10.0.1.0/24"));

        let resolved = resolve_attributes(&subnet, |r| Resolved::Unknown(r.clone()));
        assert!(resolved["cidr"].is_known());
        assert!(!resolved["vpc_id"].is_known());

        let filled = complete(&resolved, |_| Some(json!("vpc-123"))).unwrap();
        assert_eq!(filled["vpc_id"], json!("vpc-123"));

        let missing = complete(&resolved, |_| None).unwrap_err();
        assert_eq!(missing, vpc.attr("id"));
    }

    #[test]
    fn test_changed_attributes() {
        let mut old = Attributes::new();
        old.insert("cidr".to_string(), json!("10.0.0.0/16"));
        old.insert("name".to_string(), json!("main"));
        old.insert("legacy".to_string(), json!(true));

        let mut new = ResolvedAttributes::new();
        new.insert("cidr".to_string(), Resolved::Known(json!("10.0.0.0/16")));
        new.insert("name".to_string(), Resolved::Known(json!("primary")));
        new.insert(
            "gateway".to_string(),
            Resolved::Unknown(ResourceKey::new("gateway", "gw").attr("id")),
        );

        assert_eq!(changed_attributes(&old, &new), ["gateway", "legacy", "name"]);
    }
}

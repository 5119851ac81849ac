//! Resource model - declared resources and their attributes
//!
//! A resource is identified by `(type, name)` and holds a mapping of
//! attribute name to value, where a value is either a literal or a
//! reference to another resource's attribute (`type.name.attribute`).

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Concrete attribute values as reported by providers and stored in state.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Unique key of a resource: `type.name`.
///
/// Keys order by type, then name. That order is the deterministic
/// tie-break used everywhere a set of independent resources is sorted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    resource_type: String,
    name: String,
}

impl ResourceKey {
    /// Create a key without validating the segments.
    ///
    /// Keys coming from user input go through [`FromStr`] instead.
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Create a key, validating both segments.
    pub fn parse_parts(resource_type: &str, name: &str) -> Result<Self, ValidationError> {
        if is_identifier(resource_type) && is_identifier(name) {
            Ok(Self::new(resource_type, name))
        } else {
            Err(ValidationError::InvalidKey(format!("{resource_type}.{name}")))
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference an attribute of this resource.
    pub fn attr(&self, attribute: impl Into<String>) -> AttrRef {
        AttrRef {
            key: self.clone(),
            attribute: attribute.into(),
        }
    }
}

/// Identifier segments: ASCII alphanumerics, `_` and `-`.
pub(crate) fn is_identifier(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((resource_type, name)) if !name.contains('.') => {
                Self::parse_parts(resource_type, name)
            }
            _ => Err(ValidationError::InvalidKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

/// A reference to another resource's attribute: `type.name.attribute`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttrRef {
    pub key: ResourceKey,
    pub attribute: String,
}

impl fmt::Display for AttrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.attribute)
    }
}

impl FromStr for AttrRef {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [resource_type, name, attribute] if is_identifier(attribute) => {
                Ok(ResourceKey::parse_parts(resource_type, name)?.attr(*attribute))
            }
            _ => Err(ValidationError::InvalidKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for AttrRef {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AttrRef> for String {
    fn from(reference: AttrRef) -> Self {
        reference.to_string()
    }
}

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Literal(serde_json::Value),
    Reference(AttrRef),
}

impl Value {
    pub fn as_reference(&self) -> Option<&AttrRef> {
        match self {
            Self::Reference(reference) => Some(reference),
            Self::Literal(_) => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<AttrRef> for Value {
    fn from(reference: AttrRef) -> Self {
        Self::Reference(reference)
    }
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ResourceKey,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit ordering dependencies with no attribute reference
    #[serde(default)]
    pub depends_on: Vec<ResourceKey>,
}

impl Resource {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Set an attribute (builder style).
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    /// Add an explicit dependency (builder style).
    pub fn depends_on(mut self, key: ResourceKey) -> Self {
        if !self.depends_on.contains(&key) {
            self.depends_on.push(key);
        }
        self
    }

    /// Attribute references declared by this resource.
    pub fn references(&self) -> impl Iterator<Item = &AttrRef> {
        self.attributes.values().filter_map(Value::as_reference)
    }

    /// Every resource this one must come after: referenced resources plus
    /// explicit `depends_on` entries.
    pub fn dependency_keys(&self) -> BTreeSet<ResourceKey> {
        self.references()
            .map(|r| r.key.clone())
            .chain(self.depends_on.iter().cloned())
            .collect()
    }
}

/// The full set of declared resources, keyed and ordered by [`ResourceKey`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    resources: BTreeMap<ResourceKey, Resource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from resources, rejecting duplicate keys.
    pub fn from_resources(
        resources: impl IntoIterator<Item = Resource>,
    ) -> Result<Self, ValidationError> {
        let mut set = Self::new();
        for resource in resources {
            set.insert(resource)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, resource: Resource) -> Result<(), ValidationError> {
        if self.resources.contains_key(&resource.key) {
            return Err(ValidationError::DuplicateResource(resource.key));
        }
        self.resources.insert(resource.key.clone(), resource);
        Ok(())
    }

    /// Merge another set into this one, rejecting duplicate keys.
    pub fn extend(&mut self, other: ResourceSet) -> Result<(), ValidationError> {
        for resource in other.resources.into_values() {
            self.insert(resource)?;
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &ResourceKey) -> Option<Resource> {
        self.resources.remove(key)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Resource> {
        self.resources.get(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.resources.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.resources.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_parse_and_display() {
        let key: ResourceKey = "network.vpc1".parse().unwrap();
        assert_eq!(key.resource_type(), "network");
        assert_eq!(key.name(), "vpc1");
        assert_eq!(key.to_string(), "network.vpc1");

        assert!("network".parse::<ResourceKey>().is_err());
        assert!("a.b.c".parse::<ResourceKey>().is_err());
        assert!(".vpc1".parse::<ResourceKey>().is_err());
        assert!("network.vpc 1".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_key_ordering_is_type_then_name() {
        let mut keys = vec![
            ResourceKey::new("subnet", "a"),
            ResourceKey::new("network", "z"),
            ResourceKey::new("network", "b"),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["network.b", "network.z", "subnet.a"]);
    }

    #[test]
    fn test_attr_ref_parse() {
        let reference: AttrRef = "network.vpc1.id".parse().unwrap();
        assert_eq!(reference.key, ResourceKey::new("network", "vpc1"));
        assert_eq!(reference.attribute, "id");
        assert!("network.vpc1".parse::<AttrRef>().is_err());
    }

    #[test]
    fn test_key_serializes_as_string() {
        let key = ResourceKey::new("network", "vpc1");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"network.vpc1\"");

        let parsed: ResourceKey = serde_json::from_str("\"subnet.sub1\"").unwrap();
        assert_eq!(parsed, ResourceKey::new("subnet", "sub1"));
        assert!(serde_json::from_str::<ResourceKey>("\"nodot\"").is_err());
    }

    #[test]
    fn test_dependency_keys_merge_references_and_depends_on() {
        let vpc = ResourceKey::new("network", "vpc1");
        let gateway = ResourceKey::new("gateway", "gw");
        let subnet = Resource::new(ResourceKey::new("subnet", "sub1"))
            .with("vpc_id", vpc.attr("id"))
            .with("cidr", json!("10.0.1.0/24"))
            .depends_on(gateway.clone());

        let deps = subnet.dependency_keys();
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&vpc));
        assert!(deps.contains(&gateway));
    }

    #[test]
    fn test_resource_set_rejects_duplicates() {
        let key = ResourceKey::new("network", "vpc1");
        let result = ResourceSet::from_resources([
            Resource::new(key.clone()),
            Resource::new(key.clone()),
        ]);
        assert_eq!(result, Err(ValidationError::DuplicateResource(key)));
    }
}

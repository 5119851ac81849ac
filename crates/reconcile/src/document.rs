//! Declarative definition documents
//!
//! Resources are declared in TOML (or JSON) documents:
//!
//! ```toml
//! [[resource]]
//! type = "network"
//! name = "vpc1"
//! [resource.attributes]
//! cidr = "10.0.0.0/16"
//!
//! [[resource]]
//! type = "subnet"
//! name = "sub1"
//! [resource.attributes]
//! vpc_id = "${network.vpc1.id}"
//! ```
//!
//! A string whose whole value is `${type.name.attribute}` is a reference.
//! Nothing is interpolated or evaluated; `$${...}` escapes a literal.

use crate::error::ValidationError;
use crate::model::{AttrRef, Resource, ResourceKey, ResourceSet, Value};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

static REFERENCE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^\$\{([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\}$")
        .expect("reference pattern is valid")
});

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// Detect the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Some(Self::Toml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    #[serde(default)]
    resource: Vec<ResourceDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceDef {
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

/// Parse a single document into a resource set.
///
/// `origin` is only used in error messages.
pub fn parse_str(source: &str, format: Format, origin: &Path) -> Result<ResourceSet, ValidationError> {
    let document: Document = match format {
        Format::Toml => toml::from_str(source).map_err(|e| ValidationError::Document {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?,
        Format::Json => serde_json::from_str(source).map_err(|e| ValidationError::Document {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?,
    };

    let mut set = ResourceSet::new();
    for def in document.resource {
        set.insert(convert_resource(def)?)?;
    }
    Ok(set)
}

/// Load definitions from a file, or from every `*.toml` / `*.json` file
/// directly inside a directory (in file name order).
pub fn load_path(path: &Path) -> Result<ResourceSet, ValidationError> {
    if path.is_file() {
        return load_file(path);
    }

    if !path.is_dir() {
        return Err(ValidationError::Document {
            path: path.to_path_buf(),
            message: "no such file or directory".to_string(),
        });
    }

    let mut set = ResourceSet::new();
    for entry in WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| ValidationError::Document {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_file() && Format::from_path(entry.path()).is_some() {
            log::debug!("Loading definitions from {}", entry.path().display());
            set.extend(load_file(entry.path())?)?;
        }
    }
    Ok(set)
}

fn load_file(path: &Path) -> Result<ResourceSet, ValidationError> {
    let format = Format::from_path(path).ok_or_else(|| ValidationError::Document {
        path: path.to_path_buf(),
        message: "expected a .toml or .json file".to_string(),
    })?;
    let source = fs::read_to_string(path).map_err(|e| ValidationError::Document {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_str(&source, format, path)
}

fn convert_resource(def: ResourceDef) -> Result<Resource, ValidationError> {
    let key = ResourceKey::parse_parts(&def.resource_type, &def.name)?;
    let mut resource = Resource::new(key.clone());

    for dependency in &def.depends_on {
        resource = resource.depends_on(dependency.parse()?);
    }

    for (attribute, raw) in def.attributes {
        let value = convert_value(&key, &attribute, raw)?;
        resource.attributes.insert(attribute, value);
    }

    Ok(resource)
}

fn convert_value(
    key: &ResourceKey,
    attribute: &str,
    raw: serde_json::Value,
) -> Result<Value, ValidationError> {
    let malformed = |message: &str| ValidationError::MalformedAttribute {
        key: key.clone(),
        attribute: attribute.to_string(),
        message: message.to_string(),
    };

    match raw {
        serde_json::Value::String(s) => {
            if let Some(escaped) = s.strip_prefix("$${") {
                return Ok(Value::Literal(serde_json::Value::String(format!("${{{escaped}"))));
            }
            if !looks_like_reference(&s) {
                return Ok(Value::Literal(serde_json::Value::String(s)));
            }
            let caps = REFERENCE
                .captures(&s)
                .ok_or_else(|| malformed("references must have the form ${type.name.attribute}"))?;
            let reference = AttrRef {
                key: ResourceKey::new(&caps[1], &caps[2]),
                attribute: caps[3].to_string(),
            };
            Ok(Value::Reference(reference))
        }
        other => {
            if contains_reference(&other) {
                return Err(malformed(
                    "references are only allowed as whole attribute values",
                ));
            }
            Ok(Value::Literal(other))
        }
    }
}

fn looks_like_reference(s: &str) -> bool {
    s.starts_with("${") && s.ends_with('}')
}

fn contains_reference(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => looks_like_reference(s),
        serde_json::Value::Array(items) => items.iter().any(contains_reference),
        serde_json::Value::Object(map) => map.values().any(contains_reference),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn origin() -> PathBuf {
        PathBuf::from("test.toml")
    }

    #[test]
    fn test_parse_toml_with_reference() {
        let source = r#"
[[resource]]
type = "network"
name = "vpc1"
[resource.attributes]
cidr = "10.0.0.0/16"
tags = { env = "prod" }

[[resource]]
type = "subnet"
name = "sub1"
depends_on = ["network.vpc1"]
[resource.attributes]
vpc_id = "${network.vpc1.id}"
zones = ["a", "b"]
"#;
        let set = parse_str(source, Format::Toml, &origin()).unwrap();
        assert_eq!(set.len(), 2);

        let vpc = set.get(&ResourceKey::new("network", "vpc1")).unwrap();
        assert_eq!(
            vpc.attributes["cidr"],
            Value::Literal(json!("10.0.0.0/16"))
        );
        assert_eq!(vpc.attributes["tags"], Value::Literal(json!({"env": "prod"})));

        let subnet = set.get(&ResourceKey::new("subnet", "sub1")).unwrap();
        assert_eq!(
            subnet.attributes["vpc_id"],
            Value::Reference(ResourceKey::new("network", "vpc1").attr("id"))
        );
        assert_eq!(subnet.depends_on, vec![ResourceKey::new("network", "vpc1")]);
    }

    #[test]
    fn test_parse_json() {
        let source = r#"{"resource": [{"type": "bucket", "name": "logs", "attributes": {"versioned": true}}]}"#;
        let set = parse_str(source, Format::Json, Path::new("defs.json")).unwrap();
        let bucket = set.get(&ResourceKey::new("bucket", "logs")).unwrap();
        assert_eq!(bucket.attributes["versioned"], Value::Literal(json!(true)));
    }

    #[test]
    fn test_malformed_reference_rejected() {
        let source = r#"
[[resource]]
type = "subnet"
name = "sub1"
[resource.attributes]
vpc_id = "${network.vpc1}"
"#;
        let err = parse_str(source, Format::Toml, &origin()).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedAttribute { ref attribute, .. } if attribute == "vpc_id"));
    }

    #[test]
    fn test_nested_reference_rejected() {
        let source = r#"
[[resource]]
type = "subnet"
name = "sub1"
[resource.attributes]
routes = ["${network.vpc1.id}"]
"#;
        let err = parse_str(source, Format::Toml, &origin()).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedAttribute { .. }));
    }

    #[test]
    fn test_escaped_reference_is_literal() {
        let source = r#"
[[resource]]
type = "template"
name = "t"
[resource.attributes]
body = "$${not.a.ref}"
"#;
        let set = parse_str(source, Format::Toml, &origin()).unwrap();
        let template = set.get(&ResourceKey::new("template", "t")).unwrap();
        assert_eq!(template.attributes["body"], Value::Literal(json!("${not.a.ref}")));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let source = r#"
[[resource]]
type = "network"
name = "vpc.1"
"#;
        let err = parse_str(source, Format::Toml, &origin()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidKey(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let source = r#"
[[resource]]
type = "network"
name = "vpc1"
count = 3
"#;
        let err = parse_str(source, Format::Toml, &origin()).unwrap_err();
        assert!(matches!(err, ValidationError::Document { .. }));
    }

    #[test]
    fn test_load_directory_merges_files_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("01-network.toml"),
            "[[resource]]\ntype = \"network\"\nname = \"vpc1\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("02-subnet.json"),
            r#"{"resource": [{"type": "subnet", "name": "sub1", "attributes": {"vpc_id": "${network.vpc1.id}"}}]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let set = load_path(dir.path()).unwrap();
        assert_eq!(set.len(), 2);

        fs::write(
            dir.path().join("03-dup.toml"),
            "[[resource]]\ntype = \"network\"\nname = \"vpc1\"\n",
        )
        .unwrap();
        let err = load_path(dir.path()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DuplicateResource(ResourceKey::new("network", "vpc1"))
        );
    }
}

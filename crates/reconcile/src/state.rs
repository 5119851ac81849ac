//! State store - last known real-world state per resource
//!
//! The state is a versioned JSON document keyed by `type.name`. It is owned
//! by a [`StateStore`] that is passed explicitly to the components that need
//! it. Mutations require proof of the exclusive lock and are committed to
//! disk atomically (temp file + rename) inside one short critical section.

use crate::error::{ReconcileError, Result, StateError};
use crate::lock::LockGuard;
use crate::model::{AttrRef, Attributes, ResourceKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Current state schema version.
pub const STATE_VERSION: u32 = 2;

/// How a resource drifted from its stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Remote attributes differ from the stored attributes
    Changed,
    /// The remote object no longer exists
    Missing,
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Changed => write!(f, "changed"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

/// Last applied snapshot of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Identifier assigned by the provider
    pub provider_id: String,
    /// Hash of the resolved inputs that were last applied
    pub attribute_hash: String,
    /// Attributes reported by the provider (inputs plus computed outputs)
    #[serde(default)]
    pub attributes: Attributes,
    /// Resolved inputs that were last applied
    #[serde(default)]
    pub inputs: Attributes,
    /// Resources this one depended on when it was last applied
    #[serde(default)]
    pub dependencies: Vec<ResourceKey>,
    /// Remote state is indeterminate; the resource must be replaced
    #[serde(default)]
    pub tainted: bool,
    /// Set by refresh when the remote object diverged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftKind>,
    /// Objects replaced create-before-destroy whose delete has not succeeded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<DeposedObject>,
    pub updated_at: DateTime<Utc>,
}

/// A superseded remote object that still has to be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeposedObject {
    pub provider_id: String,
    pub deposed_at: DateTime<Utc>,
}

/// The persisted state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    /// Incremented on every committed write
    pub serial: u64,
    /// Fixed at creation; distinguishes unrelated state files
    pub lineage: String,
    #[serde(default)]
    pub resources: BTreeMap<ResourceKey, StateRecord>,
}

impl StateDocument {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: new_lineage(),
            resources: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&StateRecord> {
        self.resources.get(key)
    }

    /// Value of a stored attribute, used to resolve references.
    pub fn attribute(&self, reference: &AttrRef) -> Option<&serde_json::Value> {
        self.resources
            .get(&reference.key)
            .and_then(|record| record.attributes.get(&reference.attribute))
    }

    /// Parse a document, migrating older schema versions forward.
    pub fn from_json(content: &str) -> std::result::Result<Self, MigrationError> {
        let raw: serde_json::Value = serde_json::from_str(content)?;
        let upgraded = upgrade(raw)?;
        Ok(serde_json::from_value(upgraded)?)
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a state document could not be loaded.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("unsupported state version {0}")]
    UnsupportedVersion(u64),
}

fn new_lineage() -> String {
    let mut hasher = blake3::Hasher::new();
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// Bring a raw document up to [`STATE_VERSION`].
///
/// Version 1 had no serial or lineage, and records carried only
/// `provider_id`, `attribute_hash`, `attributes` and `tainted`.
fn upgrade(mut raw: serde_json::Value) -> std::result::Result<serde_json::Value, MigrationError> {
    let found = raw
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(1);
    let version = match u32::try_from(found) {
        Ok(version) if version <= STATE_VERSION => version,
        _ => return Err(MigrationError::UnsupportedVersion(found)),
    };

    if version == 1
        && let Some(doc) = raw.as_object_mut()
    {
        log::info!("Migrating state from schema version 1 to {STATE_VERSION}");
        doc.insert("version".to_string(), STATE_VERSION.into());
        doc.entry("serial").or_insert(0.into());
        doc.entry("lineage").or_insert(new_lineage().into());

        let now = serde_json::Value::String(Utc::now().to_rfc3339());
        if let Some(resources) = doc.get_mut("resources").and_then(|r| r.as_object_mut()) {
            for record in resources.values_mut().filter_map(|r| r.as_object_mut()) {
                let attributes = record
                    .get("attributes")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                record.entry("inputs").or_insert(attributes);
                record.entry("updated_at").or_insert(now.clone());
            }
        }
    }

    Ok(raw)
}

/// Owner of the state document for one plan/apply invocation.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    document: Mutex<StateDocument>,
}

impl StateStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::from_document(StateDocument::new())
    }

    pub fn from_document(document: StateDocument) -> Self {
        Self {
            path: None,
            document: Mutex::new(document),
        }
    }

    /// Open a state file, or start an empty state if it does not exist yet.
    ///
    /// Nothing is written until the first commit.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = load_document(&path)?.unwrap_or_else(|| {
            log::debug!("State file {} does not exist, starting empty", path.display());
            StateDocument::new()
        });
        Ok(Self {
            path: Some(path),
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the state file, picking up writes made by other processes.
    ///
    /// Call after acquiring a lock and before planning.
    pub fn reload(&self) -> Result<()> {
        if let Some(path) = &self.path
            && let Some(document) = load_document(path)?
        {
            *self.lock_document() = document;
        }
        Ok(())
    }

    /// Immutable copy of the current document, for planning.
    pub fn snapshot(&self) -> StateDocument {
        self.lock_document().clone()
    }

    pub fn serial(&self) -> u64 {
        self.lock_document().serial
    }

    pub fn lineage(&self) -> String {
        self.lock_document().lineage.clone()
    }

    pub fn record(&self, key: &ResourceKey) -> Option<StateRecord> {
        self.lock_document().resources.get(key).cloned()
    }

    pub fn attribute(&self, reference: &AttrRef) -> Option<serde_json::Value> {
        self.lock_document().attribute(reference).cloned()
    }

    /// Store the result of a successful create or update.
    ///
    /// Deposed objects of the previous record are carried over. If the
    /// previous record pointed at a different remote object that was not
    /// already gone, that object is deposed in the same commit so it stays
    /// tracked until it is deleted.
    pub fn record_applied(
        &self,
        guard: &LockGuard,
        key: &ResourceKey,
        record: StateRecord,
    ) -> Result<()> {
        self.commit(guard, |doc| {
            let mut record = record;
            if let Some(previous) = doc.resources.remove(key) {
                let superseded = previous.provider_id != record.provider_id
                    && previous.drift != Some(DriftKind::Missing);
                record.deposed.extend(previous.deposed);
                if superseded {
                    log::debug!("{key}: deposing {} until it is deleted", previous.provider_id);
                    record.deposed.push(DeposedObject {
                        provider_id: previous.provider_id,
                        deposed_at: Utc::now(),
                    });
                }
            }
            doc.resources.insert(key.clone(), record);
        })
    }

    /// Forget a deleted remote object.
    ///
    /// With `provider_id`, only that object is forgotten: the record if it
    /// still refers to it, otherwise a matching deposed object. A record
    /// whose deposed objects are not all deleted yet is kept.
    pub fn record_deleted(
        &self,
        guard: &LockGuard,
        key: &ResourceKey,
        provider_id: Option<&str>,
    ) -> Result<()> {
        self.commit(guard, |doc| {
            let Some(record) = doc.resources.get_mut(key) else {
                return;
            };
            match provider_id {
                Some(id) if record.provider_id != id => {
                    record.deposed.retain(|d| d.provider_id != id);
                }
                _ if !record.deposed.is_empty() => {
                    log::warn!(
                        "{key}: current object deleted while {} deposed objects remain",
                        record.deposed.len()
                    );
                    record.drift = Some(DriftKind::Missing);
                }
                _ => {
                    doc.resources.remove(key);
                }
            }
        })
    }

    /// Flag a resource whose remote state is indeterminate.
    ///
    /// Returns whether a flag was stored; nothing is stored when the record
    /// is gone or refers to another object.
    pub fn mark_tainted(
        &self,
        guard: &LockGuard,
        key: &ResourceKey,
        provider_id: Option<&str>,
    ) -> Result<bool> {
        let mut stored = false;
        self.commit(guard, |doc| {
            if let Some(record) = doc.resources.get_mut(key)
                && provider_id.is_none_or(|id| record.provider_id == id)
            {
                record.tainted = true;
                record.updated_at = Utc::now();
                stored = true;
            }
        })?;
        Ok(stored)
    }

    /// Record drift found by refresh.
    pub fn mark_drift(&self, guard: &LockGuard, key: &ResourceKey, kind: DriftKind) -> Result<()> {
        self.commit(guard, |doc| {
            if let Some(record) = doc.resources.get_mut(key) {
                record.drift = Some(kind);
            }
        })
    }

    /// Clear a drift flag once the remote object matches again.
    pub fn clear_drift(&self, guard: &LockGuard, key: &ResourceKey) -> Result<()> {
        self.commit(guard, |doc| {
            if let Some(record) = doc.resources.get_mut(key) {
                record.drift = None;
            }
        })
    }

    /// Apply a mutation and persist it. Memory is only updated once the
    /// write succeeded.
    fn commit<F>(&self, guard: &LockGuard, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut StateDocument),
    {
        guard.ensure_exclusive()?;

        let mut document = self.lock_document();
        let mut next = document.clone();
        mutate(&mut next);
        next.serial += 1;

        if let Some(path) = &self.path {
            write_document(path, &next)?;
        }
        *document = next;
        Ok(())
    }

    fn lock_document(&self) -> MutexGuard<'_, StateDocument> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_document(path: &Path) -> Result<Option<StateDocument>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source,
            }
            .into());
        }
    };

    let document = StateDocument::from_json(&content).map_err(|e| match e {
        MigrationError::Json(source) => StateError::Parse {
            path: path.to_path_buf(),
            source,
        },
        MigrationError::UnsupportedVersion(found) => StateError::UnsupportedVersion {
            found,
            supported: STATE_VERSION,
        },
    })?;

    log::debug!(
        "Loaded state from {} (serial {}, {} resources)",
        path.display(),
        document.serial,
        document.resources.len()
    );
    Ok(Some(document))
}

fn write_document(path: &Path, document: &StateDocument) -> Result<()> {
    let write_err = |source| -> ReconcileError {
        StateError::Write {
            path: path.to_path_buf(),
            source,
        }
        .into()
    };

    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(write_err)?;
    }

    let content = serde_json::to_string_pretty(document).map_err(StateError::from)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, content).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;

    log::debug!(
        "Saved state to {} (serial {})",
        path.display(),
        document.serial
    );
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

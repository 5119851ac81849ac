//! Local file-backed provider
//!
//! Every remote object is a JSON file `<sandbox>/<provider_id>.json`. Lets
//! the CLI run end to end without any cloud account, and drift can be
//! simulated by editing or deleting those files.

use chrono::Utc;
use reconcile::{Attributes, Created, Provider, ProviderError, ResolvedResource, ResourceKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Serialize, Deserialize)]
struct StoredObject {
    key: ResourceKey,
    attributes: Attributes,
}

#[derive(Debug)]
pub struct LocalProvider {
    root: PathBuf,
    sequence: AtomicU64,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sequence: AtomicU64::new(0),
        }
    }

    fn object_path(&self, provider_id: &str) -> PathBuf {
        self.root.join(format!("{provider_id}.json"))
    }

    fn new_id(&self, key: &ResourceKey) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("{}-{nanos:x}{sequence:02x}", key.resource_type())
    }

    fn load(&self, key: &ResourceKey, provider_id: &str) -> Result<Option<StoredObject>, ProviderError> {
        let path = self.object_path(provider_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(key, &path, &e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ProviderError::Other(format!("{}: corrupt object: {e}", path.display())))
    }

    fn store(&self, key: &ResourceKey, provider_id: &str, attributes: &Attributes) -> Result<(), ProviderError> {
        let path = self.object_path(provider_id);
        fs::create_dir_all(&self.root).map_err(|e| io_error(key, &self.root, &e))?;

        let object = StoredObject {
            key: key.clone(),
            attributes: attributes.clone(),
        };
        let content = serde_json::to_vec_pretty(&object)
            .map_err(|e| ProviderError::Other(format!("{key}: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| io_error(key, &path, &e))
    }
}

fn io_error(key: &ResourceKey, path: &Path, error: &io::Error) -> ProviderError {
    let message = format!("{key}: {}: {error}", path.display());
    match error.kind() {
        ErrorKind::NotFound => ProviderError::NotFound { message },
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => {
            ProviderError::Rejected { message }
        }
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            ProviderError::Transient { message }
        }
        _ => ProviderError::Other(message),
    }
}

fn with_id(attributes: &Attributes, provider_id: &str) -> Attributes {
    let mut attributes = attributes.clone();
    attributes.insert(
        "id".to_string(),
        serde_json::Value::String(provider_id.to_string()),
    );
    attributes
}

impl Provider for LocalProvider {
    fn create(&self, resource: &ResolvedResource) -> Result<Created, ProviderError> {
        let provider_id = self.new_id(&resource.key);
        let attributes = with_id(&resource.attributes, &provider_id);
        self.store(&resource.key, &provider_id, &attributes)?;
        log::debug!("Stored {} as {}", resource.key, provider_id);
        Ok(Created {
            provider_id,
            attributes,
        })
    }

    fn update(
        &self,
        resource: &ResolvedResource,
        provider_id: &str,
        _old: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        if self.load(&resource.key, provider_id)?.is_none() {
            return Err(ProviderError::NotFound {
                message: format!("{} ({provider_id})", resource.key),
            });
        }
        let attributes = with_id(&resource.attributes, provider_id);
        self.store(&resource.key, provider_id, &attributes)?;
        Ok(attributes)
    }

    fn delete(&self, key: &ResourceKey, provider_id: &str) -> Result<(), ProviderError> {
        let path = self.object_path(provider_id);
        fs::remove_file(&path).map_err(|e| io_error(key, &path, &e))
    }

    fn read(&self, key: &ResourceKey, provider_id: &str) -> Result<Option<Attributes>, ProviderError> {
        Ok(self.load(key, provider_id)?.map(|object| object.attributes))
    }
}

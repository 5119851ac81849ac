//! Drift detection
//!
//! Reads every recorded resource back from its provider and flags the ones
//! whose remote object changed or vanished. Stored attributes are never
//! overwritten; the flag makes the next diff treat the resource as changed.

use crate::error::{ProviderError, ReconcileError, Result};
use crate::lock::LockGuard;
use crate::model::{Attributes, ResourceKey};
use crate::provider::ProviderRegistry;
use crate::retry::with_retry;
use crate::scheduler::call_with_timeout;
use crate::state::{DriftKind, StateRecord, StateStore};
use rayon::prelude::*;
use std::collections::BTreeSet;

/// A resource whose remote object no longer matches state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftWarning {
    pub key: ResourceKey,
    pub kind: DriftKind,
    /// Attributes that differ (empty when the object is missing)
    pub changed: Vec<String>,
}

impl DriftWarning {
    pub fn to_error(&self) -> ReconcileError {
        ReconcileError::Drift {
            key: self.key.clone(),
            kind: self.kind,
        }
    }
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub checked: usize,
    pub drift: Vec<DriftWarning>,
    /// Resources that could not be read
    pub errors: Vec<(ResourceKey, ProviderError)>,
}

impl RefreshReport {
    pub fn has_drift(&self) -> bool {
        !self.drift.is_empty()
    }
}

enum Observation {
    InSync,
    Drifted(DriftWarning),
    Unreadable(ProviderError),
}

/// Compare every state record with its remote object.
///
/// Requires the exclusive lock because drift flags are written to state.
pub fn refresh(state: &StateStore, registry: &ProviderRegistry, guard: &LockGuard) -> Result<RefreshReport> {
    guard.ensure_exclusive()?;

    let snapshot = state.snapshot();
    for key in snapshot.resources.keys() {
        registry.provider_for(key)?;
    }

    let observations: Vec<(ResourceKey, Option<DriftKind>, Observation)> = snapshot
        .resources
        .par_iter()
        .map(|(key, record)| (key.clone(), record.drift, observe(registry, key, record)))
        .collect();

    let mut report = RefreshReport {
        checked: observations.len(),
        ..RefreshReport::default()
    };

    for (key, previous, observation) in observations {
        match observation {
            Observation::InSync => {
                if previous.is_some() {
                    log::info!("{key} matches state again");
                    state.clear_drift(guard, &key)?;
                }
            }
            Observation::Drifted(warning) => {
                log::warn!("{}", warning.to_error());
                if previous != Some(warning.kind) {
                    state.mark_drift(guard, &key, warning.kind)?;
                }
                report.drift.push(warning);
            }
            Observation::Unreadable(error) => {
                log::warn!("Could not refresh {key}: {error}");
                report.errors.push((key, error));
            }
        }
    }

    log::info!(
        "Refreshed {} resources: {} drifted, {} unreadable",
        report.checked,
        report.drift.len(),
        report.errors.len()
    );
    Ok(report)
}

fn observe(registry: &ProviderRegistry, key: &ResourceKey, record: &StateRecord) -> Observation {
    let Ok(provider) = registry.provider_for(key) else {
        return Observation::InSync;
    };
    let schema = registry.schema_or_default(key);

    let attempted = with_retry(&schema.retry, key, || {
        let target = key.clone();
        let provider_id = record.provider_id.clone();
        call_with_timeout(key, schema.timeout, provider.clone(), move |p| {
            p.read(&target, &provider_id)
        })
    });

    match attempted.result {
        Ok(None) | Err(ProviderError::NotFound { .. }) => Observation::Drifted(DriftWarning {
            key: key.clone(),
            kind: DriftKind::Missing,
            changed: Vec::new(),
        }),
        Ok(Some(remote)) => {
            let changed = differing(&record.attributes, &remote);
            if changed.is_empty() {
                Observation::InSync
            } else {
                Observation::Drifted(DriftWarning {
                    key: key.clone(),
                    kind: DriftKind::Changed,
                    changed,
                })
            }
        }
        Err(error) => Observation::Unreadable(error),
    }
}

fn differing(stored: &Attributes, remote: &Attributes) -> Vec<String> {
    let names: BTreeSet<&String> = stored.keys().chain(remote.keys()).collect();
    names
        .into_iter()
        .filter(|name| stored.get(*name) != remote.get(*name))
        .cloned()
        .collect()
}

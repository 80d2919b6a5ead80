//! Lifecycle state and its on-disk cache.
//!
//! The state is only a cache of what the substrate looks like. Losing it is
//! harmless: every resource can be re-probed.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tierlab_vm::{ResourceId, ResourceState};
use tracing::{debug, warn};

/// Current state file format.
const STATE_VERSION: u32 = 1;

/// Last known state of every resource of a topology.
///
/// Absent resources are not stored: looking one up yields `None`, which
/// makes the orchestrator probe it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LifecycleState {
    resources: BTreeMap<ResourceId, ResourceState>,
}

impl LifecycleState {
    /// Empty state; everything will be probed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached state of `id`, if known.
    pub fn get(&self, id: &ResourceId) -> Option<ResourceState> {
        self.resources.get(id).copied()
    }

    /// Record `state` for `id`. Recording `Absent` forgets the resource.
    pub fn set(&mut self, id: ResourceId, state: ResourceState) {
        if state == ResourceState::Absent {
            self.resources.remove(&id);
        } else {
            self.resources.insert(id, state);
        }
    }

    /// Forget `id`, returning its last state.
    pub fn remove(&mut self, id: &ResourceId) -> Option<ResourceState> {
        self.resources.remove(id)
    }

    /// Known resources in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, ResourceState)> {
        self.resources.iter().map(|(id, state)| (id, *state))
    }

    /// Whether `id` was left mid-operation by an interrupted run.
    pub fn is_transitional(&self, id: &ResourceId) -> bool {
        self.get(id).is_some_and(ResourceState::is_transitional)
    }

    /// Number of known resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether nothing is known.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    updated_at: DateTime<Utc>,
    resources: LifecycleState,
}

/// JSON persistence of a [`LifecycleState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached state. A missing file yields an empty state.
    pub fn try_load(&self) -> Result<LifecycleState> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting empty");
                return Ok(LifecycleState::new());
            }
            Err(e) => return Err(self.error(e.to_string())),
        };

        let file: StateFile =
            serde_json::from_str(&json).map_err(|e| self.error(format!("malformed: {e}")))?;
        if file.version != STATE_VERSION {
            return Err(self.error(format!("unsupported version {}", file.version)));
        }
        Ok(file.resources)
    }

    /// Read the cached state, falling back to an empty state (and probing)
    /// when the file cannot be used.
    pub fn load(&self) -> LifecycleState {
        self.try_load().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring state cache");
            LifecycleState::new()
        })
    }

    /// Write `state` atomically: readers see either the old or the new file.
    pub fn save(&self, state: &LifecycleState) -> Result<()> {
        let file = StateFile {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: state.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| self.error(e.to_string()))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| self.error(e.to_string()))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.write_all(b"\n"))
            .map_err(|e| self.error(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| self.error(e.error.to_string()))?;

        debug!(path = %self.path.display(), resources = state.len(), "State saved");
        Ok(())
    }

    fn error(&self, message: String) -> CoreError {
        CoreError::State {
            path: self.path.clone(),
            message,
        }
    }
}

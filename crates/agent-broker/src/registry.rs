use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::director::TaskId;
use crate::models::Instance;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeOutcome {
    InProgress,
    Healthy,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrackedUpgrade {
    pub task_id: TaskId,
    pub outcome: UpgradeOutcome,
}

#[derive(Default)]
struct RegistryState {
    instances: HashMap<String, Instance>,
    upgrades: HashMap<String, TrackedUpgrade>,
}

/// The broker's instance table.
///
/// Every access goes through one reader/writer lock. Mutations write a
/// snapshot while still holding the lock, so snapshots are never reordered.
/// Callers must copy what they need out and drop back to the registry only
/// to apply results; no method here does network I/O.
#[derive(Clone)]
pub struct InstanceRegistry {
    state: Arc<RwLock<RegistryState>>,
    persistence: Option<Arc<SnapshotStore>>,
}

impl InstanceRegistry {
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            persistence: None,
        }
    }

    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let store = SnapshotStore::new(path);
        let instances = store.load()?;
        info!(
            instances = instances.len(),
            path = %store.path.display(),
            "loaded instance registry"
        );
        let instances = instances
            .into_iter()
            .map(|instance| (instance.instance_id.clone(), instance))
            .collect();
        Ok(Self {
            state: Arc::new(RwLock::new(RegistryState {
                instances,
                upgrades: HashMap::new(),
            })),
            persistence: Some(Arc::new(store)),
        })
    }

    pub async fn get(&self, instance_id: &str) -> Option<Instance> {
        self.state.read().await.instances.get(instance_id).cloned()
    }

    pub async fn put(&self, instance: Instance) {
        let mut state = self.state.write().await;
        state
            .instances
            .insert(instance.instance_id.clone(), instance);
        self.persist(&state);
    }

    pub async fn delete(&self, instance_id: &str) -> Option<Instance> {
        let mut state = self.state.write().await;
        let removed = state.instances.remove(instance_id);
        if removed.is_some() {
            state.upgrades.remove(instance_id);
            self.persist(&state);
        }
        removed
    }

    pub async fn list(&self, predicate: impl Fn(&Instance) -> bool) -> Vec<Instance> {
        let state = self.state.read().await;
        let mut matched: Vec<Instance> = state
            .instances
            .values()
            .filter(|instance| predicate(instance))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        matched
    }

    pub async fn count(&self, predicate: impl Fn(&Instance) -> bool) -> usize {
        let state = self.state.read().await;
        state
            .instances
            .values()
            .filter(|instance| predicate(instance))
            .count()
    }

    /// Atomic check-and-insert. Returns the existing record when the ID is taken.
    pub async fn insert_if_absent(&self, instance: Instance) -> Result<(), Instance> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.instances.get(&instance.instance_id) {
            return Err(existing.clone());
        }
        state
            .instances
            .insert(instance.instance_id.clone(), instance);
        self.persist(&state);
        Ok(())
    }

    /// Applies `f` to the record under the write lock. `None` when absent.
    pub async fn update<R>(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut Instance) -> R,
    ) -> Option<R> {
        self.update_if(instance_id, |_| true, f).await
    }

    /// Applies `f` only if `predicate` still holds under the write lock.
    /// `None` when the record is absent or the predicate fails; nothing is
    /// touched or persisted in that case.
    pub async fn update_if<R>(
        &self,
        instance_id: &str,
        predicate: impl FnOnce(&Instance) -> bool,
        f: impl FnOnce(&mut Instance) -> R,
    ) -> Option<R> {
        let mut state = self.state.write().await;
        let instance = state.instances.get_mut(instance_id)?;
        if !predicate(instance) {
            return None;
        }
        let out = f(instance);
        instance.touch();
        self.persist(&state);
        Some(out)
    }

    /// Removes the record only if `predicate` still holds under the write lock.
    pub async fn delete_if(
        &self,
        instance_id: &str,
        predicate: impl FnOnce(&Instance) -> bool,
    ) -> Option<Instance> {
        let mut state = self.state.write().await;
        if !state.instances.get(instance_id).is_some_and(predicate) {
            return None;
        }
        let removed = state.instances.remove(instance_id);
        state.upgrades.remove(instance_id);
        self.persist(&state);
        removed
    }

    pub async fn track_upgrade(&self, instance_id: &str, task_id: TaskId) {
        let mut state = self.state.write().await;
        state.upgrades.insert(
            instance_id.to_string(),
            TrackedUpgrade {
                task_id,
                outcome: UpgradeOutcome::InProgress,
            },
        );
    }

    pub async fn tracked_upgrades(&self) -> Vec<(String, TrackedUpgrade)> {
        let state = self.state.read().await;
        let mut tracked: Vec<(String, TrackedUpgrade)> = state
            .upgrades
            .iter()
            .map(|(id, track)| (id.clone(), track.clone()))
            .collect();
        tracked.sort_by(|a, b| a.0.cmp(&b.0));
        tracked
    }

    /// Records a terminal upgrade outcome and moves the instance to `next`,
    /// provided the tracked task is still the one that was polled.
    pub async fn settle_upgrade(
        &self,
        instance_id: &str,
        task_id: &TaskId,
        outcome: UpgradeOutcome,
        next: crate::models::LifecycleState,
    ) -> bool {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let Some(track) = state.upgrades.get_mut(instance_id) else {
            return false;
        };
        if &track.task_id != task_id {
            return false;
        }
        track.outcome = outcome;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            if instance.task_id.as_ref() == Some(task_id) {
                instance.state = next;
                instance.touch();
                self.persist(state);
            }
        }
        true
    }

    fn persist(&self, state: &RegistryState) {
        let Some(store) = &self.persistence else {
            return;
        };
        if let Err(err) = store.save(state.instances.values()) {
            error!(
                error = %format!("{err:#}"),
                path = %store.path.display(),
                "failed to persist instance registry"
            );
        }
    }
}

#[derive(Clone, Debug)]
struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> anyhow::Result<Vec<Instance>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read instance registry {}", self.path.display()))?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str(&data) {
            Ok(instances) => Ok(instances),
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.path.display(),
                    "failed to decode instance registry; starting with empty registry"
                );
                Ok(Vec::new())
            }
        }
    }

    fn save<'a>(&self, instances: impl Iterator<Item = &'a Instance>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("create instance registry directory {}", parent.display())
                })?;
            }
        }
        let mut snapshot: Vec<&Instance> = instances.collect();
        snapshot.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        let serialized =
            serde_json::to_string_pretty(&snapshot).context("encode instance registry json")?;
        let tmp_path = tmp_path(&self.path);
        std::fs::write(&tmp_path, serialized)
            .with_context(|| format!("write instance registry {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("persist instance registry {}", self.path.display()))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

pub mod http;

pub use http::DirectorClient;

/// Opaque reference to an in-flight backend operation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Queued,
    Processing,
    Done,
    Error,
    Cancelled,
    /// Any state the backend reports that we do not classify (e.g. `cancelling`).
    Other(String),
}

impl TaskState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "done" => Self::Done,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Cancelled)
    }
}

impl<'de> Deserialize<'de> for TaskState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three operations the broker needs from the deployment backend.
///
/// Implementations do I/O only. Callers must not hold the registry lock
/// across these calls.
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    async fn submit(&self, manifest: &[u8]) -> anyhow::Result<TaskId>;

    async fn delete(&self, deployment_name: &str) -> anyhow::Result<TaskId>;

    async fn task_state(&self, task: &TaskId) -> anyhow::Result<TaskState>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::sync::Notify;

    use super::*;

    /// Parks a backend call until the test releases it.
    #[derive(Default)]
    pub struct Gate {
        entered: Notify,
        release: Notify,
    }

    impl Gate {
        pub async fn entered(&self) {
            self.entered.notified().await;
        }

        pub fn release(&self) {
            self.release.notify_one();
        }

        async fn pass(&self) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    /// In-memory backend: hands out sequential task IDs, records what was sent,
    /// and reports whatever task state a test scripts.
    #[derive(Default)]
    pub struct FakeDirector {
        next_task: AtomicUsize,
        pub submits: AtomicUsize,
        pub deletes: AtomicUsize,
        pub polls: AtomicUsize,
        pub fail_submit: AtomicBool,
        pub fail_delete: AtomicBool,
        pub fail_poll: AtomicBool,
        pub manifests: Mutex<Vec<String>>,
        pub deleted: Mutex<Vec<String>>,
        states: Mutex<HashMap<TaskId, TaskState>>,
        submit_gate: Mutex<Option<Arc<Gate>>>,
        delete_gate: Mutex<Option<Arc<Gate>>>,
    }

    impl FakeDirector {
        pub fn set_state(&self, task: &TaskId, state: TaskState) {
            self.states
                .lock()
                .expect("fake director states")
                .insert(task.clone(), state);
        }

        pub fn submits(&self) -> usize {
            self.submits.load(Ordering::SeqCst)
        }

        pub fn deletes(&self) -> usize {
            self.deletes.load(Ordering::SeqCst)
        }

        pub fn last_manifest(&self) -> Option<String> {
            self.manifests
                .lock()
                .expect("fake director manifests")
                .last()
                .cloned()
        }

        /// Holds the next submit until the returned gate is released.
        pub fn hold_submit(&self) -> Arc<Gate> {
            let gate = Arc::new(Gate::default());
            *self.submit_gate.lock().expect("fake director gate") = Some(gate.clone());
            gate
        }

        /// Holds the next delete until the returned gate is released.
        pub fn hold_delete(&self) -> Arc<Gate> {
            let gate = Arc::new(Gate::default());
            *self.delete_gate.lock().expect("fake director gate") = Some(gate.clone());
            gate
        }

        fn issue_task(&self) -> TaskId {
            let id = self.next_task.fetch_add(1, Ordering::SeqCst) + 1;
            let task = TaskId::new(id.to_string());
            self.set_state(&task, TaskState::Queued);
            task
        }
    }

    #[async_trait]
    impl DeploymentClient for FakeDirector {
        async fn submit(&self, manifest: &[u8]) -> anyhow::Result<TaskId> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            let gate = self.submit_gate.lock().expect("fake director gate").take();
            if let Some(gate) = gate {
                gate.pass().await;
            }
            if self.fail_submit.load(Ordering::SeqCst) {
                anyhow::bail!("simulated submit failure");
            }
            self.manifests
                .lock()
                .expect("fake director manifests")
                .push(String::from_utf8_lossy(manifest).into_owned());
            Ok(self.issue_task())
        }

        async fn delete(&self, deployment_name: &str) -> anyhow::Result<TaskId> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            let gate = self.delete_gate.lock().expect("fake director gate").take();
            if let Some(gate) = gate {
                gate.pass().await;
            }
            if self.fail_delete.load(Ordering::SeqCst) {
                anyhow::bail!("simulated delete failure");
            }
            self.deleted
                .lock()
                .expect("fake director deletes")
                .push(deployment_name.to_string());
            Ok(self.issue_task())
        }

        async fn task_state(&self, task: &TaskId) -> anyhow::Result<TaskState> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.fail_poll.load(Ordering::SeqCst) {
                anyhow::bail!("simulated poll failure");
            }
            self.states
                .lock()
                .expect("fake director states")
                .get(task)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown task {task}"))
        }
    }
}

use std::sync::Arc;

use agent_broker_api::UpgradeStatusResponse;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::director::{DeploymentClient, TaskState};
use crate::error::BrokerError;
use crate::lifecycle::is_claimed;
use crate::manifest::ManifestRenderer;
use crate::models::{Instance, LifecycleState};
use crate::registry::{InstanceRegistry, UpgradeOutcome};
use crate::version::{SoftwareVersion, VersionPolicy};

/// Operator-driven fleet redeploys. Callers pick batch size and parallelism
/// per call, which is enough for canary-then-rolling upgrades.
#[derive(Clone)]
pub struct UpgradeOrchestrator {
    registry: InstanceRegistry,
    director: Arc<dyn DeploymentClient>,
    renderer: Arc<ManifestRenderer>,
    policy: VersionPolicy,
}

impl UpgradeOrchestrator {
    pub fn new(
        registry: InstanceRegistry,
        director: Arc<dyn DeploymentClient>,
        renderer: Arc<ManifestRenderer>,
        policy: VersionPolicy,
    ) -> Self {
        Self {
            registry,
            director,
            renderer,
            policy,
        }
    }

    /// Redeploys up to `count` instances not yet at `target_version`.
    /// Returns how many submissions the backend accepted.
    pub async fn upgrade(
        &self,
        target_version: &str,
        count: usize,
        max_parallel: usize,
    ) -> Result<usize, BrokerError> {
        let target = self.policy.check(target_version)?;
        let mut candidates = self
            .registry
            .list(|instance| {
                matches!(
                    instance.state,
                    LifecycleState::Ready | LifecycleState::Failed
                ) && !at_version(instance, &target)
            })
            .await;
        candidates.truncate(count);
        info!(
            target = %target,
            candidates = candidates.len(),
            max_parallel,
            "starting upgrade batch"
        );

        let submitted = stream::iter(candidates)
            .map(|instance| self.redeploy(instance, &target))
            .buffer_unordered(max_parallel.max(1))
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;
        info!(target = %target, submitted, "upgrade batch submitted");
        Ok(submitted)
    }

    async fn redeploy(&self, mut instance: Instance, target: &SoftwareVersion) -> bool {
        let instance_id = instance.instance_id.clone();
        let seen_state = instance.state;
        let seen_task = instance.task_id.clone();
        instance.version = target.as_str().to_string();
        let manifest = match self.renderer.render(&instance) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(instance_id = %instance_id, error = %err, "upgrade render failed; skipping");
                return false;
            }
        };

        // Claim the record before submitting; a delete accepted since the
        // scan wins and this instance is skipped.
        let claimed = self
            .registry
            .update_if(
                &instance_id,
                |record| record.state == seen_state && record.task_id == seen_task,
                |record| {
                    record.state = LifecycleState::Provisioning;
                    record.task_id = None;
                },
            )
            .await;
        if claimed.is_none() {
            info!(instance_id = %instance_id, "instance changed since scan; skipping upgrade");
            return false;
        }

        let task = match self.director.submit(&manifest).await {
            Ok(task) => task,
            Err(err) => {
                self.registry
                    .update_if(
                        &instance_id,
                        |record| is_claimed(record, LifecycleState::Provisioning),
                        |record| {
                            record.state = seen_state;
                            record.task_id = seen_task.clone();
                        },
                    )
                    .await;
                warn!(
                    instance_id = %instance_id,
                    error = %format!("{err:#}"),
                    "upgrade submit failed; skipping"
                );
                return false;
            }
        };

        let recorded = self
            .registry
            .update_if(
                &instance_id,
                |record| is_claimed(record, LifecycleState::Provisioning),
                |record| {
                    record.version = target.as_str().to_string();
                    record.task_id = Some(task.clone());
                },
            )
            .await;
        if recorded.is_none() {
            warn!(instance_id = %instance_id, task_id = %task, "instance changed during upgrade");
            return false;
        }
        self.registry.track_upgrade(&instance_id, task.clone()).await;
        info!(
            instance_id = %instance_id,
            task_id = %task,
            version = %target,
            "upgrade submitted"
        );
        true
    }

    pub async fn status(&self) -> UpgradeStatusResponse {
        let tracked = self.registry.tracked_upgrades().await;
        let pending: Vec<_> = tracked
            .iter()
            .filter(|(_, track)| track.outcome == UpgradeOutcome::InProgress)
            .collect();

        let polls = futures::future::join_all(pending.iter().map(|(instance_id, track)| async move {
            let state = self.director.task_state(&track.task_id).await;
            (instance_id, track, state)
        }))
        .await;

        let mut status = UpgradeStatusResponse {
            total: tracked.len(),
            ..UpgradeStatusResponse::default()
        };
        for (_, track) in &tracked {
            match track.outcome {
                UpgradeOutcome::Healthy => status.healthy += 1,
                UpgradeOutcome::Failed => status.failed += 1,
                UpgradeOutcome::InProgress => {}
            }
        }
        for (instance_id, track, polled) in polls {
            let outcome = match polled {
                Ok(TaskState::Done) => UpgradeOutcome::Healthy,
                Ok(state) if state.is_failure() => UpgradeOutcome::Failed,
                Ok(_) => UpgradeOutcome::InProgress,
                Err(err) => {
                    warn!(
                        instance_id = %instance_id,
                        task_id = %track.task_id,
                        error = %format!("{err:#}"),
                        "failed to poll upgrade task"
                    );
                    UpgradeOutcome::InProgress
                }
            };
            let next = match outcome {
                UpgradeOutcome::Healthy => LifecycleState::Ready,
                UpgradeOutcome::Failed => LifecycleState::Failed,
                UpgradeOutcome::InProgress => {
                    status.in_progress += 1;
                    continue;
                }
            };
            if !self
                .registry
                .settle_upgrade(instance_id, &track.task_id, outcome, next)
                .await
            {
                status.in_progress += 1;
                continue;
            }
            match outcome {
                UpgradeOutcome::Healthy => status.healthy += 1,
                UpgradeOutcome::Failed => status.failed += 1,
                UpgradeOutcome::InProgress => {}
            }
        }
        status
    }
}

fn at_version(instance: &Instance, target: &SoftwareVersion) -> bool {
    match SoftwareVersion::parse(&instance.version) {
        Ok(version) => version == *target,
        Err(_) => instance.version == target.as_str(),
    }
}

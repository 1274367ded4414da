use std::sync::Arc;

use agent_broker_api::{
    BindingCredentials, BindingResponse, LastOperationResponse, OperationState, ProvisionRequest,
    ProvisionResponse, UpdateRequest,
};
use chrono::Utc;
use tracing::{info, warn};

use crate::director::{DeploymentClient, TaskId, TaskState};
use crate::error::BrokerError;
use crate::identity;
use crate::manifest::ManifestRenderer;
use crate::models::{deployment_name, Catalog, Instance, LifecycleState};
use crate::registry::InstanceRegistry;
use crate::version::VersionPolicy;

/// What a poll result does to the instance record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Next {
    Unchanged,
    Become(LifecycleState),
    Remove,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Transition {
    pub next: Next,
    pub report: OperationState,
}

/// The lifecycle state machine, free of I/O.
///
/// A failed delete leaves the instance `failed` with its handle kept, so a
/// retried deprovision submits a fresh delete instead of replaying the old
/// operation.
pub fn transition(current: LifecycleState, task: &TaskState) -> Transition {
    let (next, report) = match (current, task) {
        (LifecycleState::Ready, _) => (Next::Unchanged, OperationState::Succeeded),
        (LifecycleState::Failed, _) => (Next::Unchanged, OperationState::Failed),
        (LifecycleState::Provisioning, TaskState::Done) => (
            Next::Become(LifecycleState::Ready),
            OperationState::Succeeded,
        ),
        (LifecycleState::Deprovisioning, TaskState::Done) => {
            (Next::Remove, OperationState::Succeeded)
        }
        (LifecycleState::Provisioning | LifecycleState::Deprovisioning, task)
            if task.is_failure() =>
        {
            (Next::Become(LifecycleState::Failed), OperationState::Failed)
        }
        _ => (Next::Unchanged, OperationState::InProgress),
    };
    Transition { next, report }
}

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub deployment_prefix: String,
    pub default_version: String,
}

#[derive(Clone)]
pub struct LifecycleController {
    registry: InstanceRegistry,
    director: Arc<dyn DeploymentClient>,
    renderer: Arc<ManifestRenderer>,
    catalog: Arc<Catalog>,
    policy: VersionPolicy,
    settings: LifecycleSettings,
}

impl LifecycleController {
    pub fn new(
        registry: InstanceRegistry,
        director: Arc<dyn DeploymentClient>,
        renderer: Arc<ManifestRenderer>,
        catalog: Arc<Catalog>,
        policy: VersionPolicy,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            director,
            renderer,
            catalog,
            policy,
            settings,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn dashboard_url(&self, instance: &Instance) -> String {
        format!("https://{}", self.renderer.route_uri(instance))
    }

    fn check_service(&self, service_id: &str) -> Result<(), BrokerError> {
        if service_id != self.catalog.service().id {
            return Err(BrokerError::BadRequest(format!(
                "unknown service id {service_id}"
            )));
        }
        Ok(())
    }

    pub async fn provision(
        &self,
        instance_id: &str,
        request: &ProvisionRequest,
        owner: String,
    ) -> Result<ProvisionResponse, BrokerError> {
        if self.registry.get(instance_id).await.is_some() {
            return Err(BrokerError::Conflict(instance_id.to_string()));
        }
        self.check_service(&request.service_id)?;
        let plan = self
            .catalog
            .plan(&request.plan_id)
            .ok_or_else(|| BrokerError::BadPlan(request.plan_id.clone()))?;
        let params = &request.parameters;
        let requested = params
            .version
            .as_deref()
            .unwrap_or(&self.settings.default_version);
        let version = self.policy.check(requested)?;

        let now = Utc::now();
        let instance = Instance {
            instance_id: instance_id.to_string(),
            service_id: request.service_id.clone(),
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            organization_guid: request.organization_guid.clone(),
            space_guid: request.space_guid.clone(),
            route_hostname: identity::route_hostname(&owner, instance_id),
            owner,
            deployment_name: deployment_name(&self.settings.deployment_prefix, instance_id),
            task_id: None,
            state: LifecycleState::Provisioning,
            gateway_token: identity::generate_gateway_token(),
            node_seed: identity::generate_node_seed(),
            control_ui_enabled: params.control_ui.unwrap_or(plan.control_ui),
            sso_enabled: params.sso.unwrap_or(plan.sso),
            version: version.as_str().to_string(),
            vm_type: plan.vm_type.clone(),
            disk_type: plan.disk_type.clone(),
            created_at: now,
            updated_at: now,
        };

        // Reserve the ID before any remote call; a racing duplicate loses here.
        if self.registry.insert_if_absent(instance.clone()).await.is_err() {
            return Err(BrokerError::Conflict(instance_id.to_string()));
        }

        let submitted = match self.renderer.render(&instance) {
            Ok(manifest) => self
                .director
                .submit(&manifest)
                .await
                .map_err(BrokerError::Backend),
            Err(err) => Err(BrokerError::Render(err)),
        };
        let task = match submitted {
            Ok(task) => task,
            Err(err) => {
                self.registry.delete(instance_id).await;
                warn!(
                    instance_id,
                    error = %err,
                    "provision failed; reservation released"
                );
                return Err(err);
            }
        };

        if !self
            .record_claimed_task(instance_id, LifecycleState::Provisioning, &task)
            .await
        {
            return Err(BrokerError::ConcurrentOperation(instance_id.to_string()));
        }
        info!(
            instance_id,
            task_id = %task,
            deployment = %instance.deployment_name,
            plan = %instance.plan_name,
            version = %instance.version,
            "provision submitted"
        );

        Ok(ProvisionResponse {
            dashboard_url: instance
                .control_ui_enabled
                .then(|| self.dashboard_url(&instance)),
            operation: Some(task.to_string()),
        })
    }

    pub async fn update(
        &self,
        instance_id: &str,
        request: &UpdateRequest,
    ) -> Result<Option<String>, BrokerError> {
        let current = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(instance_id.to_string()))?;
        if matches!(
            current.state,
            LifecycleState::Provisioning | LifecycleState::Deprovisioning
        ) {
            return Err(BrokerError::ConcurrentOperation(instance_id.to_string()));
        }
        self.check_service(&request.service_id)?;
        let plan_id = request.plan_id.as_deref().unwrap_or(&current.plan_id);
        let plan = self
            .catalog
            .plan(plan_id)
            .ok_or_else(|| BrokerError::BadPlan(plan_id.to_string()))?;
        let params = &request.parameters;

        // Plan and parameter changes stick even if the redeploy below fails.
        // The record is claimed (provisioning, no handle) for the duration of
        // the submit so no other operation can start on it.
        let updated = self
            .registry
            .update_if(
                instance_id,
                |record| unchanged_since(record, &current),
                |record| {
                    let plan_changed = record.plan_id != plan.id;
                    if plan_changed {
                        record.plan_id = plan.id.clone();
                        record.plan_name = plan.name.clone();
                        record.vm_type = plan.vm_type.clone();
                        record.disk_type = plan.disk_type.clone();
                    }
                    if let Some(control_ui) = params.control_ui {
                        record.control_ui_enabled = control_ui;
                    } else if plan_changed {
                        record.control_ui_enabled = plan.control_ui;
                    }
                    if let Some(sso) = params.sso {
                        record.sso_enabled = sso;
                    } else if plan_changed {
                        record.sso_enabled = plan.sso;
                    }
                    record.state = LifecycleState::Provisioning;
                    record.task_id = None;
                    record.clone()
                },
            )
            .await
            .ok_or_else(|| BrokerError::ConcurrentOperation(instance_id.to_string()))?;

        let submitted = match self.renderer.render(&updated) {
            Ok(manifest) => self
                .director
                .submit(&manifest)
                .await
                .map_err(BrokerError::Backend),
            Err(err) => Err(BrokerError::Render(err)),
        };
        let task = match submitted {
            Ok(task) => task,
            Err(err) => {
                self.release_claim(instance_id, LifecycleState::Provisioning, &current)
                    .await;
                warn!(
                    instance_id,
                    error = %err,
                    "update redeploy failed; lifecycle state unchanged"
                );
                return Err(err);
            }
        };

        if !self
            .record_claimed_task(instance_id, LifecycleState::Provisioning, &task)
            .await
        {
            return Err(BrokerError::ConcurrentOperation(instance_id.to_string()));
        }
        info!(
            instance_id,
            task_id = %task,
            plan = %updated.plan_name,
            "update submitted"
        );
        Ok(Some(task.to_string()))
    }

    pub async fn deprovision(&self, instance_id: &str) -> Result<Option<String>, BrokerError> {
        let Some(current) = self.registry.get(instance_id).await else {
            return self.recover_orphan(instance_id).await;
        };

        match (current.state, &current.task_id) {
            (LifecycleState::Deprovisioning, Some(task)) => {
                info!(instance_id, task_id = %task, "deprovision already in progress");
                return Ok(Some(task.to_string()));
            }
            (LifecycleState::Deprovisioning, None) | (LifecycleState::Provisioning, _) => {
                return Err(BrokerError::ConcurrentOperation(instance_id.to_string()));
            }
            _ => {}
        }

        // The old handle is dropped while the delete is in flight, so polls
        // and repeated deletes see "submitting" rather than the finished task.
        let claimed = self
            .registry
            .update_if(
                instance_id,
                |record| unchanged_since(record, &current),
                |record| {
                    record.state = LifecycleState::Deprovisioning;
                    record.task_id = None;
                },
            )
            .await;
        if claimed.is_none() {
            return Err(BrokerError::ConcurrentOperation(instance_id.to_string()));
        }

        match self.director.delete(&current.deployment_name).await {
            Ok(task) => {
                if !self
                    .record_claimed_task(instance_id, LifecycleState::Deprovisioning, &task)
                    .await
                {
                    return Err(BrokerError::ConcurrentOperation(instance_id.to_string()));
                }
                info!(
                    instance_id,
                    task_id = %task,
                    deployment = %current.deployment_name,
                    "deprovision submitted"
                );
                Ok(Some(task.to_string()))
            }
            Err(err) => {
                self.release_claim(instance_id, LifecycleState::Deprovisioning, &current)
                    .await;
                warn!(
                    instance_id,
                    deployment = %current.deployment_name,
                    error = %format!("{err:#}"),
                    "deprovision failed; previous state restored"
                );
                Err(BrokerError::Backend(err))
            }
        }
    }

    /// Stores the handle of a submitted task on a record this controller
    /// claimed. False if the claim was lost in the meantime.
    async fn record_claimed_task(
        &self,
        instance_id: &str,
        claimed_as: LifecycleState,
        task: &TaskId,
    ) -> bool {
        let recorded = self
            .registry
            .update_if(
                instance_id,
                |record| is_claimed(record, claimed_as),
                |record| record.task_id = Some(task.clone()),
            )
            .await;
        if recorded.is_none() {
            warn!(instance_id, task_id = %task, "claim lost before task was recorded");
        }
        recorded.is_some()
    }

    /// Puts back the state and handle a claim replaced.
    async fn release_claim(
        &self,
        instance_id: &str,
        claimed_as: LifecycleState,
        previous: &Instance,
    ) {
        self.registry
            .update_if(
                instance_id,
                |record| is_claimed(record, claimed_as),
                |record| {
                    record.state = previous.state;
                    record.task_id = previous.task_id.clone();
                },
            )
            .await;
    }

    /// Delete for an instance the registry lost, addressed by its derived name.
    async fn recover_orphan(&self, instance_id: &str) -> Result<Option<String>, BrokerError> {
        let placeholder = Instance::orphan(&self.settings.deployment_prefix, instance_id);
        let name = placeholder.deployment_name.clone();
        if self.registry.insert_if_absent(placeholder).await.is_err() {
            return Err(BrokerError::ConcurrentOperation(instance_id.to_string()));
        }
        warn!(instance_id, deployment = %name, "deprovisioning unknown instance by derived name");

        match self.director.delete(&name).await {
            Ok(task) => {
                if !self
                    .record_claimed_task(instance_id, LifecycleState::Deprovisioning, &task)
                    .await
                {
                    return Err(BrokerError::ConcurrentOperation(instance_id.to_string()));
                }
                info!(instance_id, task_id = %task, deployment = %name, "orphan delete submitted");
                Ok(Some(task.to_string()))
            }
            Err(err) => {
                self.registry
                    .delete_if(instance_id, |record| record.task_id.is_none())
                    .await;
                info!(
                    instance_id,
                    deployment = %name,
                    error = %format!("{err:#}"),
                    "orphan delete failed; treating instance as gone"
                );
                Err(BrokerError::Gone(instance_id.to_string()))
            }
        }
    }

    pub async fn last_operation(
        &self,
        instance_id: &str,
    ) -> Result<LastOperationResponse, BrokerError> {
        let current = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(instance_id.to_string()))?;

        match current.state {
            LifecycleState::Ready => return Ok(report(OperationState::Succeeded, None)),
            LifecycleState::Failed => {
                return Ok(report(
                    OperationState::Failed,
                    current
                        .task_id
                        .as_ref()
                        .map(|task| format!("deployment task {task} failed")),
                ));
            }
            LifecycleState::Provisioning | LifecycleState::Deprovisioning => {}
        }
        let Some(task) = current.task_id.clone() else {
            return Ok(report(
                OperationState::InProgress,
                Some("submitting deployment".to_string()),
            ));
        };

        let task_state = match self.director.task_state(&task).await {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    instance_id,
                    task_id = %task,
                    error = %format!("{err:#}"),
                    "failed to poll deployment task"
                );
                return Ok(report(
                    OperationState::InProgress,
                    Some("deployment task status unavailable".to_string()),
                ));
            }
        };

        let step = transition(current.state, &task_state);
        self.apply(instance_id, &task, step.next).await;
        Ok(report(
            step.report,
            Some(format!("deployment task {task} is {task_state}")),
        ))
    }

    async fn apply(&self, instance_id: &str, task: &TaskId, next: Next) {
        let same_task = |record: &Instance| record.task_id.as_ref() == Some(task);
        match next {
            Next::Unchanged => {}
            Next::Become(state) => {
                let applied = self
                    .registry
                    .update_if(instance_id, same_task, |record| record.state = state)
                    .await;
                if applied.is_some() {
                    info!(instance_id, task_id = %task, state = %state, "instance state advanced");
                }
            }
            Next::Remove => {
                if self.registry.delete_if(instance_id, same_task).await.is_some() {
                    info!(instance_id, task_id = %task, "instance removed");
                }
            }
        }
    }

    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<BindingResponse, BrokerError> {
        let instance = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(instance_id.to_string()))?;
        info!(instance_id, binding_id, "binding issued");
        Ok(BindingResponse {
            credentials: BindingCredentials {
                url: self.dashboard_url(&instance),
                token: instance.gateway_token,
                deployment: instance.deployment_name,
            },
        })
    }

    /// Nothing to revoke: every binding hands out the instance's own gateway token.
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) {
        info!(instance_id, binding_id, "binding revoked");
    }
}

fn unchanged_since(record: &Instance, seen: &Instance) -> bool {
    record.state == seen.state && record.task_id == seen.task_id
}

/// A record held by an operation whose remote call has not returned yet.
pub(crate) fn is_claimed(record: &Instance, state: LifecycleState) -> bool {
    record.state == state && record.task_id.is_none()
}

fn report(state: OperationState, description: Option<String>) -> LastOperationResponse {
    LastOperationResponse { state, description }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use agent_broker_api::UpdateParameters;
    use std::sync::atomic::Ordering;

    fn update_request(plan_id: Option<&str>) -> UpdateRequest {
        UpdateRequest {
            service_id: SERVICE_ID.to_string(),
            plan_id: plan_id.map(str::to_string),
            parameters: UpdateParameters::default(),
            previous_values: serde_json::Value::Null,
        }
    }

    #[test]
    fn transition_table() {
        use LifecycleState::*;
        let t = |state, task: TaskState| transition(state, &task);

        assert_eq!(t(Provisioning, TaskState::Done).next, Next::Become(Ready));
        assert_eq!(t(Provisioning, TaskState::Error).next, Next::Become(Failed));
        assert_eq!(
            t(Provisioning, TaskState::Cancelled).report,
            OperationState::Failed
        );
        assert_eq!(t(Provisioning, TaskState::Processing).next, Next::Unchanged);
        assert_eq!(
            t(Provisioning, TaskState::Other("cancelling".into())).report,
            OperationState::InProgress
        );
        assert_eq!(t(Deprovisioning, TaskState::Done).next, Next::Remove);
        assert_eq!(
            t(Deprovisioning, TaskState::Error),
            Transition {
                next: Next::Become(Failed),
                report: OperationState::Failed
            }
        );
        assert_eq!(t(Deprovisioning, TaskState::Queued).next, Next::Unchanged);
        assert_eq!(t(Ready, TaskState::Error).report, OperationState::Succeeded);
        assert_eq!(t(Failed, TaskState::Done).report, OperationState::Failed);
    }

    #[tokio::test]
    async fn provision_records_instance_and_submits_once() {
        let (controller, director) = controller();
        let response = controller
            .provision(
                "inst-1",
                &provision_request("small", None),
                "Jane.Doe@example.com".to_string(),
            )
            .await
            .expect("provision");

        assert_eq!(response.operation.as_deref(), Some("1"));
        assert_eq!(
            response.dashboard_url.as_deref(),
            Some("https://jane-doe.apps.example.com")
        );
        assert_eq!(director.submits(), 1);

        let record = controller.registry().get("inst-1").await.expect("stored");
        assert_eq!(record.state, LifecycleState::Provisioning);
        assert_eq!(record.task_id, Some(TaskId::new("1")));
        assert_eq!(record.deployment_name, "oc-agent-inst-1");
        assert_eq!(record.version, DEFAULT_VERSION);
        assert!(record.gateway_token.starts_with("gw_"));
        assert!(record.node_seed.starts_with("seed_"));

        let manifest = director.last_manifest().expect("manifest sent");
        assert!(manifest.contains("name: \"oc-agent-inst-1\""));
    }

    #[tokio::test]
    async fn second_provision_conflicts_and_keeps_original() {
        let (controller, director) = controller();
        controller
            .provision(
                "inst-1",
                &provision_request("small", None),
                "alice".to_string(),
            )
            .await
            .expect("first provision");
        let before = controller.registry().get("inst-1").await.expect("stored");

        let err = controller
            .provision(
                "inst-1",
                &provision_request("large", None),
                "mallory".to_string(),
            )
            .await
            .expect_err("duplicate provision");
        assert!(matches!(err, BrokerError::Conflict(_)));
        assert_eq!(director.submits(), 1);
        assert_eq!(controller.registry().get("inst-1").await, Some(before));
    }

    #[tokio::test]
    async fn provision_rejects_unknown_plan_and_service() {
        let (controller, director) = controller();
        let err = controller
            .provision("inst-1", &provision_request("huge", None), String::new())
            .await
            .expect_err("unknown plan");
        assert!(matches!(err, BrokerError::BadPlan(_)));

        let mut request = provision_request("small", None);
        request.service_id = "other".to_string();
        let err = controller
            .provision("inst-1", &request, String::new())
            .await
            .expect_err("unknown service");
        assert!(matches!(err, BrokerError::BadRequest(_)));
        assert_eq!(director.submits(), 0);
        assert!(controller.registry().get("inst-1").await.is_none());
    }

    #[tokio::test]
    async fn version_floor_gate() {
        let (controller, director) = controller();
        let err = controller
            .provision(
                "old",
                &provision_request("small", Some("2025.12.31")),
                String::new(),
            )
            .await
            .expect_err("below floor");
        assert_eq!(err.status().as_u16(), 422);
        assert!(controller.registry().get("old").await.is_none());

        controller
            .provision("exact", &provision_request("small", Some(FLOOR)), String::new())
            .await
            .expect("floor itself is allowed");
        assert_eq!(director.submits(), 1);
    }

    #[tokio::test]
    async fn failed_submit_releases_reservation() {
        let (controller, director) = controller();
        director.fail_submit.store(true, Ordering::SeqCst);
        let err = controller
            .provision("inst-1", &provision_request("small", None), String::new())
            .await
            .expect_err("submit fails");
        assert!(matches!(err, BrokerError::Backend(_)));
        assert!(controller.registry().get("inst-1").await.is_none());

        director.fail_submit.store(false, Ordering::SeqCst);
        controller
            .provision("inst-1", &provision_request("small", None), String::new())
            .await
            .expect("retry succeeds");
    }

    #[tokio::test]
    async fn provision_then_deprovision_end_to_end() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;
        assert_eq!(
            controller.registry().get("inst-1").await.expect("present").state,
            LifecycleState::Ready
        );

        let operation = controller
            .deprovision("inst-1")
            .await
            .expect("deprovision")
            .expect("operation");
        assert_eq!(
            director.deleted.lock().expect("deleted").as_slice(),
            ["oc-agent-inst-1".to_string()]
        );
        let status = controller.last_operation("inst-1").await.expect("poll");
        assert_eq!(status.state, OperationState::InProgress);

        director.set_state(&TaskId::new(operation), TaskState::Done);
        let status = controller.last_operation("inst-1").await.expect("poll");
        assert_eq!(status.state, OperationState::Succeeded);
        assert!(controller.registry().get("inst-1").await.is_none());

        let err = controller
            .last_operation("inst-1")
            .await
            .expect_err("removed instance");
        assert_eq!(err.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn deprovision_is_idempotent() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;

        let first = controller.deprovision("inst-1").await.expect("first");
        let second = controller.deprovision("inst-1").await.expect("second");
        assert_eq!(first, second);
        assert_eq!(director.deletes(), 1);
    }

    #[tokio::test]
    async fn deprovision_of_unknown_instance_recovers_orphan() {
        let (controller, director) = controller();
        let operation = controller
            .deprovision("lost-1")
            .await
            .expect("orphan recovery")
            .expect("operation");
        assert_eq!(
            director.deleted.lock().expect("deleted").as_slice(),
            ["oc-agent-lost-1".to_string()]
        );
        let record = controller.registry().get("lost-1").await.expect("placeholder");
        assert_eq!(record.state, LifecycleState::Deprovisioning);

        director.set_state(&TaskId::new(operation), TaskState::Done);
        controller.last_operation("lost-1").await.expect("poll");
        assert!(controller.registry().get("lost-1").await.is_none());
    }

    #[tokio::test]
    async fn failed_orphan_delete_is_gone() {
        let (controller, director) = controller();
        director.fail_delete.store(true, Ordering::SeqCst);
        let err = controller
            .deprovision("lost-1")
            .await
            .expect_err("delete fails");
        assert!(matches!(err, BrokerError::Gone(_)));
        assert!(controller.registry().get("lost-1").await.is_none());
    }

    #[tokio::test]
    async fn failed_delete_restores_known_instance() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;
        let before = controller.registry().get("inst-1").await.expect("present");

        director.fail_delete.store(true, Ordering::SeqCst);
        let err = controller
            .deprovision("inst-1")
            .await
            .expect_err("delete fails");
        assert!(matches!(err, BrokerError::Backend(_)));
        let after = controller.registry().get("inst-1").await.expect("present");
        assert_eq!(after.state, LifecycleState::Ready);
        assert_eq!(after.task_id, before.task_id);
    }

    #[tokio::test]
    async fn failed_delete_task_allows_retry() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;
        let operation = controller
            .deprovision("inst-1")
            .await
            .expect("deprovision")
            .expect("operation");
        director.set_state(&TaskId::new(operation.clone()), TaskState::Error);

        let status = controller.last_operation("inst-1").await.expect("poll");
        assert_eq!(status.state, OperationState::Failed);
        let record = controller.registry().get("inst-1").await.expect("kept");
        assert_eq!(record.state, LifecycleState::Failed);
        assert_eq!(record.task_id, Some(TaskId::new(operation.clone())));

        let retry = controller
            .deprovision("inst-1")
            .await
            .expect("retry")
            .expect("operation");
        assert_ne!(retry, operation);
        assert_eq!(director.deletes(), 2);
    }

    #[tokio::test]
    async fn delete_in_flight_hides_previous_task() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;

        let gate = director.hold_delete();
        let pending = tokio::spawn({
            let controller = controller.clone();
            async move { controller.deprovision("inst-1").await }
        });
        gate.entered().await;

        let err = controller
            .deprovision("inst-1")
            .await
            .expect_err("delete still being submitted");
        assert!(matches!(err, BrokerError::ConcurrentOperation(_)));
        let status = controller.last_operation("inst-1").await.expect("poll");
        assert_eq!(status.state, OperationState::InProgress);
        let record = controller.registry().get("inst-1").await.expect("kept");
        assert_eq!(record.state, LifecycleState::Deprovisioning);
        assert_eq!(record.task_id, None);

        gate.release();
        let operation = pending
            .await
            .expect("join")
            .expect("deprovision")
            .expect("operation");
        assert_eq!(operation, "2");
        let record = controller.registry().get("inst-1").await.expect("kept");
        assert_eq!(record.task_id, Some(TaskId::new("2")));
        assert_eq!(director.deletes(), 1);

        let status = controller.last_operation("inst-1").await.expect("poll");
        assert_eq!(status.state, OperationState::InProgress);
        assert!(controller.registry().get("inst-1").await.is_some());
    }

    #[tokio::test]
    async fn delete_during_update_submit_is_refused() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;

        let gate = director.hold_submit();
        let request = update_request(Some("large"));
        let pending = tokio::spawn({
            let controller = controller.clone();
            async move { controller.update("inst-1", &request).await }
        });
        gate.entered().await;

        let err = controller
            .deprovision("inst-1")
            .await
            .expect_err("update still being submitted");
        assert!(matches!(err, BrokerError::ConcurrentOperation(_)));
        assert_eq!(director.deletes(), 0);

        gate.release();
        let operation = pending
            .await
            .expect("join")
            .expect("update")
            .expect("operation");
        let record = controller.registry().get("inst-1").await.expect("present");
        assert_eq!(record.state, LifecycleState::Provisioning);
        assert_eq!(record.task_id, Some(TaskId::new(operation)));
    }

    #[tokio::test]
    async fn busy_instances_refuse_conflicting_operations() {
        let (controller, _director) = controller();
        controller
            .provision("inst-1", &provision_request("small", None), String::new())
            .await
            .expect("provision");
        let err = controller.deprovision("inst-1").await.expect_err("busy");
        assert!(matches!(err, BrokerError::ConcurrentOperation(_)));
        let err = controller
            .update("inst-1", &update_request(Some("large")))
            .await
            .expect_err("busy");
        assert!(matches!(err, BrokerError::ConcurrentOperation(_)));
    }

    #[tokio::test]
    async fn update_changes_plan_and_always_redeploys() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;

        let operation = controller
            .update("inst-1", &update_request(Some("large")))
            .await
            .expect("update")
            .expect("operation");
        let record = controller.registry().get("inst-1").await.expect("present");
        assert_eq!(record.plan_id, "large");
        assert_eq!(record.vm_type, "large-vm");
        assert!(record.sso_enabled);
        assert_eq!(record.state, LifecycleState::Provisioning);
        assert_eq!(record.task_id, Some(TaskId::new(operation.clone())));
        assert!(director
            .last_manifest()
            .expect("manifest")
            .contains("vm_type: \"large-vm\""));

        director.set_state(&TaskId::new(operation), TaskState::Done);
        controller.last_operation("inst-1").await.expect("poll");

        let submits = director.submits();
        controller
            .update("inst-1", &update_request(None))
            .await
            .expect("same-plan update");
        assert_eq!(director.submits(), submits + 1);
    }

    #[tokio::test]
    async fn update_failure_keeps_state_but_keeps_plan() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;

        director.fail_submit.store(true, Ordering::SeqCst);
        let err = controller
            .update("inst-1", &update_request(Some("large")))
            .await
            .expect_err("submit fails");
        assert_eq!(err.status().as_u16(), 500);
        let record = controller.registry().get("inst-1").await.expect("present");
        assert_eq!(record.state, LifecycleState::Ready);
        assert_eq!(record.plan_id, "large");
    }

    #[tokio::test]
    async fn update_rejects_unknown_instance_and_plan() {
        let (controller, director) = controller();
        let err = controller
            .update("nope", &update_request(None))
            .await
            .expect_err("absent");
        assert!(matches!(err, BrokerError::NotFound(_)));

        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;
        let err = controller
            .update("inst-1", &update_request(Some("huge")))
            .await
            .expect_err("unknown plan");
        assert!(matches!(err, BrokerError::BadPlan(_)));
    }

    #[tokio::test]
    async fn failed_provision_task_marks_instance_failed() {
        let (controller, director) = controller();
        let response = controller
            .provision("inst-1", &provision_request("small", None), String::new())
            .await
            .expect("provision");
        director.set_state(
            &TaskId::new(response.operation.expect("operation")),
            TaskState::Cancelled,
        );
        let status = controller.last_operation("inst-1").await.expect("poll");
        assert_eq!(status.state, OperationState::Failed);
        let status = controller.last_operation("inst-1").await.expect("poll again");
        assert_eq!(status.state, OperationState::Failed);
        assert_eq!(
            controller.registry().get("inst-1").await.expect("kept").state,
            LifecycleState::Failed
        );
    }

    #[tokio::test]
    async fn poll_failure_reports_in_progress() {
        let (controller, director) = controller();
        controller
            .provision("inst-1", &provision_request("small", None), String::new())
            .await
            .expect("provision");
        director.fail_poll.store(true, Ordering::SeqCst);
        let status = controller.last_operation("inst-1").await.expect("poll");
        assert_eq!(status.state, OperationState::InProgress);
        assert_eq!(
            controller.registry().get("inst-1").await.expect("kept").state,
            LifecycleState::Provisioning
        );
    }

    #[tokio::test]
    async fn bind_returns_instance_credentials() {
        let (controller, director) = controller();
        ready_instance(&controller, &director, "inst-1", DEFAULT_VERSION).await;
        let binding = controller.bind("inst-1", "bind-1").await.expect("bind");
        let record = controller.registry().get("inst-1").await.expect("present");
        assert_eq!(binding.credentials.token, record.gateway_token);
        assert_eq!(binding.credentials.deployment, "oc-agent-inst-1");
        assert_eq!(binding.credentials.url, "https://alice.apps.example.com");

        let err = controller.bind("nope", "bind-1").await.expect_err("absent");
        assert!(matches!(err, BrokerError::NotFound(_)));
    }
}

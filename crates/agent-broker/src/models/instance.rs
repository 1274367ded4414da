use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::director::TaskId;

/// Deployment names are derived from the instance ID alone so a deployment can
/// be found again after the registry has lost its record.
pub fn deployment_name(prefix: &str, instance_id: &str) -> String {
    format!("{prefix}-agent-{instance_id}")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleState {
    Provisioning,
    Ready,
    Deprovisioning,
    Failed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Deprovisioning => "deprovisioning",
            Self::Failed => "failed",
        }
    }

    /// Unknown values read back as `Provisioning`, i.e. "still working".
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or(Self::Provisioning)
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "provisioning" => Ok(Self::Provisioning),
            "ready" => Ok(Self::Ready),
            "deprovisioning" => Ok(Self::Deprovisioning),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown lifecycle state {other:?}")),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LifecycleState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LifecycleState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse_lenient(&raw))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub plan_name: String,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub space_guid: String,
    #[serde(default)]
    pub owner: String,
    pub deployment_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub state: LifecycleState,
    #[serde(default)]
    pub route_hostname: String,
    #[serde(default)]
    pub gateway_token: String,
    #[serde(default)]
    pub node_seed: String,
    #[serde(default)]
    pub control_ui_enabled: bool,
    #[serde(default)]
    pub sso_enabled: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub vm_type: String,
    #[serde(default)]
    pub disk_type: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// Minimal record for a deployment the registry no longer knows about.
    /// Only the deterministic name is trustworthy; everything else is blank.
    pub fn orphan(prefix: &str, instance_id: &str) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            service_id: String::new(),
            plan_id: String::new(),
            plan_name: String::new(),
            organization_guid: String::new(),
            space_guid: String::new(),
            owner: String::new(),
            deployment_name: deployment_name(prefix, instance_id),
            task_id: None,
            state: LifecycleState::Deprovisioning,
            route_hostname: String::new(),
            gateway_token: String::new(),
            node_seed: String::new(),
            control_ui_enabled: false,
            sso_enabled: false,
            version: String::new(),
            vm_type: String::new(),
            disk_type: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

use agent_broker_api::{CatalogResponse, ServiceOffering, ServicePlan};
use serde_json::json;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub vm_type: String,
    pub disk_type: String,
    pub control_ui: bool,
    pub sso: bool,
    pub free: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Offered plans, fixed at start-up. Lookups are by ID only.
#[derive(Clone, Debug)]
pub struct Catalog {
    service: ServiceInfo,
    plans: Vec<Plan>,
}

impl Catalog {
    pub fn new(service: ServiceInfo, plans: Vec<Plan>) -> anyhow::Result<Self> {
        for (idx, plan) in plans.iter().enumerate() {
            if plans[..idx].iter().any(|other| other.id == plan.id) {
                anyhow::bail!("duplicate plan id {} (plan {})", plan.id, plan.name);
            }
        }
        Ok(Self { service, plans })
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.service
    }

    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|plan| plan.id == plan_id)
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn to_response(&self) -> CatalogResponse {
        CatalogResponse {
            services: vec![ServiceOffering {
                id: self.service.id.clone(),
                name: self.service.name.clone(),
                description: self.service.description.clone(),
                bindable: true,
                plan_updateable: true,
                instances_retrievable: false,
                plans: self
                    .plans
                    .iter()
                    .map(|plan| ServicePlan {
                        id: plan.id.clone(),
                        name: plan.name.clone(),
                        description: plan.description.clone(),
                        free: plan.free,
                        metadata: json!({
                            "vm_type": plan.vm_type,
                            "disk_type": plan.disk_type,
                            "control_ui": plan.control_ui,
                            "sso": plan.sso,
                        }),
                    })
                    .collect(),
            }],
        }
    }
}

/// Stable GUID-shaped ID for a plan configured without one.
pub fn synthesize_plan_id(service_id: &str, plan_name: &str) -> String {
    let digest = Sha256::digest(format!("{service_id}/{plan_name}").as_bytes());
    let hex = hex::encode(&digest[..16]);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
pub(crate) fn test_plan(id: &str) -> Plan {
    Plan {
        id: id.to_string(),
        name: id.to_string(),
        description: format!("{id} plan"),
        vm_type: format!("{id}-vm"),
        disk_type: "10GB".to_string(),
        control_ui: true,
        sso: false,
        free: true,
    }
}

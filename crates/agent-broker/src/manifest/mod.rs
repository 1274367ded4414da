mod document;

pub use document::{to_yaml, Mapping, Node, RenderError};

use crate::config::{AiConfig, BrokerConfig, DeploymentConfig, SsoConfig};
use crate::models::Instance;

const GATEWAY_PORT: i64 = 18789;
const SSO_PROXY_PORT: i64 = 4180;
const STEMCELL_ALIAS: &str = "default";
const AGENT_JOB: &str = "openclaw-agent";
const SSO_RELEASE: &str = "oauth2-proxy";
const BPM_RELEASE: &str = "bpm";
const ROUTING_RELEASE: &str = "routing";

/// Turns an instance record into a deployment manifest.
///
/// Pure: no I/O and nothing shared, so it is safe to call without holding the
/// registry lock. Sizing comes from the instance record, which carries the
/// plan attributes that were current at its last provision or update.
#[derive(Clone, Debug)]
pub struct ManifestRenderer {
    apps_domain: String,
    deployment: DeploymentConfig,
    sso: Option<SsoConfig>,
    ai: Option<AiConfig>,
}

impl ManifestRenderer {
    pub fn new(
        apps_domain: String,
        deployment: DeploymentConfig,
        sso: Option<SsoConfig>,
        ai: Option<AiConfig>,
    ) -> Self {
        Self {
            apps_domain,
            deployment,
            sso,
            ai,
        }
    }

    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self::new(
            cfg.apps_domain.clone(),
            cfg.deployment.clone(),
            cfg.sso.clone(),
            cfg.ai.clone(),
        )
    }

    pub fn render(&self, instance: &Instance) -> Result<Vec<u8>, RenderError> {
        Ok(to_yaml(&self.document(instance))?.into_bytes())
    }

    pub fn route_uri(&self, instance: &Instance) -> String {
        format!("{}.{}", instance.route_hostname, self.apps_domain)
    }

    fn sso_for<'a>(&'a self, instance: &Instance) -> Option<&'a SsoConfig> {
        self.sso.as_ref().filter(|_| instance.sso_enabled)
    }

    fn document(&self, instance: &Instance) -> Node {
        let sso = self.sso_for(instance);

        let mut releases = vec![
            release(&self.deployment.release_name, &instance.version),
            release(BPM_RELEASE, &self.deployment.bpm_version),
        ];
        if instance.control_ui_enabled {
            releases.push(release(ROUTING_RELEASE, &self.deployment.routing_version));
        }
        if let Some(sso) = sso {
            releases.push(release(SSO_RELEASE, &sso.release_version));
        }

        let mut jobs = vec![
            Node::from(
                Mapping::new()
                    .with("name", BPM_RELEASE)
                    .with("release", BPM_RELEASE),
            ),
            Node::from(
                Mapping::new()
                    .with("name", AGENT_JOB)
                    .with("release", &self.deployment.release_name)
                    .with("properties", self.agent_properties(instance)),
            ),
        ];
        if instance.control_ui_enabled {
            jobs.push(self.route_registrar_job(instance, sso.is_some()));
        }
        if let Some(sso) = sso {
            jobs.push(sso_job(instance, sso));
        }

        let azs: Vec<Node> = self.deployment.azs.iter().map(Node::from).collect();
        let agent_group = Mapping::new()
            .with("name", "agent")
            .with("instances", 1_i64)
            .with("azs", azs)
            .with("vm_type", &instance.vm_type)
            .with("persistent_disk_type", &instance.disk_type)
            .with("stemcell", STEMCELL_ALIAS)
            .with(
                "networks",
                vec![Node::from(
                    Mapping::new().with("name", &self.deployment.network),
                )],
            )
            .with("jobs", jobs);

        Mapping::new()
            .with("name", &instance.deployment_name)
            .with("releases", releases)
            .with(
                "stemcells",
                vec![Node::from(
                    Mapping::new()
                        .with("alias", STEMCELL_ALIAS)
                        .with("os", &self.deployment.stemcell_os)
                        .with("version", &self.deployment.stemcell_version),
                )],
            )
            .with(
                "update",
                Mapping::new()
                    .with("canaries", 1_i64)
                    .with("max_in_flight", 1_i64)
                    .with("canary_watch_time", "1000-300000")
                    .with("update_watch_time", "1000-300000")
                    .with("serial", false),
            )
            .with("instance_groups", vec![Node::from(agent_group)])
            .with(
                "tags",
                Mapping::new()
                    .with("instance_id", &instance.instance_id)
                    .with("owner", &instance.owner)
                    .with("plan", &instance.plan_name),
            )
            .into()
    }

    fn agent_properties(&self, instance: &Instance) -> Mapping {
        let mut openclaw = Mapping::new()
            .with("instance_id", &instance.instance_id)
            .with("owner", &instance.owner)
            .with("version", &instance.version)
            .with(
                "gateway",
                Mapping::new()
                    .with("port", GATEWAY_PORT)
                    .with("token", &instance.gateway_token),
            )
            .with("node", Mapping::new().with("seed", &instance.node_seed))
            .with(
                "control_ui",
                Mapping::new().with("enabled", instance.control_ui_enabled),
            );
        if let Some(ai) = &self.ai {
            let mut provider = Mapping::new()
                .with("provider", &ai.provider)
                .with("model", &ai.model)
                .with("api_key", &ai.api_key);
            if let Some(base_url) = &ai.base_url {
                provider.insert("base_url", base_url);
            }
            openclaw.insert("ai", provider);
        }
        if let Some(ca) = non_blank(self.deployment.trusted_ca_certs.as_deref()) {
            openclaw.insert("trusted_ca_certs", Node::block(ca));
        }
        Mapping::new().with("openclaw", openclaw)
    }

    fn route_registrar_job(&self, instance: &Instance, behind_sso: bool) -> Node {
        let port = if behind_sso {
            SSO_PROXY_PORT
        } else {
            GATEWAY_PORT
        };
        let route = Mapping::new()
            .with("name", &instance.route_hostname)
            .with("port", port)
            .with("registration_interval", "20s")
            .with("uris", vec![Node::from(self.route_uri(instance))]);
        Mapping::new()
            .with("name", "route_registrar")
            .with("release", ROUTING_RELEASE)
            .with(
                "properties",
                Mapping::new().with(
                    "route_registrar",
                    Mapping::new().with("routes", vec![Node::from(route)]),
                ),
            )
            .into()
    }
}

fn release(name: &str, version: &str) -> Node {
    Mapping::new()
        .with("name", name)
        .with("version", version)
        .into()
}

fn sso_job(instance: &Instance, sso: &SsoConfig) -> Node {
    let mut proxy = Mapping::new()
        .with("http_address", format!("0.0.0.0:{SSO_PROXY_PORT}"))
        .with("upstream", format!("http://127.0.0.1:{GATEWAY_PORT}"))
        .with("issuer_url", &sso.issuer_url)
        .with("client_id", &sso.client_id)
        .with("client_secret", &sso.client_secret)
        .with("cookie_secret", &sso.cookie_secret)
        .with("allowed_user", &instance.owner);
    if let Some(ca) = non_blank(sso.ca_cert.as_deref()) {
        proxy.insert("provider_ca", Node::block(ca));
    }
    Mapping::new()
        .with("name", SSO_RELEASE)
        .with("release", SSO_RELEASE)
        .with("properties", Mapping::new().with("oauth2_proxy", proxy))
        .into()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use crate::models::plan::{synthesize_plan_id, ServiceInfo};
use crate::models::{Catalog, Plan};
use crate::version::{SoftwareVersion, VersionPolicy};

const DEFAULT_CONFIG_PATH: &str = "agent-broker.toml";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_STATE_PATH: &str = ".agent-broker-state.json";
const DEFAULT_DEPLOYMENT_PREFIX: &str = "openclaw";
const DEFAULT_DIRECTOR_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_deployment_prefix")]
    pub deployment_prefix: String,
    pub apps_domain: String,
    pub default_version: String,
    pub min_version: String,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    pub director: DirectorConfig,
    pub service: ServiceConfig,
    #[serde(default)]
    pub plans: Vec<PlanConfig>,
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub sso: Option<SsoConfig>,
    #[serde(default)]
    pub ai: Option<AiConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectorConfig {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// PEM bundle; when set, only these CAs are trusted.
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default = "default_director_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub vm_type: String,
    #[serde(default)]
    pub disk_type: String,
    #[serde(default = "default_true")]
    pub control_ui: bool,
    #[serde(default)]
    pub sso: bool,
    #[serde(default)]
    pub free: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    pub network: String,
    pub azs: Vec<String>,
    #[serde(default = "default_stemcell_os")]
    pub stemcell_os: String,
    #[serde(default = "default_latest")]
    pub stemcell_version: String,
    #[serde(default = "default_release_name")]
    pub release_name: String,
    #[serde(default = "default_latest")]
    pub bpm_version: String,
    #[serde(default = "default_latest")]
    pub routing_version: String,
    #[serde(default)]
    pub trusted_ca_certs: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SsoConfig {
    pub issuer_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub cookie_secret: String,
    #[serde(default = "default_latest")]
    pub release_version: String,
    #[serde(default)]
    pub ca_cert: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_PATH)
}

fn default_deployment_prefix() -> String {
    DEFAULT_DEPLOYMENT_PREFIX.to_string()
}

fn default_director_timeout_secs() -> u64 {
    DEFAULT_DIRECTOR_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn default_latest() -> String {
    "latest".to_string()
}

fn default_stemcell_os() -> String {
    "ubuntu-jammy".to_string()
}

fn default_release_name() -> String {
    "openclaw".to_string()
}

impl BrokerConfig {
    /// Reads `AGENT_BROKER_CONFIG` (or `agent-broker.toml`) and applies
    /// secret overrides from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = optional_non_empty_env("AGENT_BROKER_CONFIG", DEFAULT_CONFIG_PATH);
        let mut cfg = Self::load(Path::new(&path))?;
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.resolve_files()?;
        cfg.validate()?;
        info!(path = %path, plans = cfg.plans.len(), "loaded broker config");
        Ok(cfg)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read broker config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse broker config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let (Some(username), Some(password)) =
            (get("AGENT_BROKER_USERNAME"), get("AGENT_BROKER_PASSWORD"))
        {
            self.auth = Some(AuthConfig { username, password });
        }
        if let Some(username) = get("DIRECTOR_USERNAME") {
            self.director.username = username;
        }
        if let Some(password) = get("DIRECTOR_PASSWORD") {
            self.director.password = password;
        }
        if let (Some(ai), Some(key)) = (self.ai.as_mut(), get("AI_PROVIDER_API_KEY")) {
            ai.api_key = key;
        }
        if let (Some(sso), Some(secret)) = (self.sso.as_mut(), get("SSO_CLIENT_SECRET")) {
            sso.client_secret = secret;
        }
    }

    fn resolve_files(&mut self) -> anyhow::Result<()> {
        if self.director.ca_cert.is_none() {
            if let Some(path) = &self.director.ca_cert_path {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("read director ca cert {}", path.display()))?;
                self.director.ca_cert = Some(pem);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.deployment_prefix.trim().is_empty(),
            "deployment_prefix must be non-empty"
        );
        anyhow::ensure!(!self.plans.is_empty(), "at least one [[plans]] entry is required");
        anyhow::ensure!(
            !self.deployment.azs.is_empty(),
            "deployment.azs must list at least one availability zone"
        );
        let policy = self.version_policy()?;
        let default_version = SoftwareVersion::parse(&self.default_version)
            .context("parse default_version")?;
        anyhow::ensure!(
            default_version >= *policy.floor(),
            "default_version {} is below min_version {}",
            default_version,
            policy.floor()
        );
        self.catalog()?;
        Ok(())
    }

    pub fn version_policy(&self) -> anyhow::Result<VersionPolicy> {
        let floor = SoftwareVersion::parse(&self.min_version).context("parse min_version")?;
        Ok(VersionPolicy::new(floor))
    }

    pub fn catalog(&self) -> anyhow::Result<Catalog> {
        let plans = self
            .plans
            .iter()
            .map(|plan| Plan {
                id: plan
                    .id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| synthesize_plan_id(&self.service.id, &plan.name)),
                name: plan.name.clone(),
                description: plan.description.clone(),
                vm_type: plan.vm_type.clone(),
                disk_type: plan.disk_type.clone(),
                control_ui: plan.control_ui,
                sso: plan.sso,
                free: plan.free,
            })
            .collect();
        Catalog::new(
            ServiceInfo {
                id: self.service.id.clone(),
                name: self.service.name.clone(),
                description: self.service.description.clone(),
            },
            plans,
        )
    }
}

fn optional_non_empty_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
apps_domain = "apps.example.com"
default_version = "2026.2.1"
min_version = "2026.1.29"

[director]
url = "https://10.0.0.6:25555"
username = "admin"

[service]
id = "svc-openclaw"
name = "openclaw"
description = "Managed OpenClaw agents"

[[plans]]
id = "small"
name = "small"
vm_type = "small-vm"
disk_type = "10GB"

[[plans]]
name = "large"
vm_type = "large-vm"
disk_type = "50GB"
sso = true

[deployment]
network = "default"
azs = ["z1", "z2"]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn sample_config_parses_with_defaults() {
        let cfg = BrokerConfig::from_toml_str(SAMPLE_CONFIG).expect("parse sample");
        cfg.validate().expect("sample is valid");
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.deployment_prefix, "openclaw");
        assert_eq!(cfg.director.timeout_secs, 30);
        assert_eq!(cfg.deployment.stemcell_version, "latest");
        assert!(cfg.auth.is_none());
        assert!(cfg.sso.is_none());
        assert!(cfg.plans[0].control_ui);
    }

    #[test]
    fn catalog_synthesizes_missing_plan_ids() {
        let cfg = BrokerConfig::from_toml_str(SAMPLE_CONFIG).expect("parse sample");
        let catalog = cfg.catalog().expect("catalog");
        assert!(catalog.plan("small").is_some());
        let large_id = synthesize_plan_id("svc-openclaw", "large");
        let large = catalog.plan(&large_id).expect("synthesized id");
        assert_eq!(large.name, "large");
        assert!(large.sso);
    }

    #[test]
    fn env_overrides_replace_secrets_and_ignore_blanks() {
        let mut cfg = BrokerConfig::from_toml_str(SAMPLE_CONFIG).expect("parse sample");
        let env: HashMap<&str, &str> = HashMap::from([
            ("AGENT_BROKER_USERNAME", "broker"),
            ("AGENT_BROKER_PASSWORD", "s3cret"),
            ("DIRECTOR_PASSWORD", "director-pw"),
            ("DIRECTOR_USERNAME", "   "),
        ]);
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        let auth = cfg.auth.expect("auth configured");
        assert_eq!(auth.username, "broker");
        assert_eq!(auth.password, "s3cret");
        assert_eq!(cfg.director.password, "director-pw");
        assert_eq!(cfg.director.username, "admin");
    }

    #[test]
    fn default_version_below_floor_is_rejected() {
        let raw = SAMPLE_CONFIG.replace(
            "default_version = \"2026.2.1\"",
            "default_version = \"2025.12.31\"",
        );
        let cfg = BrokerConfig::from_toml_str(&raw).expect("parse");
        let err = cfg.validate().expect_err("default below floor");
        assert!(err.to_string().contains("below min_version"));
    }

    #[test]
    fn missing_plans_are_rejected() {
        let raw = SAMPLE_CONFIG
            .split("[[plans]]")
            .next()
            .expect("prefix")
            .to_string()
            + "[deployment]\nnetwork = \"default\"\nazs = [\"z1\"]\n";
        let cfg = BrokerConfig::from_toml_str(&raw).expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ca_cert_path_is_read_when_inline_cert_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("director-ca.pem");
        std::fs::write(&path, "-----BEGIN CERTIFICATE-----\n").expect("write ca");
        let mut cfg = BrokerConfig::from_toml_str(SAMPLE_CONFIG).expect("parse sample");
        cfg.director.ca_cert_path = Some(path);
        cfg.resolve_files().expect("resolve files");
        assert_eq!(
            cfg.director.ca_cert.as_deref(),
            Some("-----BEGIN CERTIFICATE-----\n")
        );
    }
}

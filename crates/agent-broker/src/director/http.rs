use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Response, Url};
use serde::Deserialize;
use serde_json::Value;

use super::{DeploymentClient, TaskId, TaskState};
use crate::config::DirectorConfig;

/// HTTP client for the deployment director (BOSH-style API).
pub struct DirectorClient {
    client: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    state: TaskState,
}

impl DirectorClient {
    pub fn from_config(cfg: &DirectorConfig) -> anyhow::Result<Self> {
        Self::new(
            &cfg.url,
            cfg.username.clone(),
            cfg.password.clone(),
            cfg.ca_cert.as_deref().map(str::as_bytes),
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    pub fn new(
        base_url: &str,
        username: String,
        password: String,
        ca_pem: Option<&[u8]>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.trim();
        anyhow::ensure!(!base_url.is_empty(), "director url cannot be empty");
        let base_url =
            Url::parse(base_url).with_context(|| format!("parse director url {base_url}"))?;
        let tls = agent_broker_tls::client_config(ca_pem).context("build director tls config")?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .context("build director http client")?;
        Ok(Self {
            client,
            base_url,
            username,
            password,
        })
    }

    fn url(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("director url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(&self.username, Some(&self.password))
    }
}

#[async_trait]
impl DeploymentClient for DirectorClient {
    async fn submit(&self, manifest: &[u8]) -> anyhow::Result<TaskId> {
        let url = self.url(&["deployments"])?;
        let resp = self
            .authed(self.client.post(url))
            .header(CONTENT_TYPE, "text/yaml")
            .body(manifest.to_vec())
            .send()
            .await
            .context("send submit deployment request")?;
        task_from_response(resp, "submit deployment").await
    }

    async fn delete(&self, deployment_name: &str) -> anyhow::Result<TaskId> {
        let url = self.url(&["deployments", deployment_name])?;
        let resp = self
            .authed(self.client.delete(url))
            .send()
            .await
            .context("send delete deployment request")?;
        task_from_response(resp, &format!("delete deployment {deployment_name}")).await
    }

    async fn task_state(&self, task: &TaskId) -> anyhow::Result<TaskState> {
        let url = self.url(&["tasks", task.as_str()])?;
        let resp = self
            .authed(self.client.get(url))
            .send()
            .await
            .context("send get task request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("failed to get task {task}: {status} {text}");
        }
        let body: TaskResponse = resp.json().await.context("decode get task response")?;
        Ok(body.state)
    }
}

/// Success is either a redirect to the task or a 2xx; the task ID comes from
/// the `Location` header, or from an `id` field in the body when there is none.
async fn task_from_response(resp: Response, action: &str) -> anyhow::Result<TaskId> {
    let status = resp.status();
    if !status.is_success() && !status.is_redirection() {
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("failed to {action}: {status} {text}");
    }

    if let Some(location) = resp.headers().get(LOCATION) {
        let location = location
            .to_str()
            .with_context(|| format!("{action}: non-ascii task location"))?;
        return parse_task_location(location)
            .with_context(|| format!("{action}: no task id in location {location:?}"));
    }
    anyhow::ensure!(
        status.is_success(),
        "{action}: redirect {status} without a task location"
    );

    let body: Value = resp
        .json()
        .await
        .with_context(|| format!("decode {action} response"))?;
    match body.get("id") {
        Some(Value::Number(id)) => Ok(TaskId::new(id.to_string())),
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(TaskId::new(id.trim())),
        _ => anyhow::bail!("{action}: response carries neither a task location nor an id"),
    }
}

fn parse_task_location(location: &str) -> Option<TaskId> {
    let path = location.split(['?', '#']).next().unwrap_or_default();
    let id = path.trim_end_matches('/').rsplit('/').next()?.trim();
    if id.is_empty() {
        return None;
    }
    Some(TaskId::new(id))
}

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AdapterError;
use crate::rule::{
    AdapterHandle, AdapterRuleState, PortRange, RuleAction, UniversalRule,
};
use crate::FirewallAdapter;

#[derive(Debug, Clone)]
pub struct CloudGroupConfig {
    pub base_url: String,
    pub group_id: String,
    pub api_token: String,
    pub request_timeout_ms: u64,
    /// Widest port span one native permission may carry; wider universal
    /// rules are split into multiple permissions under a compound handle.
    pub max_ports_per_permission: u32,
}

impl Default for CloudGroupConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8780".to_string(),
            group_id: "sg-default".to_string(),
            api_token: String::new(),
            request_timeout_ms: 5_000,
            max_ports_per_permission: 100,
        }
    }
}

#[derive(Debug, Serialize)]
struct PermissionRequest<'a> {
    direction: &'a str,
    cidr: String,
    protocol: String,
    from_port: u16,
    to_port: u16,
    effect: &'a str,
    rate_pps: Option<u32>,
    tag: &'a str,
}

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    permission_id: String,
}

#[derive(Debug, Deserialize)]
struct PermissionInfo {
    permission_id: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    hit_count: u64,
}

/// Cloud security-group adapter: drives a REST permission API. The
/// universal `rule_id` is stored as a permission tag, which is both the
/// idempotency key and the recovery path for `list`.
pub struct CloudGroupAdapter {
    adapter_id: String,
    config: CloudGroupConfig,
    client: reqwest::Client,
}

impl CloudGroupAdapter {
    pub fn new(config: CloudGroupConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            adapter_id: "cloud_group".to_string(),
            config,
            client,
        }
    }

    fn permissions_url(&self) -> String {
        format!(
            "{}/v2/groups/{}/permissions",
            self.config.base_url, self.config.group_id
        )
    }

    fn permission_url(&self, permission_id: &str) -> String {
        format!("{}/v2/permissions/{}", self.config.base_url, permission_id)
    }

    async fn existing_by_tag(&self, rule_id: &str) -> Result<Vec<String>, AdapterError> {
        let url = format!("{}?tag={}", self.permissions_url(), rule_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response)?;
        let infos: Vec<PermissionInfo> = response.json().await.map_err(map_reqwest_error)?;
        Ok(infos
            .into_iter()
            .filter(|info| info.tag == rule_id)
            .map(|info| info.permission_id)
            .collect())
    }

    /// Port chunks per backend restriction. A rule with no port match is a
    /// single all-ports permission.
    fn port_chunks(&self, ports: Option<PortRange>) -> Vec<(u16, u16)> {
        let Some(range) = ports else {
            return vec![(0, u16::MAX)];
        };
        let max_span = self.config.max_ports_per_permission.max(1);
        if range.count() <= max_span {
            return vec![(range.start, range.end)];
        }

        let mut chunks = Vec::new();
        let mut start = range.start as u32;
        while start <= range.end as u32 {
            let end = (start + max_span - 1).min(range.end as u32);
            chunks.push((start as u16, end as u16));
            start = end + 1;
        }
        chunks
    }
}

#[async_trait]
impl FirewallAdapter for CloudGroupAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    async fn apply(&self, rule: &UniversalRule) -> Result<AdapterHandle, AdapterError> {
        // Retries of the same rule find the earlier permissions by tag.
        let existing = self.existing_by_tag(&rule.rule_id).await?;
        if !existing.is_empty() {
            debug!(rule_id = %rule.rule_id, count = existing.len(), "permissions already present");
            return Ok(AdapterHandle {
                adapter_id: self.adapter_id.clone(),
                rule_id: rule.rule_id.clone(),
                native_ids: existing,
            });
        }

        let (effect, rate_pps) = match &rule.action {
            RuleAction::Allow => ("allow", None),
            RuleAction::Deny | RuleAction::Quarantine { .. } => ("deny", None),
            RuleAction::RateLimit { pps, .. } => ("rate_limit", Some(*pps)),
            RuleAction::Monitor => ("log", None),
        };
        let cidr = rule
            .matcher
            .src_cidr
            .map(|c| c.to_string())
            .unwrap_or_else(|| "0.0.0.0/0".to_string());
        let protocol = rule
            .matcher
            .protocol
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "all".to_string());

        let mut native_ids = Vec::new();
        for (from_port, to_port) in self.port_chunks(rule.matcher.dst_ports) {
            let body = PermissionRequest {
                direction: "ingress",
                cidr: cidr.clone(),
                protocol: protocol.clone(),
                from_port,
                to_port,
                effect,
                rate_pps,
                tag: &rule.rule_id,
            };
            let response = self
                .client
                .post(self.permissions_url())
                .bearer_auth(&self.config.api_token)
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let response = check_status(response)?;
            let created: PermissionResponse =
                response.json().await.map_err(map_reqwest_error)?;
            native_ids.push(created.permission_id);
        }

        Ok(AdapterHandle {
            adapter_id: self.adapter_id.clone(),
            rule_id: rule.rule_id.clone(),
            native_ids,
        })
    }

    async fn remove(&self, handle: &AdapterHandle) -> Result<(), AdapterError> {
        for native_id in &handle.native_ids {
            let response = self
                .client
                .delete(self.permission_url(native_id))
                .bearer_auth(&self.config.api_token)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            // Already gone is success: removes must be idempotent.
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            check_status(response)?;
        }
        Ok(())
    }

    async fn query(&self, handle: &AdapterHandle) -> Result<AdapterRuleState, AdapterError> {
        let mut present = false;
        let mut hit_count = 0u64;
        for native_id in &handle.native_ids {
            let response = self
                .client
                .get(self.permission_url(native_id))
                .bearer_auth(&self.config.api_token)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            let response = check_status(response)?;
            let info: PermissionInfo = response.json().await.map_err(map_reqwest_error)?;
            present = true;
            hit_count = hit_count.saturating_add(info.hit_count);
        }
        Ok(AdapterRuleState { present, hit_count })
    }

    async fn list(&self) -> Result<Vec<AdapterHandle>, AdapterError> {
        let response = self
            .client
            .get(self.permissions_url())
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response)?;
        let infos: Vec<PermissionInfo> = response.json().await.map_err(map_reqwest_error)?;

        let mut handles: Vec<AdapterHandle> = Vec::new();
        for info in infos {
            if info.tag.is_empty() {
                continue;
            }
            match handles.iter_mut().find(|h| h.rule_id == info.tag) {
                Some(handle) => handle.native_ids.push(info.permission_id),
                None => handles.push(AdapterHandle {
                    adapter_id: self.adapter_id.clone(),
                    rule_id: info.tag,
                    native_ids: vec![info.permission_id],
                }),
            }
        }
        Ok(handles)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> AdapterError {
    if err.is_connect() {
        AdapterError::Unreachable(err.to_string())
    } else if err.is_timeout() {
        AdapterError::Transient(err.to_string())
    } else {
        AdapterError::Permanent(err.to_string())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.as_u16() == 429 || status.is_server_error() {
        Err(AdapterError::Transient(format!("status {}", status)))
    } else {
        Err(AdapterError::Permanent(format!("status {}", status)))
    }
}

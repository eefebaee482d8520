use crate::{
    catalog::{
        parse_version,
        CapabilityKind,
        ComponentCatalog,
        QueryDefinition,
    },
    executor::{
        CallExecutor,
        Capability,
        HttpBackend,
        SshBackend,
    },
    outcome::{
        CallOutcome,
        CallStatus,
        NodeResult,
    },
    discovery::facts_from,
    target::{
        Platform,
        Target,
    },
};
use cluster_diag_config::SshConfig;
use semver::Version;
use std::{
    collections::BTreeMap,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

pub const TARGET_UNREACHABLE: &str = "target unreachable";
pub const RUN_CANCELLED: &str = "run cancelled";
pub const REMOTE_COMMANDS_DISABLED: &str = "remote commands disabled";

/// Everything a node collector needs, shared read-only between all of them.
#[derive(Debug)]
pub struct CollectionContext {
    pub component: ComponentCatalog,
    /// Catalog variables with configured overrides applied.
    pub variables: BTreeMap<String, String>,
    pub mode: String,
    pub http: HttpBackend,
    /// `None` when remote commands are disabled.
    pub ssh: Option<SshConfig>,
    pub executor: CallExecutor,
    pub call_timeout: Duration,
    pub cancel_grace: Duration,
    pub cancel: CancellationToken,
}

/// Collects one target: bootstrap first, then every query in catalog order.
pub struct NodeCollector<'a> {
    ctx: &'a CollectionContext,
}

impl<'a> NodeCollector<'a> {
    pub fn new(ctx: &'a CollectionContext) -> Self {
        Self { ctx }
    }

    /// Never fails. The SSH session, if one was opened, is closed before returning.
    #[instrument(level = "debug", skip_all, fields(node = %target.key))]
    pub async fn collect(&self, target: Target) -> NodeResult {
        let ssh = self
            .ctx
            .ssh
            .as_ref()
            .map(|config| SshBackend::new(config.clone(), target.host.clone()));

        let result = self
            .collect_with(target, &self.ctx.http, ssh.as_ref().map(|backend| backend as &dyn Capability))
            .await;

        if let Some(ssh) = ssh {
            ssh.close().await;
        }
        result
    }

    pub(crate) async fn collect_with(
        &self,
        mut target: Target,
        http: &dyn Capability,
        ssh: Option<&dyn Capability>,
    ) -> NodeResult {
        let component = &self.ctx.component;
        let mut vars = self.ctx.variables.clone();
        vars.extend(target.variables(None));

        let bootstrap = &component.bootstrap;
        let mut outcomes = Vec::with_capacity(component.queries.len() + 1);

        if self.ctx.cancel.is_cancelled() {
            return not_collected(target, component, RUN_CANCELLED);
        }

        let (mut boot, body) = self.call(http, &bootstrap.query, &target, &vars).await;
        let json: Option<serde_json::Value> = match boot.status {
            CallStatus::Success => body.as_deref().and_then(|body| serde_json::from_slice(body).ok()),
            _ => None,
        };
        let version = json
            .as_ref()
            .and_then(|json| read_version(json, &bootstrap.version_pointer));
        let Some((raw_version, version)) = version else {
            let reason = if boot.status == CallStatus::Success {
                boot.status = CallStatus::Failed;
                boot.detail = Some(format!("no version at {}", bootstrap.version_pointer));
                "version unknown"
            } else if boot.status == CallStatus::Skipped {
                RUN_CANCELLED
            } else {
                TARGET_UNREACHABLE
            };
            warn!(node = %target.key, "bootstrap failed, skipping the remaining queries: {reason}");
            outcomes.push(boot);
            outcomes.extend(component.queries.iter().map(|query| skip(query, reason)));
            return NodeResult::new(target, None, outcomes);
        };
        outcomes.push(boot);

        if let Some(json) = &json {
            if let Some(os) = bootstrap
                .platform_pointer
                .as_deref()
                .and_then(|pointer| json.pointer(pointer))
                .and_then(serde_json::Value::as_str)
            {
                target.platform = Some(Platform::from_os_name(os));
            }
            target.facts.extend(facts_from(json, &bootstrap.facts));
        }
        let platform = target.platform.unwrap_or(Platform::Linux);
        vars.extend(target.variables(Some(&raw_version)));

        info!(node = %target.key, version = %raw_version, %platform, "collecting");

        let applicable = component.applicable_queries(&version);
        for query in &component.queries {
            let outcome = if self.ctx.cancel.is_cancelled() {
                skip(query, RUN_CANCELLED)
            } else if !query.runs_in_mode(&self.ctx.mode) {
                skip(query, format!("excluded by mode {}", self.ctx.mode))
            } else if !applicable.iter().any(|q| q.name == query.name) {
                skip(query, format!("not applicable to version {raw_version}"))
            } else if !query.runs_on(platform) {
                skip(query, format!("not applicable to platform {platform}"))
            } else {
                match (query.kind(), ssh) {
                    (CapabilityKind::Http, _) => self.call(http, query, &target, &vars).await.0,
                    (CapabilityKind::Ssh, Some(ssh)) => self.call(ssh, query, &target, &vars).await.0,
                    (CapabilityKind::Ssh, None) => skip(query, REMOTE_COMMANDS_DISABLED),
                }
            };
            outcomes.push(outcome);
        }

        let result = NodeResult::new(target, Some(raw_version), outcomes);
        info!(node = %result.target.key, status = %result.status, "node collected");
        result
    }

    /// Runs one call. On cancellation the call gets the grace period to finish, after that it
    /// is abandoned and recorded as skipped.
    async fn call(
        &self,
        backend: &dyn Capability,
        query: &QueryDefinition,
        target: &Target,
        vars: &BTreeMap<String, String>,
    ) -> (CallOutcome, Option<Vec<u8>>) {
        let execution = self
            .ctx
            .executor
            .execute_with_body(backend, query, target, vars, self.ctx.call_timeout);
        tokio::pin!(execution);

        tokio::select! {
            result = &mut execution => result,
            _ = self.ctx.cancel.cancelled() => {
                match tokio::time::timeout(self.ctx.cancel_grace, &mut execution).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(node = %target.key, query = %query.name, "call abandoned");
                        (skip(query, RUN_CANCELLED), None)
                    }
                }
            }
        }
    }
}

/// Result of a target that was never collected: every query skipped for `reason`.
pub fn not_collected(target: Target, component: &ComponentCatalog, reason: &str) -> NodeResult {
    let outcomes = std::iter::once(&component.bootstrap.query)
        .chain(&component.queries)
        .map(|query| skip(query, reason))
        .collect();
    NodeResult {
        skipped_reason: Some(reason.to_string()),
        ..NodeResult::new(target, None, outcomes)
    }
}

fn skip(query: &QueryDefinition, reason: impl Into<String>) -> CallOutcome {
    CallOutcome::skipped(&query.name, query.kind(), query.critical, reason)
}

fn read_version(json: &serde_json::Value, pointer: &str) -> Option<(String, Version)> {
    let raw = json.pointer(pointer)?.as_str()?.to_string();
    let version = parse_version(&raw)?;
    Some((raw, version))
}

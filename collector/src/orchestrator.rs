use crate::{
    catalog::Catalog,
    discovery::Discovery,
    error::RunError,
    executor::{
        CallExecutor,
        HttpBackend,
    },
    node::{
        not_collected,
        CollectionContext,
        NodeCollector,
        RUN_CANCELLED,
    },
    outcome::{
        CallStatus,
        NodeResult,
        RunManifest,
    },
    policy::RetryPolicy,
    target::Target,
    writer::OutputWriter,
};
use chrono::Utc;
use cluster_diag_config::Config;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Drives one run: discovery, bounded per-target collection, aggregation, manifest.
pub struct Orchestrator {
    config: Config,
    catalog: Catalog,
    writer: OutputWriter,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, catalog: Catalog, writer: OutputWriter) -> Self {
        Self {
            config,
            catalog,
            writer,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling stops dispatching targets. Calls in flight get the grace period, then are
    /// abandoned.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn writer(&self) -> &OutputWriter {
        &self.writer
    }

    /// Only fails when the component is not in the catalog, no seed or no discovered target could
    /// be reached, or the manifest cannot be written. Everything else is recorded in the returned
    /// manifest.
    pub async fn run(&self) -> Result<RunManifest, RunError> {
        let config = &self.config;
        let manifest = RunManifest::new(
            &config.component,
            &config.mode,
            config.seeds.iter().map(Url::to_string).collect(),
            Utc::now(),
        );
        let component = self.catalog.component(&config.component)?.clone();
        let http = HttpBackend::new(&config.http).map_err(RunError::Client)?;
        let policy = RetryPolicy::from_config(config);

        let watchdog = {
            let cancel = self.cancel.clone();
            let timeout = config.run_timeout();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        warn!("Run timeout of {timeout:?} reached, cancelling");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        };

        let discovered = {
            let discovery = Discovery::new(
                &component,
                &http,
                self.catalog.variables(),
                policy,
                config.call_timeout(),
            );
            tokio::select! {
                targets = discovery.run(&config.seeds) => targets,
                _ = self.cancel.cancelled() => Err("run cancelled during discovery".to_string()),
            }
        };
        let targets = match discovered {
            Ok(targets) => targets,
            Err(reason) => {
                watchdog.abort();
                error!("Discovery failed: {reason}");
                return Err(RunError::Fatal {
                    manifest: Box::new(manifest.fatal(reason.clone())),
                    reason,
                });
            }
        };

        let ctx = Arc::new(CollectionContext {
            component,
            variables: self.catalog.variables().clone(),
            mode: config.mode.clone(),
            http,
            ssh: config.ssh.enabled.then(|| config.ssh.clone()),
            executor: CallExecutor::new(policy, self.writer.clone()),
            call_timeout: config.call_timeout(),
            cancel_grace: config.cancel_grace(),
            cancel: self.cancel.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let mut handles = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let ctx = ctx.clone();
            let target = target.clone();
            debug!(node = %target.key, "dispatching collector");
            let handle = tokio::spawn(async move {
                let _permit = permit;
                NodeCollector::new(&ctx).collect(target).await
            });
            handles.push(async move { (index, handle.await) });
        }
        if handles.len() < targets.len() {
            warn!(
                dispatched = handles.len(),
                targets = targets.len(),
                "run cancelled before every target was started"
            );
        }

        let mut slots: Vec<Option<NodeResult>> = vec![None; targets.len()];
        for (index, joined) in join_all(handles).await {
            slots[index] = Some(match joined {
                Ok(result) => result,
                Err(err) => {
                    error!("Collector of {} stopped unexpectedly: {err}", targets[index].key);
                    crashed(targets[index].clone(), &ctx, &err.to_string())
                }
            });
        }

        let nodes: Vec<NodeResult> = slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| slot.unwrap_or_else(|| not_collected(target, &ctx.component, RUN_CANCELLED)))
            .collect();

        let cancelled = self.cancel.is_cancelled();
        watchdog.abort();

        if !cancelled && !nodes.iter().any(NodeResult::reached) {
            let reason = format!("none of the {} discovered targets answered", nodes.len());
            error!("Collection failed: {reason}");
            return Err(RunError::Fatal {
                manifest: Box::new(manifest.fatal(reason.clone())),
                reason,
            });
        }

        let manifest = manifest.finish(nodes, cancelled);
        self.writer.write_manifest(&manifest).await.map_err(RunError::Output)?;
        info!(status = %manifest.status, nodes = manifest.nodes.len(), cancelled, "run finished");
        Ok(manifest)
    }
}

/// A collector task that panicked: its bootstrap counts as failed, the rest as skipped.
fn crashed(target: Target, ctx: &CollectionContext, detail: &str) -> NodeResult {
    let mut outcomes = not_collected(target.clone(), &ctx.component, "collector stopped unexpectedly").outcomes;
    if let Some(bootstrap) = outcomes.first_mut() {
        bootstrap.status = CallStatus::Failed;
        bootstrap.detail = Some(detail.to_string());
    }
    NodeResult::new(target, None, outcomes)
}

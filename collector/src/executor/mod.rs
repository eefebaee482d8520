mod http;
mod ssh;

pub use http::HttpBackend;
pub use ssh::{
    SshBackend,
    SshSession,
};

use crate::{
    catalog::{
        CapabilityKind,
        QueryDefinition,
    },
    error::AttemptError,
    outcome::{
        CallOutcome,
        CallStatus,
    },
    policy::RetryPolicy,
    target::Target,
    template,
    writer::OutputWriter,
};
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    time::{
        Duration,
        Instant,
    },
};

/// Raw response of one attempt that reached the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub body: Vec<u8>,
    pub http_status: Option<u16>,
    pub exit_code: Option<i32>,
    /// Whether the remote side reported success (2xx, or an accepted exit status).
    pub success: bool,
    pub detail: Option<String>,
}

pub type AttemptFuture<'a> = Pin<Box<dyn Future<Output = Result<Capture, AttemptError>> + Send + 'a>>;

/// One way of reaching a target. Selected by the query's declared kind.
pub trait Capability: Send + Sync {
    fn kind(&self) -> CapabilityKind;

    /// A single attempt without timeout or retry, `rendered` is the request path or command
    /// with placeholders substituted.
    fn attempt<'a>(&'a self, query: &'a QueryDefinition, rendered: &'a str, target: &'a Target) -> AttemptFuture<'a>;
}

/// Runs one query through a capability under the retry policy and records the outcome.
#[derive(Debug, Clone)]
pub struct CallExecutor {
    policy: RetryPolicy,
    writer: OutputWriter,
}

impl CallExecutor {
    pub fn new(policy: RetryPolicy, writer: OutputWriter) -> Self {
        Self { policy, writer }
    }

    pub fn writer(&self) -> &OutputWriter {
        &self.writer
    }

    /// Never fails: every problem ends up in the returned outcome. Any response that reached
    /// the remote side is written, failed ones included.
    pub async fn execute(
        &self,
        backend: &dyn Capability,
        query: &QueryDefinition,
        target: &Target,
        vars: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> CallOutcome {
        self.execute_with_body(backend, query, target, vars, timeout).await.0
    }

    /// Like [`CallExecutor::execute`], also handing back the captured body.
    #[instrument(level = "debug", skip_all, fields(node = %target.key, query = %query.name))]
    pub async fn execute_with_body(
        &self,
        backend: &dyn Capability,
        query: &QueryDefinition,
        target: &Target,
        vars: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> (CallOutcome, Option<Vec<u8>>) {
        let started = Instant::now();
        let mut outcome = CallOutcome {
            status: CallStatus::Failed,
            detail: None,
            ..CallOutcome::skipped(&query.name, query.kind(), query.critical, "")
        };

        if backend.kind() != query.kind() {
            outcome.detail = Some(format!("no {} capability available", query.kind()));
            return (outcome, None);
        }

        let rendered = match template::render(query.request.template(), vars) {
            Ok(rendered) => rendered,
            Err(err) => {
                outcome.detail = Some(format!("cannot render request: {err:?}"));
                return (outcome, None);
            }
        };

        let timeout = query.timeout.unwrap_or(timeout);
        let attempted = self
            .policy
            .run(query.idempotent, timeout, || backend.attempt(query, &rendered, target))
            .await;
        outcome.attempts = attempted.attempts;

        let mut body = None;
        match attempted.result {
            Ok(capture) => {
                outcome.http_status = capture.http_status;
                outcome.exit_code = capture.exit_code;
                outcome.detail = capture.detail;
                match self.writer.write_artifact(&target.key, &query.output, &capture.body).await {
                    Ok(artifact) => {
                        outcome.status = if capture.success {
                            CallStatus::Success
                        } else {
                            CallStatus::Failed
                        };
                        outcome.output = Some(artifact.relative);
                        outcome.sha1 = Some(artifact.sha1);
                        outcome.size = Some(artifact.size);
                        body = Some(capture.body);
                    }
                    Err(err) => {
                        error!("Failed to store output of {}: {err:#}", query.name);
                        outcome.status = CallStatus::Failed;
                        outcome.detail = Some(format!("cannot write output: {err:#}"));
                    }
                }
            }
            Err(AttemptError::Timeout(elapsed)) => {
                outcome.status = CallStatus::TimedOut;
                outcome.detail = Some(format!("no response within {elapsed:?}"));
            }
            Err(err) => {
                outcome.status = CallStatus::Failed;
                outcome.detail = Some(err.to_string());
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        match outcome.status {
            CallStatus::Success => debug!(attempts = outcome.attempts, "call succeeded"),
            status => warn!(
                %status,
                detail = outcome.detail.as_deref().unwrap_or_default(),
                "call did not succeed"
            ),
        }
        (outcome, body)
    }
}

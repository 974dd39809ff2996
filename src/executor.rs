//! Fan-out execution of one operation across a host pool.
//!
//! One pipeline stage is one `dispatch` call: the same operation runs
//! against every host in the target set concurrently, each host bounded by
//! the per-host timeout, and the call returns only once every host has
//! completed or timed out. Per-host failures never escape as errors of
//! their own; they are captured into that host's slot of the `StageReport`.
//! Retry policy belongs to callers, not here.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time;

use crate::config::Context;
use crate::host::HostTarget;

/// Per-host output captured line by line as an operation runs, so a failed
/// or timed-out operation still yields whatever it produced.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    pub fn push(&self, line: impl Into<String>) {
        self.0.lock().unwrap().push(line.into());
    }

    pub fn snapshot(&self) -> String {
        self.0.lock().unwrap().join("\n")
    }
}

/// What went wrong with one operation on one host.
#[derive(Error, Debug)]
pub enum OpError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to establish or maintain the remote session: {0}")]
    Connection(String),
    #[error("remote command exited with status {code}")]
    RemoteCommand { code: i32 },
    #[error("internal fault: {0}")]
    Internal(String),
}

impl OpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::Timeout(_) => ErrorKind::Timeout,
            OpError::Connection(_) => ErrorKind::Connection,
            OpError::RemoteCommand { .. } => ErrorKind::RemoteCommand,
            OpError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Connection,
    RemoteCommand,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::RemoteCommand => write!(f, "remote command"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// One unit of work applied uniformly to every host in a stage.
///
/// Operations must not mutate shared state; anything they produce goes into
/// the per-host `Transcript`.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Short description used in logs and failure reports.
    fn describe(&self) -> String;

    async fn run(
        &self,
        host: &HostTarget,
        ctx: &Context,
        out: &Transcript,
    ) -> Result<(), OpError>;
}

#[derive(Debug)]
pub enum OperationResult {
    Success(String),
    Failure { error: OpError, partial: String },
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success(_))
    }

    pub fn error(&self) -> Option<&OpError> {
        match self {
            OperationResult::Success(_) => None,
            OperationResult::Failure { error, .. } => Some(error),
        }
    }
}

/// Exactly one result per requested host, in host-input order.
#[derive(Debug, Default)]
pub struct StageReport {
    entries: Vec<(HostTarget, OperationResult)>,
}

impl StageReport {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, host: &HostTarget) -> Option<&OperationResult> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == host)
            .map(|(_, result)| result)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(HostTarget, OperationResult)> {
        self.entries.iter()
    }

    pub fn failed(&self) -> Vec<(&HostTarget, &OpError)> {
        self.entries
            .iter()
            .filter_map(|(host, result)| result.error().map(|error| (host, error)))
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.entries.iter().all(|(_, result)| result.is_success())
    }

    /// One line naming every failed host with its error kind.
    pub fn failure_summary(&self) -> String {
        let failed: Vec<String> = self
            .failed()
            .into_iter()
            .map(|(host, error)| format!("{} {}: {}", host, error.kind(), error))
            .collect();
        format!("{}/{} host(s): {}", failed.len(), self.len(), failed.join("; "))
    }
}

/// How per-host outcomes aggregate into the stage outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Any per-host failure fails the stage.
    AllMustSucceed,
    /// The stage always completes; the caller inspects the report.
    BestEffort,
}

/// A stage that failed under `AllMustSucceed`. Carries the full per-host
/// report so callers can log the complete breakdown.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed on {}", .report.failure_summary())]
pub struct StageFailure {
    pub stage: String,
    pub report: StageReport,
}

#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    pub timeout: Duration,
    pub policy: Policy,
    pub max_concurrent: Option<usize>,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            policy: Policy::AllMustSucceed,
            max_concurrent: None,
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_concurrent(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent = limit;
        self
    }

    /// Runs `op` against every host concurrently and returns once all of
    /// them completed or timed out. An operation that panics is contained
    /// by its task and recorded as an `Internal` failure for that host
    /// alone. Under `AllMustSucceed` any per-host failure turns into a
    /// `StageFailure` carrying the full report.
    pub async fn dispatch(
        &self,
        hosts: &[HostTarget],
        op: Arc<dyn Operation>,
        ctx: Arc<Context>,
    ) -> Result<StageReport, StageFailure> {
        if hosts.is_empty() {
            return Ok(StageReport::default());
        }

        let limiter = self.max_concurrent.map(|n| Arc::new(Semaphore::new(n)));
        let (done_tx, done_rx) = flume::bounded::<(usize, OperationResult)>(hosts.len());

        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts.iter().cloned() {
            let op = Arc::clone(&op);
            let ctx = Arc::clone(&ctx);
            let done_tx = done_tx.clone();
            let limiter = limiter.clone();
            let timeout = self.timeout;
            let index = handles.len();
            handles.push(tokio::spawn(async move {
                // Wait for a slot before the per-host clock starts.
                let _permit = match &limiter {
                    Some(semaphore) => Some(
                        Arc::clone(semaphore)
                            .acquire_owned()
                            .await
                            .expect("concurrency limiter closed"),
                    ),
                    None => None,
                };
                let transcript = Transcript::default();
                let result = match time::timeout(timeout, op.run(&host, &ctx, &transcript)).await {
                    Ok(Ok(())) => OperationResult::Success(transcript.snapshot()),
                    Ok(Err(error)) => OperationResult::Failure {
                        error,
                        partial: transcript.snapshot(),
                    },
                    Err(_) => OperationResult::Failure {
                        error: OpError::Timeout(timeout),
                        partial: transcript.snapshot(),
                    },
                };
                let _ = done_tx.send_async((index, result)).await;
            }));
        }
        drop(done_tx);

        // The channel closes once every task has finished, whether it
        // reported or panicked.
        let mut slots: Vec<Option<OperationResult>> = hosts.iter().map(|_| None).collect();
        while let Ok((index, result)) = done_rx.recv_async().await {
            slots[index] = Some(result);
        }

        // A panicked task never reports through the channel. Convert its
        // join error into an Internal failure for that host alone.
        for (index, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                if slots[index].is_none() {
                    slots[index] = Some(OperationResult::Failure {
                        error: OpError::Internal(format!("operation panicked: {}", e)),
                        partial: String::new(),
                    });
                }
            }
        }

        let entries = hosts
            .iter()
            .cloned()
            .zip(slots)
            .map(|(host, slot)| {
                let result = slot.unwrap_or_else(|| OperationResult::Failure {
                    error: OpError::Internal(
                        "operation finished without reporting a result".to_string(),
                    ),
                    partial: String::new(),
                });
                (host, result)
            })
            .collect();
        let report = StageReport { entries };

        match self.policy {
            Policy::AllMustSucceed if !report.all_succeeded() => Err(StageFailure {
                stage: op.describe(),
                report,
            }),
            _ => Ok(report),
        }
    }
}

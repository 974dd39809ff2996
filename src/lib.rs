//! Nexus: a staged multi-host CI command pipeline over SSH.

// Command line arguments and configuration.
pub mod config;
// How to parse and represent hosts.
pub mod host;
// Fan-out execution of operations across hosts.
pub mod executor;
// SSH session wrapper.
pub mod session;
// Pipeline stages.
pub mod stages;
// Error handling.
pub mod error;

pub use config::{Command, ConfFile, Config, Context};
pub use error::NexusError;
pub use executor::{
    Dispatcher, ErrorKind, OpError, Operation, OperationResult, Policy, StageFailure, StageReport,
    Transcript,
};
pub use host::{get_hosts, HostTarget};
pub use session::{Connector, Remote, SshConnector};
pub use stages::{plan, run_pipeline, RunScope, StagePlan, Targets};

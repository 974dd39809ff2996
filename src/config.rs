//! Configuration for Nexus.
//!
//! Holds the clap structs for command line arguments, the YAML
//! configuration file, and the read-only `Context` handed to every stage
//! operation. CI environment variables are captured into the Context at
//! startup and override file values.

use std::collections::HashMap;
use std::fs::File;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::NexusError;
use crate::host::HostSpec;

#[derive(Parser)]
#[command(version, author)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file to use. Defaults to `nexus.yaml`
    #[arg(long, default_value = "nexus.yaml")]
    pub conf: String,

    /// Per-host operation timeout in seconds
    #[arg(long, short, default_value = "600")]
    pub timeout_secs: u64,

    /// Report per-host failures instead of failing the run on them
    #[arg(long, short)]
    pub best_effort: bool,

    /// Bound on concurrent host operations. Defaults to one task per host
    #[arg(long)]
    pub max_concurrent: Option<usize>,
}

#[derive(Subcommand, PartialEq, Clone)]
pub enum Command {
    /// Run the full pipeline: keys, prerequisites, repos, tests, artifacts
    Run,
    /// Configure package repositories on all hosts and stop
    Repos,
    /// Run the test stages only, assuming hosts are already prepared
    Tests,
    /// Validate the configuration and environment without touching any host
    Check,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfFile {
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub ssh: SshConf,
    #[serde(default)]
    pub packages: PackagesConf,
    #[serde(default)]
    pub repos: ReposConf,
    #[serde(default)]
    pub tests: TestsConf,
    /// Remote paths fetched from the master into the workspace after a run.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SshConf {
    /// Login user for hosts that don't name one themselves.
    pub username: Option<String>,
    /// Private key deployed to /root/.ssh/id_rsa on every host.
    pub private_key: Option<String>,
    /// Public key appended to /root/.ssh/authorized_keys on every host.
    pub public_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PackagesConf {
    /// Packages installed on every host before anything else runs.
    #[serde(default)]
    pub prereqs: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReposConf {
    /// Repo URLs added on every host with yum-config-manager.
    #[serde(default)]
    pub static_urls: Vec<String>,
    /// Named extra repos, added in name order.
    #[serde(default)]
    pub extra: HashMap<String, String>,
    /// Machine arch used to pick among per-arch task repo URLs.
    pub arch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestsConf {
    /// Git URL of the test suite, cloned on every host.
    pub repo_url: Option<String>,
    /// Directory the suite is installed from after cloning.
    pub base_dir: Option<String>,
    /// Local multihost config file, pushed to the same path remotely.
    pub config_file: Option<String>,
    /// Test selection passed to the runner.
    pub to_run: Option<String>,
    /// Where the runner writes its junit XML on the master.
    pub junit_path: Option<String>,
    /// Full runner command template. Overrides the py.test default.
    pub runner: Option<String>,
}

pub fn load_conf(path: &str) -> Result<ConfFile, NexusError> {
    let file = File::open(path)?;
    Ok(serde_yaml::from_reader(file)?)
}

/// Read-only bag of configuration values shared by every operation in a
/// stage. Built once per run and frozen behind an `Arc` before dispatch.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: HashMap<String, String>,
}

impl Context {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// The full map, for rendering command templates.
    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }
}

/// Environment variables captured into the Context, with the key each one
/// lands under. These come from the CI system and override file values.
const CAPTURED_ENV: &[(&str, &str)] = &[
    ("WORKSPACE", "workspace"),
    ("JOB_NAME", "job_name"),
    ("EXISTING_NODES", "existing_nodes"),
    ("BUILD_REPO_TAG", "build_repo_tag"),
    ("BUILD_REPO_URL", "build_repo_url"),
    ("STATIC_REPO_URLS", "static_repo_urls"),
    ("TASK_REPO_URLS", "task_repo_urls"),
];

pub fn setup_context(conf: &ConfFile) -> Context {
    let mut ctx = context_from_conf(conf);
    let env: HashMap<String, String> = std::env::vars().collect();
    capture_env(&mut ctx, &env);
    ctx
}

fn context_from_conf(conf: &ConfFile) -> Context {
    let mut ctx = Context::default();
    ctx.set("workspace", ".");
    if !conf.packages.prereqs.is_empty() {
        ctx.set("prereqs", conf.packages.prereqs.join(" "));
    }
    if !conf.repos.static_urls.is_empty() {
        ctx.set("static_repo_urls", conf.repos.static_urls.join(";"));
    }
    if let Some(arch) = &conf.repos.arch {
        ctx.set("arch", arch);
    }
    if let Some(url) = &conf.tests.repo_url {
        ctx.set("tests_repo", url);
    }
    if let Some(dir) = &conf.tests.base_dir {
        ctx.set("tests_base", dir);
    }
    if let Some(path) = &conf.tests.config_file {
        ctx.set("tests_config", path);
    }
    if let Some(tests) = &conf.tests.to_run {
        ctx.set("tests_to_run", tests);
    }
    if let Some(path) = &conf.tests.junit_path {
        ctx.set("junit_path", path);
    }
    ctx
}

fn capture_env(ctx: &mut Context, env: &HashMap<String, String>) {
    for (var, key) in CAPTURED_ENV {
        match env.get(*var) {
            Some(value) if !value.is_empty() => {
                eprintln!("[nexus] {} from env variable is {}", var, value);
                ctx.set(*key, value.clone());
            }
            _ => eprintln!("[nexus] Unable to find {} in env variable", var),
        }
    }
}

//! Pipeline stages.
//!
//! A run is a fixed sequence of stages, each one fan-out: the same
//! operation dispatched to every host in its target set, joined before the
//! next stage starts. Test execution and artifact retrieval target the
//! master host only. Stage commands are Handlebars templates rendered
//! against the Context plus per-host parameters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use itertools::sorted;
use tokio::sync::Mutex;

use crate::config::{ConfFile, Context};
use crate::error::NexusError;
use crate::executor::{Dispatcher, OpError, Operation, OperationResult, Policy, Transcript};
use crate::host::HostTarget;
use crate::session::Connector;

const DEFAULT_RUNNER: &str =
    "py.test --junit-xml={{junit_path}} --multihost-config={{tests_config}} {{tests_to_run}}";

/// Which hosts a stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Targets {
    AllHosts,
    /// The first host in input order.
    MasterOnly,
}

pub struct StagePlan {
    pub name: &'static str,
    pub op: Arc<dyn Operation>,
    pub targets: Targets,
    pub policy: Policy,
}

/// Which part of the pipeline a subcommand asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunScope {
    Full,
    ReposOnly,
    TestsOnly,
}

fn template_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    handlebars_misc_helpers::register(&mut registry);
    registry
}

fn render(
    registry: &mut Handlebars,
    template: &str,
    host: &HostTarget,
    ctx: &Context,
) -> Result<String, OpError> {
    if !registry.has_template(template) {
        registry
            .register_template_string(template, template)
            .map_err(|e| OpError::Internal(format!("failed to register command template: {}", e)))?;
    }
    let mut params = ctx.values().clone();
    params.extend(host.params.clone());
    params.insert("hostname".to_string(), host.hostname.clone());
    registry.render(template, &params).map_err(|e| {
        OpError::Internal(format!(
            "failed to render command template '{}': {}",
            template, e
        ))
    })
}

/// Runs a sequence of shell command templates on the host.
pub struct ShellOp {
    label: String,
    connector: Arc<dyn Connector>,
    templates: Vec<String>,
}

impl ShellOp {
    pub fn new(
        label: impl Into<String>,
        connector: Arc<dyn Connector>,
        templates: Vec<String>,
    ) -> Self {
        Self {
            label: label.into(),
            connector,
            templates,
        }
    }
}

#[async_trait]
impl Operation for ShellOp {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn run(&self, host: &HostTarget, ctx: &Context, out: &Transcript) -> Result<(), OpError> {
        let mut registry = template_registry();
        let remote = self.connector.connect(host).await?;
        for template in &self.templates {
            let command = render(&mut registry, template, host, ctx)?;
            remote.run(&command, out).await?;
        }
        remote.close().await
    }
}

/// Puts the configured key pair on the host and opens up host-to-host SSH,
/// which multihost test suites need.
pub struct DeployKeys {
    connector: Arc<dyn Connector>,
    private_key: PathBuf,
    public_key: PathBuf,
}

impl DeployKeys {
    pub fn new(connector: Arc<dyn Connector>, private_key: PathBuf, public_key: PathBuf) -> Self {
        Self {
            connector,
            private_key,
            public_key,
        }
    }
}

#[async_trait]
impl Operation for DeployKeys {
    fn describe(&self) -> String {
        "deploy ssh keys".to_string()
    }

    async fn run(&self, host: &HostTarget, _ctx: &Context, out: &Transcript) -> Result<(), OpError> {
        let remote = self.connector.connect(host).await?;
        remote.run("mkdir -p /root/.ssh", out).await?;
        let key = read_local(&self.private_key).await?;
        remote.push(&key, "/root/.ssh/id_rsa", out).await?;
        let key = read_local(&self.public_key).await?;
        remote.push(&key, "/root/.ssh/authorized_keys", out).await?;
        remote.run("chmod 600 /root/.ssh/id_rsa", out).await?;
        remote.run("chmod 644 /root/.ssh/authorized_keys", out).await?;
        remote.run("chmod 700 /root/.ssh", out).await?;
        remote
            .run("echo \"StrictHostKeyChecking no\" >> /root/.ssh/config", out)
            .await?;
        remote.close().await
    }
}

/// Sets up every package repository the run needs: the CI build repo when
/// the environment names one, static and task repo URLs, and the named
/// extra repos from the configuration file.
pub struct ConfigureRepos {
    connector: Arc<dyn Connector>,
    /// Named repos from the conf file, in name order.
    extra: Vec<(String, String)>,
}

impl ConfigureRepos {
    pub fn new(connector: Arc<dyn Connector>, extra: Vec<(String, String)>) -> Self {
        Self { connector, extra }
    }
}

#[async_trait]
impl Operation for ConfigureRepos {
    fn describe(&self) -> String {
        "configure repos".to_string()
    }

    async fn run(&self, host: &HostTarget, ctx: &Context, out: &Transcript) -> Result<(), OpError> {
        let remote = self.connector.connect(host).await?;

        if let (Some(tag), Some(url)) = (ctx.get("build_repo_tag"), ctx.get("build_repo_url")) {
            let dest = format!("/etc/yum.repos.d/{}.repo", tag);
            remote.push(repo_file(tag, url).as_bytes(), &dest, out).await?;
        }

        if let Some(urls) = ctx.get("static_repo_urls") {
            for url in urls.split(';').map(str::trim).filter(|url| !url.is_empty()) {
                remote
                    .run(&format!("yum-config-manager --add-repo {}", url), out)
                    .await?;
            }
        }

        if let Some(urls) = ctx.get("task_repo_urls") {
            let urls: Vec<&str> = urls
                .split(';')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .collect();
            match pick_task_repo(&urls, ctx.get("arch")) {
                Some(url) => {
                    remote
                        .run(&format!("yum-config-manager --add-repo {}", url), out)
                        .await?
                }
                None => out.push("no task repo matches the configured arch"),
            }
        }

        for (name, url) in &self.extra {
            out.push(format!("adding repo {}", name));
            remote
                .run(&format!("yum-config-manager --add-repo {}", url), out)
                .await?;
        }

        remote.close().await
    }
}

/// Clones the test suite, pushes the multihost config with node addresses
/// filled in, and installs the suite.
pub struct InstallTests {
    connector: Arc<dyn Connector>,
    config_file: Option<PathBuf>,
}

impl InstallTests {
    pub fn new(connector: Arc<dyn Connector>, config_file: Option<PathBuf>) -> Self {
        Self {
            connector,
            config_file,
        }
    }
}

#[async_trait]
impl Operation for InstallTests {
    fn describe(&self) -> String {
        "install tests".to_string()
    }

    async fn run(&self, host: &HostTarget, ctx: &Context, out: &Transcript) -> Result<(), OpError> {
        let mut registry = template_registry();
        let remote = self.connector.connect(host).await?;
        let command = render(&mut registry, "git clone {{tests_repo}}", host, ctx)?;
        remote.run(&command, out).await?;
        remote.run("mkdir -p /root/multihost_tests", out).await?;
        if let Some(path) = &self.config_file {
            let data = read_local(path).await?;
            let content = substitute_nodes(
                String::from_utf8_lossy(&data).into_owned(),
                ctx.get("existing_nodes"),
            );
            let dest = ctx
                .get("tests_config")
                .map(str::to_string)
                .unwrap_or_else(|| path.to_string_lossy().into_owned());
            remote.push(content.as_bytes(), &dest, out).await?;
        }
        if ctx.get("tests_base").is_some() {
            let command = render(
                &mut registry,
                "cd {{tests_base}} && python setup.py install",
                host,
                ctx,
            )?;
            remote.run(&command, out).await?;
        }
        remote.close().await
    }
}

/// Copies result files from the master into the local workspace.
pub struct FetchArtifacts {
    connector: Arc<dyn Connector>,
    paths: Vec<String>,
}

impl FetchArtifacts {
    pub fn new(connector: Arc<dyn Connector>, paths: Vec<String>) -> Self {
        Self { connector, paths }
    }
}

#[async_trait]
impl Operation for FetchArtifacts {
    fn describe(&self) -> String {
        "fetch artifacts".to_string()
    }

    async fn run(&self, host: &HostTarget, ctx: &Context, out: &Transcript) -> Result<(), OpError> {
        let mut registry = template_registry();
        let workspace = ctx.get("workspace").unwrap_or(".").to_string();
        let remote = self.connector.connect(host).await?;
        for path in &self.paths {
            let path = render(&mut registry, path, host, ctx)?;
            let data = remote.fetch(&path, out).await?;
            let name = Path::new(&path).file_name().ok_or_else(|| {
                OpError::Internal(format!("artifact path '{}' has no file name", path))
            })?;
            let local = Path::new(&workspace).join(name);
            tokio::fs::write(&local, &data).await.map_err(|e| {
                OpError::Internal(format!("failed to write {}: {}", local.display(), e))
            })?;
            out.push(format!("saved {} to {}", path, local.display()));
        }
        remote.close().await
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>, OpError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| OpError::Internal(format!("failed to read {}: {}", path.display(), e)))
}

fn repo_file(tag: &str, url: &str) -> String {
    format!(
        "[{tag}]\nname={tag}\nbaseurl={url}\nenabled=1\ngpgcheck=0\nskip_if_unavailable=1\n",
        tag = tag,
        url = url
    )
}

/// One URL is used as is. Among several, the one carrying the configured
/// arch wins; none matching means no task repo is added.
fn pick_task_repo<'a>(urls: &[&'a str], arch: Option<&str>) -> Option<&'a str> {
    match urls {
        [] => None,
        [only] => Some(only),
        many => arch.and_then(|arch| many.iter().copied().find(|url| url.contains(arch))),
    }
}

/// Fills hostname1..N placeholders in the multihost config with the actual
/// node addresses, in host-input order.
fn substitute_nodes(mut content: String, nodes: Option<&str>) -> String {
    if let Some(nodes) = nodes {
        for (i, node) in nodes
            .split(',')
            .map(str::trim)
            .filter(|node| !node.is_empty())
            .enumerate()
        {
            content = content.replace(&format!("hostname{}", i + 1), node);
        }
    }
    content
}

/// Builds the ordered stage list for one run.
pub fn plan(conf: &ConfFile, connector: &Arc<dyn Connector>, scope: RunScope) -> Vec<StagePlan> {
    let mut stages = Vec::new();
    let full = scope == RunScope::Full;

    if full {
        if let (Some(private_key), Some(public_key)) =
            (&conf.ssh.private_key, &conf.ssh.public_key)
        {
            stages.push(StagePlan {
                name: "deploy ssh keys",
                op: Arc::new(DeployKeys::new(
                    Arc::clone(connector),
                    PathBuf::from(private_key),
                    PathBuf::from(public_key),
                )),
                targets: Targets::AllHosts,
                policy: Policy::AllMustSucceed,
            });
        }

        // yum-utils first so yum-config-manager exists for the repo stage.
        let mut templates = vec![
            "yum install -y --nogpgcheck yum-utils".to_string(),
            "echo gpgcheck=no >> /etc/yum.conf".to_string(),
        ];
        if !conf.packages.prereqs.is_empty() {
            templates.push("yum install -y --nogpgcheck {{prereqs}}".to_string());
        }
        stages.push(StagePlan {
            name: "install prerequisites",
            op: Arc::new(ShellOp::new(
                "install prerequisites",
                Arc::clone(connector),
                templates,
            )),
            targets: Targets::AllHosts,
            policy: Policy::AllMustSucceed,
        });
    }

    if full || scope == RunScope::ReposOnly {
        let extra: Vec<(String, String)> = sorted(conf.repos.extra.clone()).collect();
        stages.push(StagePlan {
            name: "configure repos",
            op: Arc::new(ConfigureRepos::new(Arc::clone(connector), extra)),
            targets: Targets::AllHosts,
            policy: Policy::AllMustSucceed,
        });
    }

    if full || scope == RunScope::TestsOnly {
        if conf.tests.repo_url.is_some() {
            stages.push(StagePlan {
                name: "install tests",
                op: Arc::new(InstallTests::new(
                    Arc::clone(connector),
                    conf.tests.config_file.as_ref().map(PathBuf::from),
                )),
                targets: Targets::AllHosts,
                policy: Policy::AllMustSucceed,
            });
        }
        if conf.tests.runner.is_some() || conf.tests.to_run.is_some() {
            let runner = conf
                .tests
                .runner
                .clone()
                .unwrap_or_else(|| DEFAULT_RUNNER.to_string());
            stages.push(StagePlan {
                name: "run tests",
                op: Arc::new(ShellOp::new("run tests", Arc::clone(connector), vec![runner])),
                targets: Targets::MasterOnly,
                policy: Policy::AllMustSucceed,
            });
        }
        if !conf.artifacts.is_empty() {
            stages.push(StagePlan {
                name: "fetch artifacts",
                op: Arc::new(FetchArtifacts::new(
                    Arc::clone(connector),
                    conf.artifacts.clone(),
                )),
                targets: Targets::MasterOnly,
                policy: Policy::BestEffort,
            });
        }
    }

    stages
}

/// Runs the stages strictly in order, one dispatch per stage. Stops at the
/// first failed AllMustSucceed stage and between stages when cancelled.
pub async fn run_pipeline(
    stages: Vec<StagePlan>,
    hosts: &[HostTarget],
    ctx: Arc<Context>,
    base: Dispatcher,
    best_effort: bool,
    cancelled: Arc<Mutex<bool>>,
) -> Result<(), NexusError> {
    if hosts.is_empty() {
        return Err(NexusError::InvalidConf("no hosts to run on".to_string()));
    }
    for stage in stages {
        if *cancelled.lock().await {
            eprintln!("[nexus] Ctrl-c detected. Not starting stage '{}'.", stage.name);
            return Err(NexusError::Cancelled);
        }
        let targets = match stage.targets {
            Targets::AllHosts => hosts,
            Targets::MasterOnly => &hosts[..1],
        };
        let policy = if best_effort {
            Policy::BestEffort
        } else {
            stage.policy
        };
        eprintln!(
            "[nexus] === stage '{}' on {} host(s) ===",
            stage.name,
            targets.len()
        );
        let dispatcher = base.policy(policy);
        match dispatcher
            .dispatch(targets, Arc::clone(&stage.op), Arc::clone(&ctx))
            .await
        {
            Ok(report) => {
                for (host, result) in report.iter() {
                    if let OperationResult::Failure { error, .. } = result {
                        eprintln!(
                            "[nexus] {} '{}' failed ({}): {}",
                            host,
                            stage.name,
                            error.kind(),
                            error
                        );
                    }
                }
                eprintln!("[nexus] === stage '{}' done ===", stage.name);
            }
            Err(failure) => {
                for (host, error) in failure.report.failed() {
                    eprintln!(
                        "[nexus] {} '{}' failed ({}): {}",
                        host,
                        stage.name,
                        error.kind(),
                        error
                    );
                }
                return Err(failure.into());
            }
        }
    }
    Ok(())
}

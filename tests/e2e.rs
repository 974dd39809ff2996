//! End-to-end tests for the staged pipeline.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use nexus_ci::{
    get_hosts, plan, run_pipeline, ConfFile, Connector, Context, Dispatcher, ErrorKind,
    HostTarget, NexusError, OpError, Remote, RunScope, Transcript,
};

/// Record of a command executed on a mock host.
#[derive(Debug, Clone)]
struct ExecutedCommand {
    host: String,
    command: String,
    timestamp: Instant,
}

/// Record of a file pushed to a mock host.
#[derive(Debug, Clone)]
struct PushedFile {
    host: String,
    dest: String,
    content: String,
}

/// Mock connector that records everything instead of talking to real hosts.
struct MockConnector {
    commands: Arc<Mutex<Vec<ExecutedCommand>>>,
    files: Arc<Mutex<Vec<PushedFile>>>,
    refuse: Vec<String>,
    fail_command_containing: Option<String>,
    fail_fetch: bool,
    delays: HashMap<String, u64>,
}

impl MockConnector {
    fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            files: Arc::new(Mutex::new(Vec::new())),
            refuse: Vec::new(),
            fail_command_containing: None,
            fail_fetch: false,
            delays: HashMap::new(),
        }
    }

    fn refuse(mut self, host: &str) -> Self {
        self.refuse.push(host.to_string());
        self
    }

    fn delay(mut self, host: &str, millis: u64) -> Self {
        self.delays.insert(host.to_string(), millis);
        self
    }

    fn fail_command(mut self, needle: &str) -> Self {
        self.fail_command_containing = Some(needle.to_string());
        self
    }

    fn fail_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    fn commands(&self) -> Arc<Mutex<Vec<ExecutedCommand>>> {
        Arc::clone(&self.commands)
    }

    fn files(&self) -> Arc<Mutex<Vec<PushedFile>>> {
        Arc::clone(&self.files)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &HostTarget) -> Result<Box<dyn Remote>, OpError> {
        if self.refuse.contains(&host.hostname) {
            return Err(OpError::Connection("connection refused".to_string()));
        }
        Ok(Box::new(MockRemote {
            host: host.hostname.clone(),
            commands: Arc::clone(&self.commands),
            files: Arc::clone(&self.files),
            fail_command_containing: self.fail_command_containing.clone(),
            fail_fetch: self.fail_fetch,
            delay_millis: self.delays.get(&host.hostname).copied().unwrap_or(0),
        }))
    }
}

struct MockRemote {
    host: String,
    commands: Arc<Mutex<Vec<ExecutedCommand>>>,
    files: Arc<Mutex<Vec<PushedFile>>>,
    fail_command_containing: Option<String>,
    fail_fetch: bool,
    delay_millis: u64,
}

#[async_trait]
impl Remote for MockRemote {
    async fn run(&self, command: &str, out: &Transcript) -> Result<(), OpError> {
        if self.delay_millis > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_millis)).await;
        }
        self.commands.lock().await.push(ExecutedCommand {
            host: self.host.clone(),
            command: command.to_string(),
            timestamp: Instant::now(),
        });
        if let Some(needle) = &self.fail_command_containing {
            if command.contains(needle) {
                return Err(OpError::RemoteCommand { code: 1 });
            }
        }
        out.push(format!("ran: {}", command));
        Ok(())
    }

    async fn push(&self, data: &[u8], dest: &str, out: &Transcript) -> Result<(), OpError> {
        self.files.lock().await.push(PushedFile {
            host: self.host.clone(),
            dest: dest.to_string(),
            content: String::from_utf8_lossy(data).into_owned(),
        });
        out.push(format!("pushed {} bytes to {}", data.len(), dest));
        Ok(())
    }

    async fn fetch(&self, path: &str, out: &Transcript) -> Result<Vec<u8>, OpError> {
        if self.fail_fetch {
            return Err(OpError::RemoteCommand { code: 1 });
        }
        out.push(format!("fetched {}", path));
        Ok(b"artifact-data".to_vec())
    }

    async fn close(self: Box<Self>) -> Result<(), OpError> {
        Ok(())
    }
}

fn parse_conf(yaml: &str) -> ConfFile {
    serde_yaml::from_str(yaml).unwrap()
}

fn two_hosts() -> Vec<HostTarget> {
    get_hosts(&[], Some("node1,node2"), Some("root")).unwrap()
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(Duration::from_secs(5))
}

fn not_cancelled() -> Arc<Mutex<bool>> {
    Arc::new(Mutex::new(false))
}

// =============================================================================
// Full pipeline
// =============================================================================

#[tokio::test]
async fn test_full_pipeline_reaches_every_host() {
    let mut private_key = NamedTempFile::new().unwrap();
    private_key.write_all(b"PRIVATE KEY").unwrap();
    let mut public_key = NamedTempFile::new().unwrap();
    public_key.write_all(b"PUBLIC KEY").unwrap();
    let mut tests_cfg = NamedTempFile::new().unwrap();
    tests_cfg
        .write_all(b"master: hostname1\nreplica: hostname2\n")
        .unwrap();
    let workspace = tempfile::tempdir().unwrap();

    let cfg_path = tests_cfg.path().to_str().unwrap().to_string();
    let conf = parse_conf(&format!(
        r#"
ssh:
  username: root
  private_key: {private_key}
  public_key: {public_key}
packages:
  prereqs: [restraint, staf]
tests:
  repo_url: https://git.example.com/suite.git
  base_dir: /root/suite
  config_file: {config_file}
  to_run: tests/
  junit_path: /root/junit.xml
artifacts:
  - /root/junit.xml
"#,
        private_key = private_key.path().display(),
        public_key = public_key.path().display(),
        config_file = cfg_path,
    ));

    let hosts = two_hosts();
    let mut ctx = Context::default();
    ctx.set("workspace", workspace.path().to_str().unwrap());
    ctx.set("existing_nodes", "node1,node2");
    ctx.set("prereqs", "restraint staf");
    ctx.set("tests_repo", "https://git.example.com/suite.git");
    ctx.set("tests_base", "/root/suite");
    ctx.set("tests_config", cfg_path.clone());
    ctx.set("tests_to_run", "tests/");
    ctx.set("junit_path", "/root/junit.xml");

    let connector = MockConnector::new();
    let commands = connector.commands();
    let files = connector.files();
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let stages = plan(&conf, &connector, RunScope::Full);
    run_pipeline(stages, &hosts, Arc::new(ctx), dispatcher(), false, not_cancelled())
        .await
        .unwrap();

    let commands = commands.lock().await;
    let ran = |host: &str, needle: &str| {
        commands
            .iter()
            .any(|c| c.host == host && c.command.contains(needle))
    };

    // Prerequisites, repos, and test install reach every host.
    for host in ["node1", "node2"] {
        assert!(ran(host, "yum install -y --nogpgcheck yum-utils"));
        assert!(ran(host, "yum install -y --nogpgcheck restraint staf"));
        assert!(ran(host, "git clone https://git.example.com/suite.git"));
        assert!(ran(host, "cd /root/suite && python setup.py install"));
    }

    // Test execution hits the master only.
    assert!(ran(
        "node1",
        "py.test --junit-xml=/root/junit.xml --multihost-config"
    ));
    assert!(!ran("node2", "py.test"));

    // Keys were pushed to both hosts; the multihost config got the real
    // node addresses substituted in.
    let files = files.lock().await;
    for host in ["node1", "node2"] {
        assert!(files
            .iter()
            .any(|f| f.host == host && f.dest == "/root/.ssh/id_rsa" && f.content == "PRIVATE KEY"));
    }
    let pushed_cfg = files
        .iter()
        .find(|f| f.dest == cfg_path && f.host == "node1")
        .unwrap();
    assert_eq!(pushed_cfg.content, "master: node1\nreplica: node2\n");

    // The artifact landed in the workspace.
    let artifact = workspace.path().join("junit.xml");
    assert_eq!(std::fs::read(&artifact).unwrap(), b"artifact-data");
}

// =============================================================================
// Staging barrier
// =============================================================================

#[tokio::test]
async fn test_stage_completes_on_all_hosts_before_next_starts() {
    let conf = parse_conf("packages:\n  prereqs: [restraint]\n");

    let hosts = two_hosts();
    let mut ctx = Context::default();
    ctx.set("prereqs", "restraint");
    ctx.set("static_repo_urls", "http://repo.example.com/static");

    // node1 is slow; node2's repo setup must still wait for it.
    let connector = MockConnector::new().delay("node1", 50);
    let commands = connector.commands();
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let stages = plan(&conf, &connector, RunScope::Full);
    run_pipeline(stages, &hosts, Arc::new(ctx), dispatcher(), false, not_cancelled())
        .await
        .unwrap();

    let commands = commands.lock().await;
    let last_prereq = commands
        .iter()
        .filter(|c| c.command.contains("yum install"))
        .map(|c| c.timestamp)
        .max()
        .unwrap();
    let first_repo = commands
        .iter()
        .filter(|c| c.command.contains("yum-config-manager"))
        .map(|c| c.timestamp)
        .min()
        .unwrap();
    assert!(last_prereq < first_repo);
}

// =============================================================================
// Failure behavior
// =============================================================================

#[tokio::test]
async fn test_failed_stage_halts_the_pipeline() {
    let conf = parse_conf("packages:\n  prereqs: [restraint]\n");

    let hosts = two_hosts();
    let mut ctx = Context::default();
    ctx.set("prereqs", "restraint");
    ctx.set("static_repo_urls", "http://repo.example.com/static");

    let connector = MockConnector::new().refuse("node2");
    let commands = connector.commands();
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let stages = plan(&conf, &connector, RunScope::Full);
    let result = run_pipeline(
        stages,
        &hosts,
        Arc::new(ctx),
        dispatcher(),
        false,
        not_cancelled(),
    )
    .await;

    match result {
        Err(NexusError::Stage(failure)) => {
            assert_eq!(failure.stage, "install prerequisites");
            let failed = failure.report.failed();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0.hostname, "node2");
            assert_eq!(failed[0].1.kind(), ErrorKind::Connection);
        }
        other => panic!("expected a stage failure, got {:?}", other),
    }

    // The repo stage never started.
    let commands = commands.lock().await;
    assert!(!commands.iter().any(|c| c.command.contains("yum-config-manager")));
    // The healthy host still ran its prerequisites.
    assert!(commands
        .iter()
        .any(|c| c.host == "node1" && c.command.contains("yum install")));
}

#[tokio::test]
async fn test_best_effort_flag_keeps_the_pipeline_going() {
    let conf = parse_conf("packages:\n  prereqs: [restraint]\n");

    let hosts = two_hosts();
    let mut ctx = Context::default();
    ctx.set("prereqs", "restraint");
    ctx.set("static_repo_urls", "http://repo.example.com/static");

    let connector = MockConnector::new().refuse("node2");
    let commands = connector.commands();
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let stages = plan(&conf, &connector, RunScope::Full);
    run_pipeline(stages, &hosts, Arc::new(ctx), dispatcher(), true, not_cancelled())
        .await
        .unwrap();

    // Later stages still ran on the healthy host.
    let commands = commands.lock().await;
    assert!(commands
        .iter()
        .any(|c| c.host == "node1" && c.command.contains("yum-config-manager")));
}

#[tokio::test]
async fn test_failing_test_run_is_a_remote_command_failure() {
    let conf = parse_conf("tests:\n  to_run: tests/\n");

    let hosts = two_hosts();
    let connector = MockConnector::new().fail_command("py.test");
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let stages = plan(&conf, &connector, RunScope::TestsOnly);
    let result = run_pipeline(
        stages,
        &hosts,
        Arc::new(Context::default()),
        dispatcher(),
        false,
        not_cancelled(),
    )
    .await;

    match result {
        Err(NexusError::Stage(failure)) => {
            assert_eq!(failure.stage, "run tests");
            assert_eq!(failure.report.len(), 1);
            assert_eq!(
                failure.report.failed()[0].1.kind(),
                ErrorKind::RemoteCommand
            );
        }
        other => panic!("expected a stage failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_artifact_fetch_is_best_effort() {
    let conf = parse_conf("artifacts:\n  - /root/junit.xml\n");

    let hosts = two_hosts();
    let connector = MockConnector::new().fail_fetch();
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let stages = plan(&conf, &connector, RunScope::TestsOnly);
    run_pipeline(
        stages,
        &hosts,
        Arc::new(Context::default()),
        dispatcher(),
        false,
        not_cancelled(),
    )
    .await
    .unwrap();
}

// =============================================================================
// Targeting and cancellation
// =============================================================================

#[tokio::test]
async fn test_master_only_stage_skips_other_hosts() {
    let conf = parse_conf("tests:\n  to_run: tests/\n");

    let hosts = two_hosts();
    let connector = MockConnector::new();
    let commands = connector.commands();
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let stages = plan(&conf, &connector, RunScope::TestsOnly);
    run_pipeline(
        stages,
        &hosts,
        Arc::new(Context::default()),
        dispatcher(),
        false,
        not_cancelled(),
    )
    .await
    .unwrap();

    let commands = commands.lock().await;
    assert!(commands.iter().all(|c| c.host == "node1"));
}

#[tokio::test]
async fn test_cancellation_stops_before_the_next_stage() {
    let conf = parse_conf("packages:\n  prereqs: [restraint]\n");

    let hosts = two_hosts();
    let connector = MockConnector::new();
    let commands = connector.commands();
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let stages = plan(&conf, &connector, RunScope::Full);
    let result = run_pipeline(
        stages,
        &hosts,
        Arc::new(Context::default()),
        dispatcher(),
        false,
        Arc::new(Mutex::new(true)),
    )
    .await;

    assert!(matches!(result, Err(NexusError::Cancelled)));
    assert!(commands.lock().await.is_empty());
}

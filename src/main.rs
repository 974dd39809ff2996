use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;

use nexus_ci::config::{self, Command, Config};
use nexus_ci::executor::Dispatcher;
use nexus_ci::host::get_hosts;
use nexus_ci::session::{Connector, SshConnector};
use nexus_ci::stages::{plan, run_pipeline, RunScope};
use nexus_ci::NexusError;

#[tokio::main]
async fn main() {
    let cli = Config::parse();
    if let Err(e) = run(cli).await {
        eprintln!("[nexus] {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Config) -> Result<(), NexusError> {
    let conf = config::load_conf(&cli.conf)?;
    let mut ctx = config::setup_context(&conf);

    let existing_nodes = ctx.get("existing_nodes").map(str::to_string);
    let hosts = get_hosts(
        &conf.hosts,
        existing_nodes.as_deref(),
        conf.ssh.username.as_deref(),
    )?;

    // Record the resolved node list so templates and the multihost config
    // substitution see the same hosts in the same order.
    let nodes = hosts
        .iter()
        .map(|host| host.hostname.clone())
        .collect::<Vec<_>>()
        .join(",");
    ctx.set("existing_nodes", nodes);
    ctx.set("master", hosts[0].hostname.clone());
    let ctx = Arc::new(ctx);

    let connector: Arc<dyn Connector> = Arc::new(SshConnector::new(&hosts));

    if cli.command == Command::Check {
        let stages = plan(&conf, &connector, RunScope::Full);
        eprintln!("[nexus] Configuration OK. {} stage(s) planned:", stages.len());
        for stage in &stages {
            eprintln!("[nexus]   {}", stage.name);
        }
        return Ok(());
    }

    let scope = match cli.command {
        Command::Run => RunScope::Full,
        Command::Repos => RunScope::ReposOnly,
        Command::Tests => RunScope::TestsOnly,
        Command::Check => unreachable!(),
    };
    let stages = plan(&conf, &connector, scope);
    if stages.is_empty() {
        return Err(NexusError::InvalidConf(
            "the configuration produces no stages for this command".to_string(),
        ));
    }

    // Ctrl-c stops the pipeline between stages; the running stage finishes
    // or times out first.
    let cancelled = Arc::new(Mutex::new(false));
    {
        let cancelled = Arc::clone(&cancelled);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("[nexus] Ctrl-c detected. Finishing the current stage before stopping.");
                *cancelled.lock().await = true;
            }
        });
    }

    let dispatcher = Dispatcher::new(Duration::from_secs(cli.timeout_secs))
        .max_concurrent(cli.max_concurrent);
    run_pipeline(stages, &hosts, ctx, dispatcher, cli.best_effort, cancelled).await
}

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::lib::{
    cluster::local::{LocalMembership, LocalVolumeService},
    config::{Cli, Command, Options},
    middleware::{
        credentials::{CREDENTIALS_MIDDLEWARE, CredentialInjector},
        options::{OPTIONS_MIDDLEWARE, OptionInjector},
        volumes::{VOLUMES_MIDDLEWARE, VolumeProvisioner},
    },
    process::{supervisor::CommandSupervisor, types::ProcessTracker},
    scheduler::types::Scheduler,
    store::{memory::MemoryStore, types::RecordStore},
    tasks::{docker::DockerEngine, executor::run_executor, types::Engine},
    worker::types::{AgentServer, StartArgument, Worker, WorkerConfig},
};

mod lib {
    pub mod cluster;
    pub mod config;
    pub mod middleware;
    pub mod process;
    pub mod reconciler;
    pub mod scheduler;
    pub mod store;
    pub mod tasks;
    pub mod worker;

    #[cfg(test)]
    pub mod testing;
}

async fn serve(options: Options) -> Result<(), Box<dyn Error>> {
    let node_id = options.node_id();
    info!("Starting corral agent on node {}", node_id);

    let engine = Arc::new(DockerEngine::connect()?);
    let records = RecordStore::new(Arc::new(MemoryStore::new()), &options.record_prefix);
    let membership = Arc::new(LocalMembership::new(&node_id));
    let volumes = Arc::new(LocalVolumeService::new(&options.volume_base_path));
    let tracker = ProcessTracker::new();

    // nothing else listens on a single node
    let mut events = membership.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("Cluster event {}: {}", event.event, event.data),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} cluster events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let executable = std::env::current_exe()?;
    let worker = Worker::new(
        engine.clone(),
        records.clone(),
        membership.clone(),
        Arc::new(CommandSupervisor),
        tracker.clone(),
        WorkerConfig {
            base_log_dir: options.base_log_dir.clone(),
            executable,
            executable_args: vec!["executor".to_string(), engine.name().to_string()],
            reconcile_delay: options.reconcile_delay(),
        },
    );

    let mut scheduler = Scheduler::new(records.clone(), tracker);
    scheduler.add_worker(worker);

    scheduler.add_pre_start_middleware(
        engine.name(),
        OPTIONS_MIDDLEWARE,
        Arc::new(OptionInjector::new(&options, records.clone())?),
    );
    scheduler.add_pre_start_middleware(
        engine.name(),
        VOLUMES_MIDDLEWARE,
        Arc::new(VolumeProvisioner::new(volumes, records, membership)),
    );
    if let Some(auth) = options.registry_auth() {
        scheduler.add_pre_pull_middleware(
            engine.name(),
            CREDENTIALS_MIDDLEWARE,
            Arc::new(CredentialInjector::new(auth)),
        );
    }
    for (key, value) in &options.start_args {
        scheduler.set_start_argument(engine.name(), key, StartArgument::template(value));
    }
    info!("Managing engines: {}", scheduler.engines().join(", "));

    let scheduler = Arc::new(scheduler);
    scheduler.initialize().await;

    AgentServer::new(scheduler, &options.listen_address, options.api_port)
        .start_server()
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.options).await,
        Command::Executor { engine, args } => match run_executor(&engine, &args).await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                error!("Executor failed: {}", e);
                std::process::exit(1);
            }
        },
    }
}

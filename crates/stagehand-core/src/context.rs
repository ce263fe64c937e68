use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::exec::{CommandExecutor, RemoteExecutor};
use crate::job::Job;
use crate::store::{InMemoryStore, Store};
use crate::telemetry::{AlertRegistry, GrafanaClient, TelemetryClients};
use crate::vexec::VirtualExecutor;
use crate::workflow::Workflow;
use std::sync::Arc;
use tokio::sync::watch;

/// Everything a reconcile pass needs, built once per orchestrator instance.
pub struct Context {
    pub config: OrchestratorConfig,
    pub jobs: Arc<dyn Store<Job>>,
    pub workflows: Arc<dyn Store<Workflow>>,
    pub telemetry: TelemetryClients,
    pub executor: Arc<dyn RemoteExecutor>,
    pub vexec: VirtualExecutor,
    shutdown: watch::Receiver<bool>,
}

impl Context {
    pub fn new(
        config: OrchestratorConfig,
        jobs: Arc<dyn Store<Job>>,
        workflows: Arc<dyn Store<Workflow>>,
        telemetry: TelemetryClients,
        executor: Arc<dyn RemoteExecutor>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let vexec = VirtualExecutor::new(jobs.clone(), &config.virtual_exec);
        Self {
            config,
            jobs,
            workflows,
            telemetry,
            executor,
            vexec,
            shutdown,
        }
    }

    /// In-memory stores, the configured Grafana client (if any) and the
    /// configured command executor.
    pub fn in_memory(config: OrchestratorConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let grafana = GrafanaClient::from_config(&config.telemetry)?
            .map(|client| Arc::new(client) as Arc<dyn AlertRegistry>);
        let executor = Arc::new(CommandExecutor::new(config.exec.program.clone()));
        Ok(Self::new(
            config,
            InMemoryStore::<Job>::new_arc(),
            InMemoryStore::<Workflow>::new_arc(),
            TelemetryClients::new(grafana),
            executor,
            shutdown,
        ))
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::Runner;
use crate::api::JobService;
use crate::config::{NodeConfig, StoreBackend};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::membership::{LeaderElector, Membership};
use crate::rpc::server::{router, HttpServer, InternalState};
use crate::rpc::{AgentTransport, HttpTransport};
use crate::scheduler::{JobTrigger, Scheduler, SchedulerHandle};
use crate::store::{JobStore, MemoryStore, RemoteStore, Store};

/// How long shutdown waits for background loops to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Main node that wires all components together.
pub struct Node {
    pub config: NodeConfig,
    pub store: JobStore,
    pub membership: Arc<Membership>,
    pub elector: Arc<LeaderElector>,
    pub dispatcher: Arc<Dispatcher>,
    pub runner: Arc<Runner>,
    pub scheduler: SchedulerHandle,
    pub service: Arc<JobService>,
    hosted_store: Option<Arc<MemoryStore>>,
    scheduler_task: Scheduler,
}

impl Node {
    /// Build a node with the store selected by `config.store`.
    pub fn new(config: NodeConfig) -> Result<Self> {
        match &config.store {
            StoreBackend::Embedded => {
                let memory = Arc::new(MemoryStore::new());
                let hosted = config.serve_store.then(|| memory.clone());
                Self::with_store(config, memory, hosted)
            }
            StoreBackend::Remote { url } => {
                let remote = RemoteStore::new(url, Duration::from_millis(config.dispatch.timeout_ms))?;
                Self::with_store(config, Arc::new(remote), None)
            }
        }
    }

    /// Build a node over an existing store. `hosted` is served to peers.
    pub fn with_store(
        config: NodeConfig,
        store: Arc<dyn Store>,
        hosted: Option<Arc<MemoryStore>>,
    ) -> Result<Self> {
        let transport: Arc<dyn AgentTransport> =
            Arc::new(HttpTransport::new(config.dispatch.timeout())?);
        Self::with_parts(config, store, hosted, transport)
    }

    pub fn with_parts(
        config: NodeConfig,
        store: Arc<dyn Store>,
        hosted: Option<Arc<MemoryStore>>,
        transport: Arc<dyn AgentTransport>,
    ) -> Result<Self> {
        let addr = config.advertised();
        let store = JobStore::new(store);

        let membership = Arc::new(Membership::new(
            &config.node_name,
            &addr,
            config.tags.clone(),
            config.gossip.clone(),
        )?);
        let elector = Arc::new(LeaderElector::new(
            &config.node_name,
            &addr,
            store.clone(),
            membership.clone(),
            config.lease.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            &config.node_name,
            &addr,
            store.clone(),
            membership.clone(),
            transport.clone(),
            elector.subscribe_term(),
            config.dispatch.clone(),
            config.runner.deadline_policy,
        ));
        let runner = Arc::new(Runner::new(
            &config.node_name,
            store.clone(),
            transport.clone(),
            config.runner.clone(),
            config.retention.clone(),
        )?);

        let trigger: Arc<dyn JobTrigger> = dispatcher.clone();
        let (scheduler_task, scheduler) = Scheduler::new(
            store.clone(),
            trigger,
            config.scheduler.clone(),
            elector.subscribe(),
        );

        let service = Arc::new(JobService::new(
            &config.node_name,
            &addr,
            store.clone(),
            membership.clone(),
            elector.clone(),
            dispatcher.clone(),
            scheduler.clone(),
            transport,
            config.dispatch.timeout() * 2,
        )?);

        Ok(Self {
            config,
            store,
            membership,
            elector,
            dispatcher,
            runner,
            scheduler,
            service,
            hosted_store: hosted,
            scheduler_task,
        })
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Binds the HTTP server (internal endpoints, API, hosted store)
    /// 2. Starts gossip and joins the seeds
    /// 3. Starts the leader elector, scheduler and dispatcher loops
    /// 4. Serves HTTP until shutdown
    /// 5. On shutdown releases leadership and announces departure
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind or fails while serving.
    /// Background loops log their own errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let app = router(
            InternalState {
                runner: self.runner.clone(),
                dispatcher: self.dispatcher.clone(),
                membership: self.membership.clone(),
                scheduler: self.scheduler.clone(),
            },
            self.service.clone(),
            self.hosted_store.clone(),
        );
        let server = HttpServer::bind(self.config.bind_addr, app).await?;

        tracing::info!(
            node = %self.config.node_name,
            addr = %self.config.advertised(),
            tags = ?self.config.tags,
            "Starting node"
        );

        let loops = shutdown.child_token();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(self.membership.clone().run(loops.clone())));
        if let Err(e) = self.membership.join(&self.config.seeds).await {
            // Gossip keeps retrying the seeds while the view is empty.
            tracing::warn!(error = %e, "Initial join failed");
        }

        tasks.push(tokio::spawn(self.elector.clone().run(loops.clone())));
        tasks.push(tokio::spawn(self.scheduler_task.run(loops.clone())));
        tasks.push(tokio::spawn(self.dispatcher.clone().run(loops.clone())));

        let served = server.run(shutdown.clone()).await;

        // Make sure every loop stops even if the server ended on its own.
        loops.cancel();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }
        self.membership.leave().await;
        tracing::info!(node = %self.config.node_name, "Node stopped");
        served
    }
}

//! Application state wiring all engine services together.
//!
//! Services are generic over repository/provider traits; `AppState` pins
//! them to the concrete infra implementations (SQLite stores, Anthropic
//! provider) and owns the process-wide singletons: the registry, the
//! monitor, and the event bus.

use std::path::PathBuf;
use std::sync::Arc;

use secrecy::SecretString;

use studio_core::approval::service::{ApprovalService, LogNotificationSink};
use studio_core::event::bus::EventBus;
use studio_core::llm::provider::BoxLlmProvider;
use studio_core::llm::session::SessionLlm;
use studio_core::workflow::checkpoint::CheckpointManager;
use studio_core::workflow::executor::WorkflowExecutor;
use studio_core::workflow::monitor::{ResumeFn, WorkflowMonitor};
use studio_core::workflow::operator::LlmOperator;
use studio_core::workflow::orchestrator::WorkflowOrchestrator;
use studio_core::workflow::registry::WorkflowRegistry;
use studio_core::workflow::step_runner::ExecutorRegistry;
use studio_infra::config::load_engine_config;
use studio_infra::llm::anthropic::AnthropicProvider;
use studio_infra::resolve_data_dir;
use studio_infra::sqlite::agent::SqliteAgentDirectory;
use studio_infra::sqlite::approval::SqliteApprovalStore;
use studio_infra::sqlite::pool::DatabasePool;
use studio_infra::sqlite::workflow::SqliteStateStore;
use studio_types::config::EngineConfig;
use studio_types::workflow::ThreadStatus;

/// Concrete orchestrator type pinned to the SQLite adapters.
pub type Orchestrator = WorkflowOrchestrator<SqliteStateStore, SqliteAgentDirectory>;
pub type Monitor = WorkflowMonitor<SqliteStateStore>;
pub type Registry = WorkflowRegistry<SqliteStateStore>;
pub type Approvals = ApprovalService<SqliteApprovalStore>;

/// Shared application state used by the HTTP handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub approvals: Arc<Approvals>,
    pub registry: Arc<Registry>,
    pub monitor: Arc<Monitor>,
    pub agents: Arc<SqliteAgentDirectory>,
    pub events: EventBus,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: connect to the database, load the
    /// config, wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;

        let db_url = format!("sqlite://{}?mode=rwc", data_dir.join("studio.db").display());
        let pool = DatabasePool::new(&db_url).await?;

        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            anyhow::anyhow!("ANTHROPIC_API_KEY is not set; export it before starting studio")
        })?;
        let provider = Arc::new(BoxLlmProvider::new(AnthropicProvider::new(SecretString::from(
            api_key,
        ))));

        Self::wire(pool, provider, config, data_dir)
    }

    /// Wire the engine from an existing pool and provider (tests use this
    /// with a temp database and a mock provider).
    pub fn wire(
        pool: DatabasePool,
        provider: Arc<BoxLlmProvider>,
        config: EngineConfig,
        data_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new(4096);

        let state_store = Arc::new(SqliteStateStore::new(pool.clone()));
        let approvals = Arc::new(ApprovalService::new(
            SqliteApprovalStore::new(pool.clone()),
            events.clone(),
            Arc::new(LogNotificationSink),
        ));
        let agents = Arc::new(SqliteAgentDirectory::new(pool));

        let llm = Arc::new(SessionLlm::new(Arc::clone(&provider)));
        let operator = Arc::new(LlmOperator::new(provider, config.operator.clone()));

        let executor_registry = ExecutorRegistry::standard(
            llm,
            operator,
            approvals.clone(),
            events.clone(),
            config.clone(),
        );
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(CheckpointManager::new(Arc::clone(&state_store))),
            executor_registry,
            events.clone(),
            config.clone(),
        ));

        let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&state_store)));
        let monitor = Arc::new(WorkflowMonitor::new(
            Arc::clone(&state_store),
            Arc::clone(&registry),
            config.clone(),
        ));

        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            executor,
            Arc::clone(&registry),
            Arc::clone(&agents),
            events.clone(),
        ));

        Ok(Self {
            orchestrator,
            approvals,
            registry,
            monitor,
            agents,
            events,
            config,
            data_dir,
        })
    }

    /// Launch the background tasks: the approval listener, the heartbeat
    /// monitor, the approval expiry sweep, and startup crash recovery.
    pub fn spawn_background_tasks(&self) {
        self.orchestrator.spawn_approval_listener();

        let resume: ResumeFn = {
            let orchestrator = Arc::clone(&self.orchestrator);
            Arc::new(move |thread_id: String| {
                let orchestrator = Arc::clone(&orchestrator);
                Box::pin(async move {
                    match orchestrator.resume(&thread_id).await {
                        Ok(_) => true,
                        Err(e) => {
                            tracing::warn!(
                                thread_id = thread_id.as_str(),
                                error = %e,
                                "monitor resume failed"
                            );
                            false
                        }
                    }
                })
            })
        };
        Arc::clone(&self.monitor).run(resume);

        // Approval expiry sweep: same cadence as the monitor scan.
        let approvals = Arc::clone(&self.approvals);
        let sweep_secs = self.config.monitor_scan_secs.max(1);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(sweep_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = approvals.process_expired().await {
                    tracing::warn!(error = %e, "approval expiry sweep failed");
                }
            }
        });

        // Crash recovery: re-invoke threads persisted as running.
        let orchestrator = Arc::clone(&self.orchestrator);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let filter = studio_core::repository::workflow::ThreadFilter {
                project_id: None,
                status: Some(ThreadStatus::Running),
            };
            let threads = match registry.list(&filter).await {
                Ok(threads) => threads,
                Err(e) => {
                    tracing::warn!(error = %e, "crash recovery listing failed");
                    return;
                }
            };
            for summary in threads {
                tracing::info!(
                    thread_id = summary.thread_id.as_str(),
                    "recovering thread left running by a previous process"
                );
                if let Err(e) = orchestrator.resume(&summary.thread_id).await {
                    tracing::warn!(
                        thread_id = summary.thread_id.as_str(),
                        error = %e,
                        "crash recovery failed"
                    );
                }
            }
        });
    }
}

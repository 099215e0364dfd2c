//! Engine context wiring the executor and recovery services together.
//!
//! `EngineContext` is built once at process start. It holds the concrete
//! SQLite-backed repositories, the loaded configuration and the shared event
//! bus. Services in `stepwise-core` are generic over repository traits;
//! the aliases below pin them to the SQLite implementations.

use std::path::PathBuf;

use stepwise_core::event::EventBus;
use stepwise_core::recovery::RecoveryOrchestrator;
use stepwise_core::submit::{BoxJobSubmitter, InProcessSubmitter};
use stepwise_core::workflow::trace::StepTracer;
use stepwise_core::workflow::{WorkflowExecutor, WorkflowGraph};
use stepwise_types::config::EngineConfig;
use stepwise_types::recovery::RecoveryResults;

use crate::config::{load_engine_config, resolve_data_dir};
use crate::sqlite::artifacts::SqliteArtifactRepository;
use crate::sqlite::pool::{database_url, DatabasePool};
use crate::sqlite::registry::SqliteTaskRegistry;

pub type EngineSubmitter = InProcessSubmitter<SqliteTaskRegistry, SqliteTaskRegistry>;

pub type EngineOrchestrator =
    RecoveryOrchestrator<SqliteTaskRegistry, SqliteTaskRegistry, SqliteArtifactRepository>;

/// Process-wide engine dependencies.
#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
    pub registry: SqliteTaskRegistry,
    pub artifacts: SqliteArtifactRepository,
    pub events: EventBus,
    pub tracer: StepTracer,
}

impl EngineContext {
    /// Initialize from the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::init_in(resolve_data_dir()).await
    }

    /// Initialize in `data_dir`: load config, open the database, run migrations.
    pub async fn init_in(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        tracing::info!(data_dir = %data_dir.display(), "engine context initialized");
        Ok(Self {
            events: EventBus::new(config.executor.event_bus_capacity),
            registry: SqliteTaskRegistry::new(db_pool.clone()),
            artifacts: SqliteArtifactRepository::new(db_pool.clone()),
            tracer: StepTracer::new(),
            config,
            data_dir,
            db_pool,
        })
    }

    /// Replace the step tracer used by executors built afterwards.
    pub fn with_tracer(mut self, tracer: StepTracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Executor for `graph` with the configured timeout, tracer and event bus.
    pub fn executor(&self, graph: WorkflowGraph) -> WorkflowExecutor {
        WorkflowExecutor::new(graph)
            .with_config(&self.config.executor)
            .with_tracer(self.tracer.clone())
            .with_event_bus(self.events.clone())
    }

    /// In-process submitter persisting to the SQLite registry.
    pub fn submitter(&self, executors: impl IntoIterator<Item = WorkflowExecutor>) -> EngineSubmitter {
        executors.into_iter().fold(
            InProcessSubmitter::new(self.registry.clone(), self.registry.clone()),
            InProcessSubmitter::register,
        )
    }

    pub fn recovery_orchestrator(&self, submitter: BoxJobSubmitter) -> EngineOrchestrator {
        RecoveryOrchestrator::new(
            self.registry.clone(),
            self.registry.clone(),
            self.artifacts.clone(),
            submitter,
            self.config.recovery.clone(),
        )
        .with_event_bus(self.events.clone())
    }

    /// Run the startup recovery pass once.
    ///
    /// Running entries whose heartbeat expired are flagged `stale` first so
    /// the registry reflects what the pass found even if it aborts.
    pub async fn recover_on_startup(&self, submitter: BoxJobSubmitter) -> RecoveryResults {
        match self.registry.mark_stale(self.config.recovery.stale_after()).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "flagged expired tasks as stale"),
            Err(e) => tracing::warn!(error = %e, "could not flag stale tasks"),
        }
        self.recovery_orchestrator(submitter).run_startup_recovery().await
    }
}

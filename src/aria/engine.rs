//! The composed process-wide runtime.
//!
//! One [`Engine`] per process: database pool, gateway, tool broker, router,
//! agent pool, protection, chat engine, streaming manager, coordination
//! protocols and scheduler, built in dependency order at startup and torn
//! down in reverse. There are no hidden globals beyond the shared HTTP
//! client and the compiled regex sets.

use std::sync::Arc;

use log::info;

use crate::aria::agent_pool::AgentPool;
use crate::aria::catalog::ModelCatalog;
use crate::aria::chat_engine::ChatEngine;
use crate::aria::config::EngineConfig;
use crate::aria::error::EngineError;
use crate::aria::gateway::{HttpBackend, LlmBackend, LlmGateway};
use crate::aria::protection::SessionProtection;
use crate::aria::roundtable::Roundtable;
use crate::aria::router::Router;
use crate::aria::scheduler::Scheduler;
use crate::aria::store::SessionStore;
use crate::aria::streaming::StreamingManager;
use crate::aria::swarm::Swarm;
use crate::aria::tools::{SkillRegistry, ToolBroker};

pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<SessionStore>,
    pub gateway: Arc<LlmGateway>,
    pub broker: Arc<ToolBroker>,
    pub router: Arc<Router>,
    pub pool: Arc<AgentPool>,
    pub protection: Arc<SessionProtection>,
    pub chat: Arc<ChatEngine>,
    pub streaming: Arc<StreamingManager>,
    pub roundtable: Arc<Roundtable>,
    pub swarm: Arc<Swarm>,
    pub scheduler: Arc<Scheduler>,
}

impl Engine {
    /// Build and start the runtime against the default HTTP gateway
    /// backend.
    pub async fn start(
        config: EngineConfig,
        skills: Arc<dyn SkillRegistry>,
    ) -> Result<Self, EngineError> {
        let backend = Arc::new(HttpBackend::new(
            config.litellm_base_url.clone(),
            config.litellm_master_key.clone(),
        ));
        Self::start_with_backend(config, backend, skills).await
    }

    /// Build and start the runtime with a custom gateway backend. Tests use
    /// this to substitute deterministic mock LLMs.
    pub async fn start_with_backend(
        config: EngineConfig,
        backend: Arc<dyn LlmBackend>,
        skills: Arc<dyn SkillRegistry>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(
            SessionStore::connect(&config.database_url)
                .await?
                .with_recall_cutoff(config.recall_similarity_cutoff),
        );

        let catalog = match &config.model_catalog_path {
            Some(path) => ModelCatalog::load(path)?,
            None => ModelCatalog::empty(),
        };
        let gateway = Arc::new(LlmGateway::new(backend, catalog));
        let broker = Arc::new(ToolBroker::new(skills));
        let router = Arc::new(Router::new(Arc::clone(&store)));
        let pool = Arc::new(AgentPool::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            config.pool_capacity,
            config.agent_context_limit,
        ));
        pool.load_all().await?;

        let protection = Arc::new(SessionProtection::new());
        let chat = Arc::new(ChatEngine::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&broker),
            Arc::clone(&router),
            Arc::clone(&protection),
            config.clone(),
        ));
        let streaming = Arc::new(StreamingManager::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&broker),
            Arc::clone(&chat),
            Arc::clone(&protection),
            config.ping_interval,
        ));
        let roundtable = Arc::new(Roundtable::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&router),
        ));
        let swarm = Arc::new(Swarm::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&router),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&broker),
            Arc::clone(&chat),
            Arc::clone(&gateway),
            config.max_concurrent_jobs,
        );
        scheduler.start().await?;

        info!("engine started");
        Ok(Self {
            config,
            store,
            gateway,
            broker,
            router,
            pool,
            protection,
            chat,
            streaming,
            roundtable,
            swarm,
            scheduler,
        })
    }

    /// Tear down in reverse dependency order. Message persistence has no
    /// in-flight buffering, so this only needs to stop the active loops.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.store.pool().close().await;
        info!("engine stopped");
    }

    /// Run the periodic store maintenance pass: ghost purge.
    pub async fn maintain(&self) -> Result<u64, EngineError> {
        self.store
            .purge_ghost_sessions(self.config.ghost_session_age)
            .await
    }
}

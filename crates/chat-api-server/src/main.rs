use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use chat_api_server::cache::{CacheStore, MemoryCache, RedisCache};
use chat_api_server::config::{Settings, StorageBackend};
use chat_api_server::database::{DbPool, DurableStore, InMemoryStore, Repository};
use chat_api_server::logging::init_logging;
use chat_api_server::routes::build_router;
use chat_api_server::services::conversation::CachePolicy;
use chat_api_server::services::llm::{build_providers, RouterConfig};
use chat_api_server::services::{
    ChatAgent, ChatOrchestrator, ConversationStore, MemoryGateway, ProviderRouter,
};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;
    let _log_guard = init_logging(&settings.logging)?;

    info!("🚀 Starting Chat API Server...");
    info!("✅ Configuration loaded");

    // Durable tier
    let (durable, db_pool): (Arc<dyn DurableStore>, Option<DbPool>) = match settings.storage.backend {
        StorageBackend::Postgres => {
            let db_pool = DbPool::connect(&settings.database).await?;
            info!("✅ Database connection established");
            (Arc::new(Repository::new(db_pool.clone())), Some(db_pool))
        }
        StorageBackend::Memory => {
            warn!("Using in-process conversation storage, data is lost on restart");
            (Arc::new(InMemoryStore::new()), None)
        }
    };

    // Cache tier
    let cache: Arc<dyn CacheStore> = if settings.redis.url.trim().is_empty() {
        let cache = MemoryCache::new();
        spawn_cache_sweeper(cache.clone());
        Arc::new(cache)
    } else {
        let redis = RedisCache::new(&settings.redis)?;
        match redis.ping().await {
            Ok(()) => info!("✅ Redis connection established"),
            Err(e) => warn!("Redis not reachable yet, cache reads will fall through: {}", e),
        }
        Arc::new(redis)
    };

    let store = Arc::new(ConversationStore::new(
        durable,
        cache,
        CachePolicy::from_settings(&settings.redis),
    ));

    // LLM providers
    let providers = build_providers(&settings.llm)?;
    let router = Arc::new(ProviderRouter::new(providers, RouterConfig::from_settings(&settings.llm)));
    if router.active_providers().is_empty() {
        warn!("⚠️ No LLM provider is enabled, chat requests will fail");
    }

    // Memory service
    let memory = MemoryGateway::from_settings(&settings.memory)?.map(Arc::new);
    if let Some(memory) = &memory {
        let memory = Arc::clone(memory);
        tokio::spawn(async move { memory.ensure_context_template().await });
        info!("✅ Memory service enabled");
    }

    let agent = Arc::new(ChatAgent::new(router.clone(), settings.chat.assistant_system_prompt.clone()));
    let orchestrator = Arc::new(ChatOrchestrator::new(
        store,
        agent,
        memory,
        settings.chat.clone(),
    ));

    // Build router
    let app = build_router(orchestrator, router, db_pool.clone());

    // Server address
    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(db_pool) = db_pool {
        db_pool.close().await;
    }
    info!("👋 Server stopped");

    Ok(())
}

fn spawn_cache_sweeper(cache: MemoryCache) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            cache.cleanup_expired();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

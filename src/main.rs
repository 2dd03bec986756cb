use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rider_chat_backend::{
    app,
    config::{Config, StorageBackend},
    realtime::RoomHub,
    storage::{memory::MemoryChatStore, postgres::PgChatStore, redis::RedisClient, ChatStore},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rider_chat_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load();
    tracing::info!("Starting server in {} mode", config.server.environment);

    let store: Arc<dyn ChatStore> = match config.storage {
        StorageBackend::Postgres => {
            let db = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(&config.database_url())
                .await?;
            tracing::info!("Connected to PostgreSQL");

            // Run migrations
            sqlx::migrate!("./migrations").run(&db).await?;
            tracing::info!("Database migrations completed");

            Arc::new(PgChatStore::new(db))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            Arc::new(MemoryChatStore::new())
        }
    };

    // Redis relays fan-out between instances and keeps presence
    let relay = if config.redis.enabled {
        let redis = RedisClient::new(&config.redis_url()).await?;
        tracing::info!("Connected to Redis");
        Some(redis)
    } else {
        None
    };

    let hub = Arc::new(RoomHub::new(relay));
    tokio::spawn(hub.clone().run_relay());

    let state = AppState::new(store, hub, config.clone());
    state.groups.ensure_bootstrapped().await?;

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

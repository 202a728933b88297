use std::sync::Arc;

use kanban_live::config::ServerConfig;
use kanban_live::services::sweeper::spawn_sweep_task;
use kanban_live::state::AppState;
use kanban_live::store::memory::{MemoryAccessStore, MemoryPresenceStore, MemoryTaskStore};
use kanban_live::store::postgres::PgStore;
use kanban_live::store::SessionUser;
use kanban_live::{db, routes};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().expect("invalid configuration");

    let state = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = db::init_pool(database_url, config.db_max_connections)
                .await
                .expect("database init failed");
            let store = Arc::new(PgStore::new(pool));
            AppState::new(store.clone(), store.clone(), store, config.realtime)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            let tasks = Arc::new(MemoryTaskStore::new());
            let access = Arc::new(MemoryAccessStore::new());
            if let Ok(token) = std::env::var("DEV_SESSION_TOKEN") {
                seed_dev_board(&tasks, &access, &token).await;
            }
            AppState::new(tasks, Arc::new(MemoryPresenceStore::new()), access, config.realtime)
        }
    };

    let _sweeper = spawn_sweep_task(state.clone());

    let app = routes::app(state);
    let port = config.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "kanban-live listening");
    axum::serve(listener, app).await.expect("server failed");
}

/// Demo board reachable with `DEV_SESSION_TOKEN` when running in memory.
async fn seed_dev_board(tasks: &MemoryTaskStore, access: &MemoryAccessStore, token: &str) {
    let board_id = Uuid::new_v4();
    for name in ["Todo", "Doing", "Done"] {
        tasks.insert_column(board_id, name).await;
    }
    let user = SessionUser { id: Uuid::new_v4(), name: "dev".to_owned() };
    access.grant(user.id, board_id).await;
    access.insert_session(token, user).await;
    tracing::info!(%board_id, "dev board seeded");
}

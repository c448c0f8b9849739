mod db;
mod frame;
mod rate_limit;
mod routes;
mod services;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::rate_limit::{CounterStore, MemoryCounterStore, PgCounterStore};
use crate::services::chat::PgChatStore;
use crate::services::directory::PgDirectory;
use crate::services::presence::{MemoryPresenceStore, PgPresenceStore, PresenceStore};
use crate::services::whiteboard::PgDocumentStore;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    // Presence must live in the shared store so every instance behind the
    // load balancer sees the same occupancy; memory is a single-instance
    // escape hatch for local development.
    let presence: Arc<dyn PresenceStore> = match std::env::var("PRESENCE_BACKEND").as_deref() {
        Ok("memory") => {
            tracing::warn!("in-memory presence backend selected; single instance only");
            Arc::new(MemoryPresenceStore::new())
        }
        _ => Arc::new(PgPresenceStore::new(pool.clone())),
    };

    // Rate counters default to in-process; share them through Postgres
    // when strict limits matter across instances.
    let counters: Arc<dyn CounterStore> = match std::env::var("RATE_LIMIT_BACKEND").as_deref() {
        Ok("postgres") => Arc::new(PgCounterStore::new(pool.clone())),
        _ => Arc::new(MemoryCounterStore::new()),
    };

    let state = state::AppState::new(
        Arc::new(PgDirectory::new(pool.clone())),
        presence,
        Arc::new(PgDocumentStore::new(pool.clone())),
        Arc::new(PgChatStore::new(pool)),
        counters,
    );

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "inkroom listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("server failed");
}

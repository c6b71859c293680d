use std::net::SocketAddr;
use std::sync::Arc;

use study_intake_engine::assemble::ResultAssembler;
use study_intake_engine::audit::TracingAuditSink;
use study_intake_engine::config::EngineConfig;
use study_intake_engine::orchestrate::IntakeOrchestrator;
use study_intake_engine::store::InMemoryStore;
use study_intake_engine::wire::{router, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = Arc::new(InMemoryStore::new());
    let audit = Arc::new(TracingAuditSink);
    let config = EngineConfig::new();

    let orchestrator = Arc::new(IntakeOrchestrator::new(store.clone(), audit, config));
    let assembler = Arc::new(ResultAssembler::new(store.clone()));
    let state = AppState::new(store, orchestrator, assembler);

    let addr = std::env::var("INTAKE_ENGINE_ADDR")
        .ok()
        .and_then(|s| s.parse::<SocketAddr>().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

    tracing::info!(%addr, "study intake engine listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));
    axum::serve(listener, router(state))
        .await
        .unwrap_or_else(|e| panic!("server error: {e}"));
}

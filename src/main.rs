mod app;
mod auth;
mod config;
mod error;
mod images;
mod journal;
mod notify;
mod pastes;
mod state;
mod storage;

use crate::{app::build_app, notify::build_notifier, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "pastebin=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    // Journals are replayed here, before the listener binds.
    let app_state = AppState::init().await?;

    let notifier = build_notifier(app_state.config.mail.as_ref())?;
    let worker = app_state.outbox.clone().spawn_worker(notifier);

    let host = app_state.config.host.clone();
    let port = app_state.config.port;
    let result = app::serve(build_app(app_state), &host, port).await;
    worker.abort();
    result
}

use std::{env, sync::Arc};

mod api;
mod app;
mod auth;
mod autoclose;
mod flexjson;
mod types;
mod views;

use api::ApiClient;
use auth::SessionStore;
use autoclose::AutoCloseScheduler;
use types::{AppState, Config};

fn resolve_config() -> Config {
    let api_base_url = env::var("API_BASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "http://localhost:5000/".to_string());
    let tenant_id_fallback = env::var("TENANT_ID_FALLBACK")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "1".to_string());
    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    Config {
        api_base_url,
        tenant_id_fallback,
        port,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wa_console=info,tower_http=info".into()),
        )
        .init();

    let config = resolve_config();
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(api = %config.api_base_url, %addr, "starting wa-console");

    let state = Arc::new(AppState {
        api: ApiClient::new(&config.api_base_url),
        sessions: Arc::new(SessionStore::default()),
        auto_close: Arc::new(AutoCloseScheduler::default()),
        config,
    });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");
    axum::serve(listener, app::router(state))
        .await
        .expect("server runtime failure");
}

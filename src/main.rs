use clap::Parser;
use std::sync::Arc;
use stratus::constants::DEFAULT_UPSTREAM_BASE_URL;
use stratus::db::init_db;
use stratus::hardening::RetryPolicy;
use stratus::main_helper::{AppState, Args};
use stratus::persistence::ChatLocks;
use stratus::upstream::UpstreamClient;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "stratus=debug".into(),
    };

    // File logging alongside stdout
    let file_appender = tracing_appender::rolling::daily(".", "stratus.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    stratus::logging::setup_panic_hook();

    let args = Arc::new(Args::parse());

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let api_key = match std::env::var("OPENAI_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: OPENAI_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };
    let base_url = std::env::var("OPENAI_BASE_URL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string());
    let service_key = std::env::var("STRATUS_SERVICE_KEY")
        .ok()
        .filter(|v| !v.is_empty());

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let system_preamble = match stratus::conversation::load_system_preamble(&args.base_prompt).await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to load system preamble: {}", e);
            std::process::exit(1);
        }
    };

    let upstream = UpstreamClient::new(
        client,
        base_url,
        api_key,
        RetryPolicy::new(args.max_retries, 100),
    );

    let state = Arc::new(AppState {
        upstream,
        db,
        chat_locks: ChatLocks::new(),
        system_preamble,
        service_key,
        args: args.clone(),
    });

    let app = stratus::server::build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Stratus listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}

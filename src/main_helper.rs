use crate::db::DbPool;
use crate::persistence::ChatLocks;
use crate::upstream::UpstreamClient;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "stratus.db")]
    pub database: String,
    #[arg(long, default_value = "base_prompt.txt")]
    pub base_prompt: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
}

pub struct AppState {
    pub upstream: UpstreamClient,
    pub db: DbPool,
    pub chat_locks: ChatLocks,
    /// Preamble text, loaded once at boot with the tools note appended
    pub system_preamble: String,
    /// Required for account deletion; absence makes `DELETE /user` a 500
    pub service_key: Option<String>,
    pub args: Arc<Args>,
}

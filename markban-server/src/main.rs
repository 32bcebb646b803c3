use std::path::PathBuf;

use markban_server::config;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let config = config::load_config(&config_path);

    if let Err(e) = markban_server::run(config).await {
        log::error!("markban-server failed: {}", e);
        std::process::exit(1);
    }
}

use accel_ratelimit::{config::AppConfig, init_tracing, serve};
use std::env;
use std::process;

#[tokio::main]
async fn main() {
    init_tracing();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/accel.yaml".to_string());

    let config = match AppConfig::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            eprintln!("Usage: accel-ratelimit [config_file]");
            process::exit(1);
        }
    };

    if let Err(e) = serve(config).await {
        eprintln!("Server error: {}", e);
        process::exit(1);
    }
}

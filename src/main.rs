use std::sync::{Arc, Mutex};

use duraq::broker::{Engine, start_broker_server};
use duraq::config::load_config;
use duraq::utils::logging;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = load_config().expect("Failed to load configuration");
    logging::init("info");

    let addr = format!("{}:{}", config.broker.host, config.broker.port);
    let engine = Arc::new(Mutex::new(Engine::new()));
    start_broker_server(addr, engine, config.broker).await;
}

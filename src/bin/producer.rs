//! Producer role: publishes one persistent message to the configured
//! durable queue and waits for the broker's confirm before exiting.
//!
//! The message body is taken from the command line, defaulting to
//! "Hello World!".

use std::process::ExitCode;

use tracing::{error, info};

use duraq::config::load_config;
use duraq::publish::Publisher;
use duraq::transport::{Endpoint, Session, SessionOptions};
use duraq::utils::logging;
use duraq::wire::QueueDescriptor;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init("info");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let body = if args.is_empty() {
        "Hello World!".to_string()
    } else {
        args.join(" ")
    };

    let session = match Session::connect(
        Endpoint::from_settings(&config.broker),
        SessionOptions::from_settings(&config.connection),
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!("could not connect to broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    let queue = QueueDescriptor {
        name: config.queue.name.clone(),
        durable: config.queue.durable,
    };
    let result = async {
        let mut publisher = Publisher::bind(&session, queue).await?;
        publisher.publish_confirmed(body.as_bytes()).await
    }
    .await;

    let code = match result {
        Ok(receipt) => {
            info!(publish_id = %receipt.publish_id, "sent '{body}'");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("publish failed: {e}");
            ExitCode::FAILURE
        }
    };
    session.close().await;
    code
}

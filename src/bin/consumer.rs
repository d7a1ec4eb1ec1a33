//! Consumer role: runs the worker pool against the configured queue until
//! interrupted, then drains in-flight handlers and exits.
//!
//! The demo handler simulates work by sleeping one second per trailing dot
//! in the message body, so `task...` takes three seconds.

use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};

use duraq::config::load_config;
use duraq::consume::{ConsumeOptions, Delivery, consume};
use duraq::transport::{Endpoint, Session, SessionOptions};
use duraq::utils::error::HandlerError;
use duraq::utils::logging;
use duraq::wire::QueueDescriptor;

async fn handle(delivery: Delivery) -> Result<(), HandlerError> {
    let body = String::from_utf8_lossy(&delivery.payload).to_string();
    info!(
        attempt = delivery.attempt,
        redelivered = delivery.redelivered,
        "received '{body}'"
    );

    let dots = body.chars().rev().take_while(|c| *c == '.').count();
    tokio::time::sleep(Duration::from_secs(dots as u64)).await;

    info!("done '{body}'");
    Ok(())
}

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
    let options = ConsumeOptions::from_settings(&config.consumer);
    let subscription = match consume(&session, queue, handle, options).await {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("could not start consuming: {e}");
            session.close().await;
            return ExitCode::FAILURE;
        }
    };
    info!("waiting for messages, press Ctrl+C to exit");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            subscription.cancel().await;
            session.close().await;
            ExitCode::SUCCESS
        }
        reason = session.closed() => {
            error!("session closed: {reason}");
            ExitCode::FAILURE
        }
    }
}

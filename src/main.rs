//! Robot client - connects a robot controller to the Game Engine
//!
//! Runs the bundled demo game: one player switch and one admin-only light
//! per seat, logged instead of driving hardware.

mod demo;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ge_robot_client::config::{Config, LogFormat};
use ge_robot_client::lifecycle::LifecycleError;
use ge_robot_client::AUTH_FAILURE_EXIT_CODE;

use crate::demo::DemoGame;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    init_tracing(&config.log_level, config.log_format);

    info!("Starting robot client");
    info!(
        robot_id = %config.robot_id,
        client_id = %config.client_id,
        url = %config.ge_url,
        "Game Engine connection"
    );

    match ge_robot_client::run(config, DemoGame::default()).await {
        Ok(state) => {
            info!(reason = %state.reason, "Robot client stopped");
            Ok(())
        }
        Err(e) if matches!(e.downcast_ref::<LifecycleError>(), Some(LifecycleError::Auth(_))) => {
            error!(error = %e, "Credentials rejected, not retrying");
            std::process::exit(AUTH_FAILURE_EXIT_CODE);
        }
        Err(e) => Err(e),
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
    }
}

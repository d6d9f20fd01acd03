// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::process;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use rsu_core::{RsuConfig, RsuServices};

#[tokio::main]
pub async fn main() {
    // No subscriber yet, so configuration errors go straight to stderr.
    let config = match RsuConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("RSU | ERROR | {e}");
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("RSU | ERROR | {e}");
        process::exit(1);
    }
    debug!("Logging subsystem enabled");

    let handle = match RsuServices::new(config).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start RSU services: {}", e);
            process::exit(1);
        }
    };

    wait_for_shutdown().await;
    info!("Shutdown requested");

    if let Err(e) = handle.stop().await {
        error!("Error during shutdown: {}", e);
        process::exit(1);
    }
}

fn init_logging(log_level: &str) -> Result<(), String> {
    let env_filter = format!("hyper=off,{}", log_level.to_lowercase());
    let filter = EnvFilter::try_new(&env_filter)
        .map_err(|e| format!("could not parse log level {log_level:?}: {e}"))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .event_format(logger::Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("setting default subscriber failed: {e}"))
}

/// Resolves on Ctrl-C, or on SIGTERM where available.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for Ctrl-C: {}", e);
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}

//! aetherd - Aether relay daemon
//!
//! Wires the relay core to its gateways and runs until interrupted.
//! Exit codes: 0 on normal shutdown, 64 on invalid configuration,
//! 74 on I/O errors.

use aether_core::validate::{Validator, ValidatorConfig};
use aetherd::config::Config;
use aetherd::dispatch::Dispatcher;
use aetherd::gateway::http::HttpState;
use aetherd::gateway::{http, nip01};
use aetherd::relay::Relay;
use aetherd::server::{build_quic_endpoint, Server};
use aetherd::store::open_store;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXIT_CONFIG: u8 = 64;
const EXIT_IO: u8 = 74;

fn init_logging(config: &Config) {
    let default = if config.verbose { "aetherd=debug" } else { "aetherd=info" };
    let filter = EnvFilter::from_default_env().add_directive(
        default
            .parse()
            .expect("static logging directive"),
    );
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    info!("aetherd v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }
    let backend = match config.store_backend() {
        Ok(backend) => backend,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let store = match open_store(&backend, config.ttl_ns()) {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open store: {e}");
            return ExitCode::from(EXIT_IO);
        }
    };

    let validator = Validator::new(ValidatorConfig {
        max_future_skew_secs: config.max_skew_secs,
        min_pow_bits: config.min_pow_bits,
        ..Default::default()
    });
    let dispatcher = Arc::new(Dispatcher::new(config.outbox_capacity));
    let relay = Arc::new(Relay::new(
        validator,
        store.clone(),
        dispatcher,
        config.rate_limit_epm,
    ));

    // Bind every enabled surface up front so port clashes fail fast.
    let native = match TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {e}", config.listen);
            return ExitCode::from(EXIT_IO);
        }
    };
    let quic = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => match build_quic_endpoint(config.quic_listen, cert, key) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                error!("failed to start QUIC endpoint: {e}");
                return ExitCode::from(EXIT_IO);
            }
        },
        _ => {
            info!("no TLS material; QUIC disabled");
            None
        }
    };

    let server = Arc::new(Server::new(config.clone(), relay.clone()));

    if !config.no_nip01 {
        let listener = match TcpListener::bind(config.nip01_listen).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind {}: {e}", config.nip01_listen);
                return ExitCode::from(EXIT_IO);
            }
        };
        tokio::spawn(nip01::run(
            listener,
            relay.clone(),
            config.outbox_capacity,
            server.shutdown_handle(),
        ));
    }

    if !config.no_http {
        let listener = match TcpListener::bind(config.http_listen).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind {}: {e}", config.http_listen);
                return ExitCode::from(EXIT_IO);
            }
        };
        let state = HttpState::new(
            relay.clone(),
            config.outbox_capacity,
            Duration::from_secs(config.hello_timeout_secs),
            config.noise_required,
            server.shutdown_handle(),
        );
        tokio::spawn(http::run(listener, state));
    }

    {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
            server.shutdown();
        });
    }

    if let Err(e) = server.run(native, quic).await {
        error!("server error: {e}");
        return ExitCode::from(EXIT_IO);
    }

    let stats = server.stats();
    info!(
        "exiting: {} accepted, {} rejected, {} duplicates",
        stats.events.accepted, stats.events.rejected, stats.events.duplicates
    );
    ExitCode::SUCCESS
}
